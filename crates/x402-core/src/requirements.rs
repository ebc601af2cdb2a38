//! 402 response construction: enumerate active networks into `accepts`
//! entries, plus the enriched `PAYMENT-REQUIRED` header copy.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::{MAX_TIMEOUT_SECONDS, SCHEME_EXACT, X402_VERSION};
use crate::network::{scaled_amount, NetworkDescriptor, NetworkRegistry, VmKind};
use crate::route::RouteDescriptor;

/// One entry in the `accepts` array. The enrichment fields are populated
/// only in the header copy of the 402 payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAccept {
    pub scheme: String,
    pub network: String,
    pub amount: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub asset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount_required: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub url: String,
    pub description: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    pub x402_version: u32,
    pub accepts: Vec<PaymentAccept>,
    pub resource: ResourceInfo,
    pub extensions: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A fully-built 402 payload: JSON body plus the base64 header value.
#[derive(Debug, Clone)]
pub struct PaymentRequired {
    pub body: PaymentRequiredBody,
    pub header_base64: String,
}

/// Advertised recipient for a network, per settlement path. `None` drops the
/// network from the 402 silently.
fn advertised_pay_to(network: &NetworkDescriptor, route: &RouteDescriptor) -> Option<String> {
    match (network.vm, &network.facilitator) {
        (VmKind::Evm, Some(fac)) => fac
            .facilitator_contract
            .clone()
            .or_else(|| route.pay_to.clone()),
        (VmKind::Evm, None) => route.pay_to.clone(),
        (VmKind::Svm, _) => route.pay_to_sol.clone(),
    }
}

fn accept_extra(network: &NetworkDescriptor, svm_fee_payer: Option<&str>) -> Option<Value> {
    match network.vm {
        // Clients build the EIP-712 domain from these.
        VmKind::Evm => Some(json!({
            "name": network.token.display_name,
            "version": network.token.domain_version,
        })),
        VmKind::Svm => svm_fee_payer.map(|fee_payer| json!({ "feePayer": fee_payer })),
    }
}

/// Build the 402 payload for a route.
///
/// `svm_fee_payer` is the gateway's co-signer address, resolved lazily once
/// by the caller; when absent, SVM networks are omitted.
pub fn build_payment_required(
    route: &RouteDescriptor,
    networks: &NetworkRegistry,
    svm_fee_payer: Option<&str>,
    resource_url: &str,
) -> PaymentRequired {
    let mut accepts = Vec::new();
    for network in networks.active() {
        let amount = match scaled_amount(&route.price_atomic, network.token.decimals) {
            Ok(a) => a.to_string(),
            Err(e) => {
                tracing::warn!(network = %network.network_id, error = %e, "skipping network with unusable pricing");
                continue;
            }
        };
        let Some(pay_to) = advertised_pay_to(network, route) else {
            continue;
        };
        let extra = accept_extra(network, svm_fee_payer);
        if network.vm == VmKind::Svm && extra.is_none() {
            continue;
        }
        accepts.push(PaymentAccept {
            scheme: SCHEME_EXACT.to_string(),
            network: network.network_id.clone(),
            amount,
            pay_to,
            max_timeout_seconds: MAX_TIMEOUT_SECONDS,
            asset: network.token.address.clone(),
            extra,
            max_amount_required: None,
            resource: None,
            description: None,
            mime_type: None,
        });
    }

    let resource = ResourceInfo {
        url: resource_url.to_string(),
        description: route.description.clone(),
        mime_type: route.mime_type.clone(),
    };
    let extensions = json!({
        "payment-identifier": { "supported": true, "required": false },
    });

    let enriched: Vec<PaymentAccept> = accepts
        .iter()
        .cloned()
        .map(|mut accept| {
            accept.max_amount_required = Some(accept.amount.clone());
            accept.resource = Some(resource_url.to_string());
            accept.description = Some(route.description.clone());
            accept.mime_type = Some(route.mime_type.clone());
            accept
        })
        .collect();

    let header_body = PaymentRequiredBody {
        x402_version: X402_VERSION,
        accepts: enriched,
        resource: resource.clone(),
        extensions: extensions.clone(),
        error: None,
        reason: None,
    };
    let header_base64 = base64::engine::general_purpose::STANDARD.encode(
        serde_json::to_string(&header_body).unwrap_or_default(),
    );

    PaymentRequired {
        body: PaymentRequiredBody {
            x402_version: X402_VERSION,
            accepts,
            resource,
            extensions,
            error: None,
            reason: None,
        },
        header_base64,
    }
}
