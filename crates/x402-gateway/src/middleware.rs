//! The payment state machine wrapping every monetized route.
//!
//! ```text
//! decode envelope → (no header: 402 PAYMENT-REQUIRED)
//!                 → (bad base64/JSON: 400)
//! payment-id cache hit? → (yes: proceed with cached PAYMENT-RESPONSE)
//! resolve network → (unknown: 402 Unsupported network)
//! verify → (invalid: 402 with reason + rebuilt header)
//! claim nonce → (lost: 402 nonce contended)
//! settle → (fail: release nonce, 402 with reason)
//!        → (ok: confirm nonce, cache idempotency, proceed)
//! ```

use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse};
use x402_core::{
    build_payment_required, decode_envelope, extract_payment_id, payment_response_header,
    CachedResponse, Dispatcher, IdempotencyCache, NetworkDescriptor, NonceCoordinator,
    NonceMetadata, PaymentError, PaymentPayload, RouteDescriptor, SettlementReceipt, VmKind,
    HEADER_PAYMENT_REQUIRED, HEADER_PAYMENT_SIGNATURE, HEADER_X_PAYMENT,
};

use crate::cors;
use crate::state::AppState;

/// Outcome of the payment gate: an early response, or a context the backend
/// proxy consumes.
pub enum PaymentGate {
    Proceed(PaymentContext),
    Respond(HttpResponse),
}

/// Settlement facts attached to a paid request for the rest of its life.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub receipt: SettlementReceipt,
    /// Exact `PAYMENT-RESPONSE` value; byte-stable across idempotent retries.
    pub response_header: String,
    pub payer: Option<String>,
}

/// First non-empty value among the two accepted header names,
/// `payment-signature` preferred.
fn extract_payment_header(req: &HttpRequest) -> Option<String> {
    for name in [HEADER_PAYMENT_SIGNATURE, HEADER_X_PAYMENT] {
        if let Some(value) = req.headers().get(name) {
            if let Ok(text) = value.to_str() {
                if !text.trim().is_empty() {
                    return Some(text.to_string());
                }
            }
        }
    }
    None
}

/// Reconstruct the resource URL advertised in 402 payloads.
fn resource_url(req: &HttpRequest) -> String {
    let info = req.connection_info();
    match req.uri().query() {
        Some(query) => format!("{}://{}{}?{query}", info.scheme(), info.host(), req.uri().path()),
        None => format!("{}://{}{}", info.scheme(), info.host(), req.uri().path()),
    }
}

/// Build a 402 with the route's accepts, optionally annotated with an error
/// and reason.
pub async fn payment_required_response(
    state: &AppState,
    route: &RouteDescriptor,
    req: &HttpRequest,
    error: Option<&str>,
    reason: Option<String>,
) -> HttpResponse {
    // The SVM co-signer address is advertised as feePayer; resolved lazily
    // once, then served from the singleton.
    let fee_payer = if state.networks.active().any(|n| n.vm == VmKind::Svm) {
        state.svm_signer.fee_payer().await.ok()
    } else {
        None
    };

    let mut built =
        build_payment_required(route, &state.networks, fee_payer.as_deref(), &resource_url(req));
    built.body.error = error.map(str::to_owned);
    built.body.reason = reason;

    cors::apply(&mut HttpResponse::PaymentRequired())
        .insert_header((HEADER_PAYMENT_REQUIRED, built.header_base64))
        .json(built.body)
}

fn bad_envelope_response() -> HttpResponse {
    cors::apply(&mut HttpResponse::BadRequest()).json(serde_json::json!({
        "error": "Invalid payment payload encoding",
    }))
}

/// Run the payment state machine for one request against one route.
pub async fn settle_request(
    req: &HttpRequest,
    route: &RouteDescriptor,
    state: &AppState,
) -> PaymentGate {
    let Some(header) = extract_payment_header(req) else {
        return PaymentGate::Respond(payment_required_response(state, route, req, None, None).await);
    };

    let payload = match decode_envelope(&header) {
        Ok(payload) => payload,
        Err(_) => return PaymentGate::Respond(bad_envelope_response()),
    };

    let payment_id = extract_payment_id(&payload);
    if let Some(pid) = &payment_id {
        if let Some(record) = state.idempotency.get(pid).await {
            tracing::info!(payment_id = %pid, "idempotency hit, skipping settlement");
            return PaymentGate::Proceed(PaymentContext {
                payer: record.response.settlement.payer.clone(),
                response_header: record.response.payment_response_header,
                receipt: record.response.settlement,
            });
        }
    }

    let Some(network) = state.networks.resolve(&payload.network) else {
        return PaymentGate::Respond(
            payment_required_response(
                state,
                route,
                req,
                Some("Unsupported network"),
                Some(format!("Network '{}' is not supported", payload.network)),
            )
            .await,
        );
    };

    let adapter = state.dispatcher.select(network);

    let outcome = match adapter.verify(&payload, route, network).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(network = %network.network_id, error = %e, "verification errored");
            return PaymentGate::Respond(
                payment_required_response(
                    state,
                    route,
                    req,
                    Some("Payment verification failed"),
                    Some(verification_reason(e)),
                )
                .await,
            );
        }
    };
    if !outcome.is_valid {
        let reason = outcome.invalid_reason.unwrap_or_else(|| "rejected".to_string());
        tracing::warn!(network = %network.network_id, reason = %reason, "payment rejected");
        return PaymentGate::Respond(
            payment_required_response(
                state,
                route,
                req,
                Some("Payment verification failed"),
                Some(reason),
            )
            .await,
        );
    }

    let meta = NonceMetadata {
        network: network.network_id.clone(),
        payer: outcome.payer.clone().unwrap_or_default(),
        route: route.key.clone(),
        vm: network.vm.as_str().to_string(),
    };

    // A Some key means this gateway owns replay protection for the payment;
    // claiming it is the license to settle.
    let nonce_key = adapter.derive_nonce_key(&payload);
    if let Some(key) = &nonce_key {
        if !state.nonces.claim(key, &meta).await {
            tracing::warn!(nonce = %key, "nonce claim lost");
            return PaymentGate::Respond(
                payment_required_response(
                    state,
                    route,
                    req,
                    Some("Payment verification failed"),
                    Some("Nonce already used or settlement in progress".to_string()),
                )
                .await,
            );
        }
    }

    // Settlement and the nonce promotion/rollback run on a detached task: a
    // client disconnect drops this handler future, but side effects may
    // already be committed on-chain and must still be recorded.
    let settlement = tokio::spawn(settle_and_finalize(
        state.dispatcher.clone(),
        state.nonces.clone(),
        state.idempotency.clone(),
        payload,
        route.clone(),
        network.clone(),
        nonce_key,
        meta,
        payment_id,
    ));

    match settlement.await {
        Ok(Ok(context)) => PaymentGate::Proceed(context),
        Ok(Err(e)) => {
            tracing::error!(network = %network.network_id, error = %e, "settlement failed");
            PaymentGate::Respond(
                payment_required_response(
                    state,
                    route,
                    req,
                    Some("Settlement failed"),
                    Some(e.to_string()),
                )
                .await,
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "settlement task aborted");
            PaymentGate::Respond(
                payment_required_response(
                    state,
                    route,
                    req,
                    Some("Settlement failed"),
                    Some("settlement task aborted".to_string()),
                )
                .await,
            )
        }
    }
}

/// Settle, then promote the nonce and cache the idempotency record; on
/// failure release the claim exactly once before surfacing the error.
#[allow(clippy::too_many_arguments)]
async fn settle_and_finalize(
    dispatcher: Arc<Dispatcher>,
    nonces: NonceCoordinator,
    idempotency: IdempotencyCache,
    payload: PaymentPayload,
    route: RouteDescriptor,
    network: NetworkDescriptor,
    nonce_key: Option<String>,
    meta: NonceMetadata,
    payment_id: Option<String>,
) -> Result<PaymentContext, PaymentError> {
    let adapter = dispatcher.select(&network);
    let receipt = match adapter.settle(&payload, &route, &network).await {
        Ok(receipt) => receipt,
        Err(e) => {
            if let Some(key) = &nonce_key {
                nonces.release(key).await;
            }
            return Err(e);
        }
    };

    if let Some(key) = &nonce_key {
        nonces.confirm(key, &meta, &receipt).await;
    }

    let response_header = payment_response_header(&receipt);
    if let Some(pid) = &payment_id {
        idempotency
            .put(
                pid,
                CachedResponse {
                    payment_response_header: response_header.clone(),
                    settlement: receipt.clone(),
                },
            )
            .await;
    }

    Ok(PaymentContext {
        payer: receipt.payer.clone(),
        response_header,
        receipt,
    })
}

/// Render a verification-time error as a 402 reason. Missing configuration
/// keeps the env var name so operators can act on the reason string.
fn verification_reason(e: PaymentError) -> String {
    match e {
        PaymentError::ConfigError(msg) => msg,
        other => other.to_string(),
    }
}
