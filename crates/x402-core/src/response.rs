use base64::Engine;
use serde::{Deserialize, Serialize};

/// Outcome of a path-specific verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl VerifyOutcome {
    pub fn valid(payer: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            payer: Some(payer.into()),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason.into()),
            payer: None,
        }
    }

    pub fn invalid_with_payer(reason: impl Into<String>, payer: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason.into()),
            payer: Some(payer.into()),
        }
    }
}

/// Result of a successful settlement, whichever path produced it.
///
/// `block_number` stays `null` on the facilitator and SVM paths; only
/// EVM-local settlement observes a mined block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub tx_hash: String,
    pub network: String,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facilitator: Option<String>,
}

/// Build the `PAYMENT-RESPONSE` header value:
/// `base64(JSON({success, txHash, network, blockNumber, facilitator?}))`.
pub fn payment_response_header(receipt: &SettlementReceipt) -> String {
    let mut body = serde_json::json!({
        "success": true,
        "txHash": receipt.tx_hash,
        "network": receipt.network,
        "blockNumber": receipt.block_number,
    });
    if let Some(facilitator) = &receipt.facilitator {
        body["facilitator"] = serde_json::Value::String(facilitator.clone());
    }
    base64::engine::general_purpose::STANDARD.encode(body.to_string())
}
