use alloy::primitives::{Address, B256};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::X402_VERSION;
use crate::error::PaymentError;

fn default_version() -> u32 {
    X402_VERSION
}

/// Wire-format payment envelope, carried base64-encoded in the
/// `Payment-Signature` (or `X-Payment`) header.
///
/// `scheme` and `network` default to empty strings when absent so a
/// syntactically valid envelope always decodes; the missing field then fails
/// verification with a specific reason instead of a blanket 400.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    #[serde(default = "default_version")]
    pub x402_version: u32,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub network: String,
    /// Scheme-specific body, parsed per settlement path.
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// EIP-3009 authorization record inside an `exact` EVM payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmAuthorization {
    pub from: Address,
    pub to: Address,
    /// Token amount in base units, decimal string (uint256 on the wire).
    pub value: String,
    #[serde(with = "u64_lenient")]
    pub valid_after: u64,
    #[serde(with = "u64_lenient")]
    pub valid_before: u64,
    pub nonce: B256,
}

/// `exact` scheme body for EVM networks: a signed EIP-3009 authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmPayload {
    pub authorization: EvmAuthorization,
    pub signature: String,
}

/// `exact` scheme body for SVM networks: a base64-encoded, client-partially-
/// signed transaction awaiting the facilitator's co-signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvmPayload {
    pub transaction: String,
}

impl ExactEvmPayload {
    pub fn from_value(body: &Value) -> Option<Self> {
        serde_json::from_value(body.clone()).ok()
    }
}

impl SvmPayload {
    pub fn from_value(body: &Value) -> Option<Self> {
        serde_json::from_value(body.clone()).ok()
    }
}

/// Decode a payment header value: standard-alphabet base64 (padding required)
/// wrapping UTF-8 JSON. Any decode or parse failure is terminal.
pub fn decode_envelope(header: &str) -> Result<PaymentPayload, PaymentError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(header.trim())
        .map_err(|_| PaymentError::EnvelopeMalformed)?;
    serde_json::from_slice(&decoded).map_err(|_| PaymentError::EnvelopeMalformed)
}

/// Extract a client-chosen payment identifier from either recognized
/// location. A malformed identifier is treated as absent, never an error.
pub fn extract_payment_id(payload: &PaymentPayload) -> Option<String> {
    fn from_extensions(ext: &Value) -> Option<String> {
        ext.get("payment-identifier")?
            .get("paymentId")?
            .as_str()
            .map(str::to_owned)
    }

    payload
        .extensions
        .as_ref()
        .and_then(from_extensions)
        .or_else(|| payload.payload.get("extensions").and_then(from_extensions))
        .filter(|id| is_valid_payment_id(id))
}

/// 16-128 chars of `[A-Za-z0-9_-]`.
pub fn is_valid_payment_id(id: &str) -> bool {
    (16..=128).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Clients in the wild send `validAfter`/`validBefore` as either JSON numbers
/// or decimal strings; accept both, emit numbers.
mod u64_lenient {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(n),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use serde_json::json;

    fn encode(value: &Value) -> String {
        base64::engine::general_purpose::STANDARD.encode(value.to_string())
    }

    #[test]
    fn test_decode_envelope_roundtrip() {
        let header = encode(&json!({
            "x402Version": 2,
            "scheme": "exact",
            "network": "eip155:8453",
            "payload": {"transaction": "AQID"},
        }));
        let payload = decode_envelope(&header).unwrap();
        assert_eq!(payload.x402_version, 2);
        assert_eq!(payload.scheme, "exact");
        assert_eq!(payload.network, "eip155:8453");
    }

    #[test]
    fn test_decode_envelope_rejects_bad_base64() {
        assert!(matches!(
            decode_envelope("invalid!!!"),
            Err(PaymentError::EnvelopeMalformed)
        ));
    }

    #[test]
    fn test_decode_envelope_rejects_non_json() {
        let header = base64::engine::general_purpose::STANDARD.encode("not json");
        assert!(matches!(
            decode_envelope(&header),
            Err(PaymentError::EnvelopeMalformed)
        ));
    }

    #[test]
    fn test_decode_envelope_defaults_missing_fields() {
        // Valid JSON without scheme/network decodes; the gaps fail later
        // with specific verification reasons.
        let header = encode(&json!({"payload": {}}));
        let payload = decode_envelope(&header).unwrap();
        assert_eq!(payload.scheme, "");
        assert_eq!(payload.network, "");
        assert_eq!(payload.x402_version, 2);
    }

    #[test]
    fn test_evm_authorization_accepts_string_timestamps() {
        let auth: EvmAuthorization = serde_json::from_value(json!({
            "from": "0x1111111111111111111111111111111111111111",
            "to": "0x2222222222222222222222222222222222222222",
            "value": "10000",
            "validAfter": "0",
            "validBefore": "9999999999",
            "nonce": "0x0000000000000000000000000000000000000000000000000000000000000001",
        }))
        .unwrap();
        assert_eq!(auth.valid_after, 0);
        assert_eq!(auth.valid_before, 9_999_999_999);
    }

    #[test]
    fn test_extract_payment_id_top_level() {
        let payload = decode_envelope(&encode(&json!({
            "scheme": "exact",
            "network": "eip155:8453",
            "payload": {},
            "extensions": {"payment-identifier": {"paymentId": "test-payment-id-12345678"}},
        })))
        .unwrap();
        assert_eq!(
            extract_payment_id(&payload).as_deref(),
            Some("test-payment-id-12345678")
        );
    }

    #[test]
    fn test_extract_payment_id_nested_in_payload() {
        let payload = decode_envelope(&encode(&json!({
            "scheme": "exact",
            "network": "eip155:8453",
            "payload": {
                "extensions": {"payment-identifier": {"paymentId": "abcdefghijklmnop"}},
            },
        })))
        .unwrap();
        assert_eq!(
            extract_payment_id(&payload).as_deref(),
            Some("abcdefghijklmnop")
        );
    }

    #[test]
    fn test_extract_payment_id_rejects_malformed() {
        for bad in ["short", "has space in the identifier", "bad!chars#here$$"] {
            let payload = decode_envelope(&encode(&json!({
                "payload": {},
                "extensions": {"payment-identifier": {"paymentId": bad}},
            })))
            .unwrap();
            assert_eq!(extract_payment_id(&payload), None, "accepted {bad:?}");
        }
    }

    #[test]
    fn test_payment_id_length_bounds() {
        assert!(is_valid_payment_id(&"a".repeat(16)));
        assert!(is_valid_payment_id(&"a".repeat(128)));
        assert!(!is_valid_payment_id(&"a".repeat(15)));
        assert!(!is_valid_payment_id(&"a".repeat(129)));
    }
}
