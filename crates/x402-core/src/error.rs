use thiserror::Error;

/// Errors surfaced by the payment core.
///
/// The taxonomy follows meaning, not implementation type: the gateway maps
/// each variant onto an HTTP status (400 for a malformed envelope, 402 for
/// everything payment-shaped, 500 for configuration faults).
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The payment header was present but not decodable. Terminal 400.
    #[error("Invalid payment payload encoding")]
    EnvelopeMalformed,

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Verification rejected the payment; the reason names the failing check.
    #[error("Payment verification failed: {0}")]
    VerificationFailed(String),

    /// The nonce claim was lost to a concurrent or earlier settlement.
    #[error("Nonce already used or settlement in progress")]
    NonceContended,

    #[error("Settlement failed: {0}")]
    SettlementFailed(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("chain error: {0}")]
    ChainError(String),

    #[error("signature error: {0}")]
    SignatureError(String),

    #[error("http error: {0}")]
    HttpError(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
