/// x402 protocol version spoken by this gateway.
pub const X402_VERSION: u32 = 2;

/// Payment scheme honored by every settlement path.
pub const SCHEME_EXACT: &str = "exact";

/// Ingress header carrying the base64 payment envelope (preferred name).
pub const HEADER_PAYMENT_SIGNATURE: &str = "payment-signature";

/// Ingress header carrying the base64 payment envelope (alternate name).
pub const HEADER_X_PAYMENT: &str = "x-payment";

/// Egress header on 402 responses.
pub const HEADER_PAYMENT_REQUIRED: &str = "PAYMENT-REQUIRED";

/// Egress header on successfully paid responses.
pub const HEADER_PAYMENT_RESPONSE: &str = "PAYMENT-RESPONSE";

/// Payer identity header, forwarded verbatim to the backend.
pub const HEADER_PAYER: &str = "x-x402-payer";

/// Advertised payment validity window in seconds.
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;

/// TTL of a pending nonce claim. A settler that crashes mid-flight frees the
/// nonce after this window.
pub const NONCE_PENDING_TTL_SECS: u64 = 3600;

/// TTL of a confirmed nonce record (7 days).
pub const NONCE_CONFIRMED_TTL_SECS: u64 = 604_800;

/// TTL of an idempotency record.
pub const IDEMPOTENCY_TTL_SECS: u64 = 3600;

/// KV key prefix for nonce records.
pub const NONCE_KEY_PREFIX: &str = "x402:nonce:";

/// KV key prefix for idempotency records.
pub const IDEMPOTENCY_KEY_PREFIX: &str = "x402:idempotency:";

/// Reference decimal scale of `priceAtomic` route pricing.
pub const PRICE_ATOMIC_DECIMALS: u32 = 6;

/// Env var holding the base58 key of the SVM co-signing facilitator.
pub const SOLANA_FACILITATOR_KEY_ENV: &str = "SOLANA_FACILITATOR_PRIVATE_KEY";

/// Env var holding the hex key used to submit EVM settlement transactions.
pub const SETTLEMENT_KEY_ENV: &str = "SETTLEMENT_PRIVATE_KEY";
