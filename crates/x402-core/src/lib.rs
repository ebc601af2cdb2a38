//! x402 payment protocol core for the gateway.
//!
//! Clients attach a signed micropayment authorization to ordinary HTTP
//! requests; this crate decodes the payment envelope, dispatches it to one of
//! three settlement paths, and coordinates the durable nonce and idempotency
//! state that makes retries replay-safe:
//!
//! - **EVM-local** ([`scheme_evm::EvmLocalAdapter`]) — EIP-3009
//!   `transferWithAuthorization`, verified and broadcast by the gateway
//! - **EVM-facilitator** ([`scheme_facilitator::EvmFacilitatorAdapter`]) —
//!   verify/settle delegated to an external HTTP facilitator
//! - **SVM-facilitator** ([`scheme_svm::SvmFacilitatorAdapter`]) — the
//!   gateway co-signs client-partially-signed SPL-token transfers

// Protocol surface
pub mod constants;
pub mod error;
pub mod payment;
pub mod requirements;
pub mod response;

// Configuration registries
pub mod network;
pub mod route;

// Durable coordination
pub mod idempotency;
pub mod nonce;
pub mod store;

// Settlement paths
pub mod eip712;
pub mod erc3009;
pub mod scheme;
pub mod scheme_evm;
pub mod scheme_facilitator;
pub mod scheme_svm;

use alloy::sol;

// EIP-3009 authorization struct; sol! derives SolStruct, providing
// eip712_signing_hash().
sol! {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

// EIP-3009 token surface used on-chain.
sol! {
    #[sol(rpc)]
    interface Eip3009Token {
        function balanceOf(address owner) external view returns (uint256);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

// Re-exports
pub use constants::*;
pub use error::PaymentError;
pub use idempotency::{CachedResponse, IdempotencyCache, IdempotencyRecord};
pub use network::{
    scaled_amount, FacilitatorDescriptor, NetworkDescriptor, NetworkRegistry, TokenDescriptor,
    VmKind,
};
pub use nonce::{NonceCoordinator, NonceMetadata, NonceRecord, NonceStatus};
pub use payment::{decode_envelope, extract_payment_id, PaymentPayload};
pub use requirements::{build_payment_required, PaymentAccept, PaymentRequired, PaymentRequiredBody};
pub use response::{payment_response_header, SettlementReceipt, VerifyOutcome};
pub use route::{parse_price_atomic, RouteDescriptor, RouteRegistry};
pub use scheme::{ChainAdapter, Dispatcher};
pub use scheme_svm::SvmSigner;
pub use store::{KvStore, MemoryKvStore, SqliteKvStore, StoreError};
