//! The chain-adapter seam and the dispatcher.
//!
//! Every settlement path exposes the same narrow capability set; the
//! dispatcher is a pure selector over the network descriptor.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PaymentError;
use crate::network::{NetworkDescriptor, VmKind};
use crate::nonce::NonceCoordinator;
use crate::payment::PaymentPayload;
use crate::response::{SettlementReceipt, VerifyOutcome};
use crate::route::RouteDescriptor;
use crate::scheme_evm::EvmLocalAdapter;
use crate::scheme_facilitator::EvmFacilitatorAdapter;
use crate::scheme_svm::{SvmFacilitatorAdapter, SvmSigner};

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Check the payment against the route and network. Infrastructure
    /// failures are errors; rejected payments are `VerifyOutcome::invalid`.
    async fn verify(
        &self,
        payload: &PaymentPayload,
        route: &RouteDescriptor,
        network: &NetworkDescriptor,
    ) -> Result<VerifyOutcome, PaymentError>;

    /// Submit the payment for settlement and wait for the receipt.
    async fn settle(
        &self,
        payload: &PaymentPayload,
        route: &RouteDescriptor,
        network: &NetworkDescriptor,
    ) -> Result<SettlementReceipt, PaymentError>;

    /// Gateway-side replay key for this payment. `None` means an external
    /// facilitator owns replay protection.
    fn derive_nonce_key(&self, payload: &PaymentPayload) -> Option<String>;
}

/// Owns one adapter per settlement path and routes each payment to the right
/// one:
///
/// | vm  | facilitator | path            |
/// |-----|-------------|-----------------|
/// | evm | none        | EVM-local       |
/// | evm | present     | EVM-facilitator |
/// | svm | (ignored)   | SVM-facilitator |
pub struct Dispatcher {
    evm_local: EvmLocalAdapter,
    evm_facilitator: EvmFacilitatorAdapter,
    svm: SvmFacilitatorAdapter,
}

impl Dispatcher {
    pub fn new(
        nonces: NonceCoordinator,
        http_client: reqwest::Client,
        svm_signer: Arc<SvmSigner>,
    ) -> Self {
        Self {
            evm_local: EvmLocalAdapter::new(nonces),
            evm_facilitator: EvmFacilitatorAdapter::new(http_client),
            svm: SvmFacilitatorAdapter::new(svm_signer),
        }
    }

    pub fn select(&self, network: &NetworkDescriptor) -> &dyn ChainAdapter {
        match (network.vm, &network.facilitator) {
            (VmKind::Evm, None) => &self.evm_local,
            (VmKind::Evm, Some(_)) => &self.evm_facilitator,
            (VmKind::Svm, _) => &self.svm,
        }
    }
}
