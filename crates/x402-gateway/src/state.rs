use std::sync::Arc;

use x402_core::{
    Dispatcher, IdempotencyCache, KvStore, NetworkRegistry, NonceCoordinator, RouteRegistry,
    SvmSigner,
};

use crate::config::GatewayConfig;

/// Root of the gateway's shared services. Everything formerly module-global
/// in spirit (signer singleton, RPC client caches, KV handles) lives here and
/// is injected explicitly.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub networks: Arc<NetworkRegistry>,
    pub routes: Arc<RouteRegistry>,
    pub nonces: NonceCoordinator,
    pub idempotency: IdempotencyCache,
    pub dispatcher: Arc<Dispatcher>,
    pub svm_signer: Arc<SvmSigner>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        networks: NetworkRegistry,
        routes: RouteRegistry,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to create HTTP client");

        let nonces = NonceCoordinator::new(store.clone());
        let idempotency = IdempotencyCache::new(store);
        let svm_signer = Arc::new(SvmSigner::new());
        let dispatcher = Arc::new(Dispatcher::new(
            nonces.clone(),
            http_client.clone(),
            svm_signer.clone(),
        ));

        Self {
            config: Arc::new(config),
            networks: Arc::new(networks),
            routes: Arc::new(routes),
            nonces,
            idempotency,
            dispatcher,
            svm_signer,
            http_client,
        }
    }
}
