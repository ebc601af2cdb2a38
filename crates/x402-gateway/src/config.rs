use std::env;

const DEFAULT_PORT: u16 = 4021;
const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_KV_PATH: &str = "./x402-kv.db";

/// Gateway process configuration. Network and route tables are built
/// separately by their registries; secrets stay in the environment and are
/// read at use time.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: String,
    /// SQLite path for the nonce/idempotency store, or `memory` for the
    /// in-process store (single-replica dev only).
    pub kv_path: String,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let bind = env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND.to_string());
        let kv_path = env::var("X402_KV_PATH").unwrap_or_else(|_| DEFAULT_KV_PATH.to_string());

        if kv_path == "memory" {
            tracing::warn!(
                "X402_KV_PATH=memory — nonce records are lost on restart, enabling replay \
                 of recently-settled payments. Use a file path in production."
            );
        }

        Self {
            port,
            bind,
            kv_path,
        }
    }
}
