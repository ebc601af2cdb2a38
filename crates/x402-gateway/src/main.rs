use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use x402_core::{KvStore, MemoryKvStore, NetworkRegistry, RouteRegistry, SqliteKvStore};
use x402_gateway::{config::GatewayConfig, routes, state::AppState};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env();
    let port = config.port;
    let bind = config.bind.clone();

    // Registries are built once at startup; credential presence is re-read
    // from the environment per request.
    let networks = NetworkRegistry::from_env();
    let routes_registry = RouteRegistry::from_env();

    let active: Vec<&str> = networks.active().map(|n| n.network_id.as_str()).collect();
    tracing::info!("Starting x402-gateway on {bind}:{port}");
    tracing::info!("Active networks: {active:?}");
    tracing::info!(
        "Configured routes: {:?}",
        routes_registry
            .all()
            .iter()
            .map(|r| r.key.as_str())
            .collect::<Vec<_>>()
    );
    if routes_registry.all().is_empty() {
        tracing::warn!("No routes configured — set <PREFIX>_BACKEND_URL to enable one");
    }

    let store: Arc<dyn KvStore> = if config.kv_path == "memory" {
        Arc::new(MemoryKvStore::new())
    } else {
        match SqliteKvStore::open(&config.kv_path) {
            Ok(store) => {
                tracing::info!("KV store: SQLite at {}", config.kv_path);
                Arc::new(store)
            }
            Err(e) => {
                // No in-memory fallback: losing nonce records on restart
                // would allow replay of recently-settled payments.
                tracing::error!("Failed to open KV store at {}: {e}", config.kv_path);
                std::process::exit(1);
            }
        }
    };

    let state = AppState::new(config, networks, routes_registry, store);
    let state_data = web::Data::new(state);

    HttpServer::new(move || {
        App::new()
            .app_data(state_data.clone())
            .app_data(web::PayloadConfig::new(10 * 1024 * 1024))
            .wrap(Logger::default())
            .configure(routes::health::configure)
            .configure(routes::gateway::configure)
    })
    .bind((bind.as_str(), port))?
    .run()
    .await
}
