//! Z-Recon Service - payment and subscription reconciliation
//!
//! This is the main entry point for the z-recon service.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use z_recon_service::catalog::{load_catalog, seed};
use z_recon_service::maintenance::spawn_ledger_pruner;
use z_recon_service::{create_router, AppState, ServiceConfig, StoreBackend};
use z_recon_store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,z_recon=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Z-Recon Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        store_backend = ?config.store_backend,
        stripe_webhooks = %config.stripe_webhook_secret.is_some(),
        lago_webhooks = %config.lago_webhook_secret.is_some(),
        notify_configured = %config.notify_url.is_some(),
        "Service configuration loaded"
    );

    let store = open_store(&config)?;

    if let Some(path) = &config.catalog_path {
        tracing::info!(path = %path, "Loading product catalog");
        let products = load_catalog(path)?;
        seed(store.as_ref(), &products)?;
    } else {
        tracing::warn!("CATALOG_PATH not set - using products already in the store");
    }

    if let Some(retention) = config.ledger_retention() {
        tracing::info!(retention_days = %retention.num_days(), "Ledger pruning enabled");
        spawn_ledger_pruner(Arc::clone(&store), retention);
    }

    // Build app state
    let state = AppState::new(store, config.clone());

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store - state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::RocksDb => open_rocks(config),
    }
}

#[cfg(feature = "rocksdb-backend")]
fn open_rocks(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(z_recon_store::RocksStore::open(&config.data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_rocks(_config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    Err("STORE_BACKEND=rocksdb requires building with the rocksdb-backend feature".into())
}
