//! Credit ledger service.
//!
//! Opens the store, builds the engine and runs the out-of-band webhook
//! retry sweep until interrupted.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use credit_ledger_service::{CreditService, ServiceConfig};
use credit_ledger_store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,credit_ledger=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting credit ledger service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        data_dir = %config.data_dir,
        webhook_secret_configured = %config.webhook.secret.is_some(),
        max_webhook_attempts = config.webhook.max_attempts,
        sweep_interval_seconds = config.sweep_interval_seconds,
        "Service configuration loaded"
    );

    let store = open_store(&config)?;
    let service = CreditService::new(store, config.clone());

    let interval = Duration::from_secs(config.sweep_interval_seconds.max(1));
    tracing::info!(interval_seconds = interval.as_secs(), "Starting webhook retry sweep");
    service
        .sweeper()
        .run_until(interval, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await;

    tracing::info!("Credit ledger service stopped");
    Ok(())
}

#[cfg(feature = "rocksdb-backend")]
fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(credit_ledger_store::RocksStore::open(&config.data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::warn!(
        data_dir = %config.data_dir,
        "Built without rocksdb-backend - using the in-memory store, nothing is persisted"
    );
    Ok(Arc::new(credit_ledger_store::MemoryStore::new()))
}
