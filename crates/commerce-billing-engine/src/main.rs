//! Billing worker: resumes subscription workflows and delivers webhooks.
//!
//! Runs until interrupted. Workflow checkpoints and undelivered events stay in the store, so
//! the next start picks up where this one stopped.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commerce_billing_engine::{BillingEngine, EngineConfig, WebhookDispatcher, WorkflowRunner};
use commerce_billing_store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,commerce_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting billing worker");

    let config = EngineConfig::from_env();
    tracing::info!(
        data_dir = %config.data_dir,
        default_currency = %config.default_currency,
        livemode = config.livemode,
        dunning_attempts = config.dunning.attempts(),
        "Worker configuration loaded"
    );

    let store = open_store(&config)?;
    let engine = BillingEngine::new(store, config);

    let runner = WorkflowRunner::new(engine.clone());
    runner.resume_all()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = WebhookDispatcher::new(engine)?.spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    runner.shutdown();
    shutdown_tx.send(true)?;
    dispatcher.await?;

    tracing::info!("Billing worker stopped");
    Ok(())
}

#[cfg(feature = "rocksdb-backend")]
fn open_store(config: &EngineConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    let store: Arc<dyn Store> =
        Arc::new(commerce_billing_store::RocksStore::open(&config.data_dir)?);
    Ok(store)
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_store(_config: &EngineConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::warn!("Built without rocksdb-backend, using a volatile in-memory store");
    let store: Arc<dyn Store> = Arc::new(commerce_billing_store::MemoryStore::new());
    Ok(store)
}
