//! vmfleet worker entrypoint.
//!
//! Runs the reconciliation engine against the mock driver and an
//! in-process controller store. The production transport and
//! virtualization backend plug in behind the `ControllerClient` and
//! `DriverFactory` seams; the watch channel feeding an
//! `InstructionHandler` arrives with that transport, so no instruction
//! consumer is wired here and the engine relies on its poll interval.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmfleet_store::Store;
use vmfleet_worker::{
    config::Config,
    driver::MockDriverFactory,
    engine::{Reconciler, ReconcilerConfig},
    MockController,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to VMFLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(worker = %config.worker_name, "Starting vmfleet worker (mock backend)");

    let client = Arc::new(MockController::new(Arc::new(Store::new())));
    let factory = Arc::new(MockDriverFactory::new());
    let reconciler = Arc::new(Reconciler::new(
        client,
        factory,
        ReconcilerConfig {
            worker_name: config.worker_name.clone(),
            machine_id: uuid::Uuid::new_v4().to_string(),
            resources: config.resources(),
            sync_interval: config.sync_interval,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_handle = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        async move {
            if let Err(e) = reconciler.run(shutdown_rx).await {
                error!(error = %e, "Reconciler exited with error");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if shutdown_tx.send(true).is_err() {
        error!("Shutdown channel closed before signal could be sent");
    }
    engine_handle.await?;

    info!("Worker stopped");
    Ok(())
}
