//! vmfleet controller entrypoint.
//!
//! Wires the in-memory store, the tunnel broker, and the scheduler loop
//! together, then runs until interrupted.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmfleet_controller::{config, Scheduler, SchedulerConfig, TunnelBroker};
use vmfleet_store::Store;
use vmfleet_tunnel::Notifier;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to VMFLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmfleet controller");

    let store = Arc::new(Store::new());
    let broker = TunnelBroker::new(Notifier::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        broker.notifier().clone(),
        SchedulerConfig {
            interval: config.scheduler_interval,
            worker_offline_timeout: config.worker_offline_timeout,
            default_vm_cpu: config.default_vm_cpu,
            default_vm_memory_mb: config.default_vm_memory_mb,
        },
    ));
    let scheduler_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler.run(shutdown_rx).await;
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if shutdown_tx.send(true).is_err() {
        error!("Shutdown channel closed before signal could be sent");
    }
    scheduler_handle.await?;

    info!("Controller stopped");
    Ok(())
}
