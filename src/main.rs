//! Service binary.
//!
//! Wires the admission core together against the in-memory object store:
//! configuration, event controller, scheduler cycle, shutdown handling.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use batchgate::config::Config;
use batchgate::controller::{Controller, StatusReporter};
use batchgate::scheduler::SchedulerTuning;
use batchgate::store::{InMemoryStore, ObjectStore, RateLimiter};
use batchgate::{Cache, QueueManager, Scheduler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    info!("🚀 Starting batchgate admission controller");

    let config = Config::load().map_err(|err| {
        error!("❌ Failed to load configuration: {}", err);
        err
    })?;
    info!("✅ Configuration loaded");
    info!(
        "   Client connection: {} qps (burst {})",
        config.client_connection.qps, config.client_connection.burst
    );
    info!(
        "   Frameworks: {}",
        config.integrations.frameworks.join(", ")
    );
    info!(
        "   Wait for pods ready: {}",
        config.wait_for_pods_ready.enable
    );

    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
    let cache = Arc::new(Cache::new());
    let queues = Arc::new(QueueManager::new());
    let limiter = Arc::new(RateLimiter::new(
        config.client_connection.qps,
        config.client_connection.burst,
    ));
    let reporter = Arc::new(StatusReporter::new(
        cache.clone(),
        queues.clone(),
        store.clone(),
        limiter.clone(),
    ));

    let scheduler = Scheduler::new(
        cache.clone(),
        queues.clone(),
        store.clone(),
        reporter.clone(),
        limiter,
        SchedulerTuning::from_config(&config),
    );
    let controller = Controller::new(
        cache,
        queues,
        store,
        reporter,
        scheduler.wake_handle(),
        &config,
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let controller_task = tokio::spawn(controller.run(shutdown_tx.subscribe()));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    info!("✨ Admission core running; waiting for objects");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    let _ = controller_task.await;
    let _ = scheduler_task.await;
    info!("batchgate stopped");

    Ok(())
}
