//! Greetline unified server
//!
//! Runs the whole delivery pipeline in one process: daily pre-calc, minute
//! dispatcher, recovery sweeper and the worker pool, all against the shared
//! Postgres pool. Horizontal scaling adds more of these processes (or
//! standalone workers); CAS transitions and the idempotency key keep
//! replicas from stepping on each other.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use greetline_core::metrics::DeliveryMetrics;
use greetline_core::strategy::StrategyRegistry;
use greetline_queue::pg::PgDeliveryQueue;
use greetline_scheduler::{SchedulerDeps, run_dispatcher_loop, run_precalc_loop, run_recovery_loop};
use greetline_sender::{HttpEmailSender, SenderConfig};
use greetline_store::{PgMessageLogStore, PgUserStore};
use greetline_worker::{WorkerContext, run_worker_pool};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    greetline_shared::bootstrap::init_env();

    // The guard must be kept alive for the duration of the program to ensure logs are flushed
    let _guard = greetline_shared::bootstrap::init_tracing("greetline");

    info!("Starting Greetline delivery server");

    let config = config::UnifiedConfig::from_env()?;
    info!("✓ Configuration loaded");

    let pool = greetline_shared::bootstrap::init_db(&config.core).await?;

    // Run migrations ONCE
    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("✓ Migrations completed");

    let delivery = Arc::new(config.delivery);
    let metrics = Arc::new(DeliveryMetrics::new());
    let registry = Arc::new(StrategyRegistry::default());

    let logs = Arc::new(PgMessageLogStore::new(pool.clone()));
    let users = Arc::new(PgUserStore::new(pool.clone()));
    let queue = Arc::new(PgDeliveryQueue::new(pool.clone()));
    let sender = Arc::new(HttpEmailSender::new(
        SenderConfig::from_delivery(&delivery),
        metrics.clone(),
    )?);

    let scheduler_deps = SchedulerDeps {
        users: users.clone(),
        logs: logs.clone(),
        queue: queue.clone(),
        registry,
        config: delivery.clone(),
        metrics: metrics.clone(),
    };
    let worker_ctx = WorkerContext {
        logs,
        users,
        queue,
        sender,
        config: delivery,
        metrics: metrics.clone(),
    };

    let shutdown = CancellationToken::new();
    let precalc = tokio::spawn(run_precalc_loop(scheduler_deps.clone(), shutdown.clone()));
    let dispatcher = tokio::spawn(run_dispatcher_loop(scheduler_deps.clone(), shutdown.clone()));
    let recovery = tokio::spawn(run_recovery_loop(scheduler_deps, shutdown.clone()));
    let workers = tokio::spawn(run_worker_pool(worker_ctx, shutdown.clone()));

    info!("✓ All services started");

    greetline_shared::bootstrap::wait_for_shutdown().await;
    info!("Shutdown signal received");

    shutdown.cancel();
    let (_, _, _, worker_result) = tokio::join!(precalc, dispatcher, recovery, workers);
    worker_result??;

    info!(metrics = ?metrics.snapshot(), "✓ All services stopped gracefully");
    Ok(())
}
