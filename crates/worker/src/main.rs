//! Greetline Worker - standalone consumer process
//!
//! Runs only the send pool against the shared database and queue. Use this
//! to scale delivery horizontally; scheduling stays with the server binary.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use greetline_core::config::{CoreConfig, DeliveryConfig};
use greetline_core::metrics::DeliveryMetrics;
use greetline_queue::pg::PgDeliveryQueue;
use greetline_sender::{HttpEmailSender, SenderConfig};
use greetline_store::{PgMessageLogStore, PgUserStore};
use greetline_worker::{WorkerContext, run_worker_pool};

#[tokio::main]
async fn main() -> Result<()> {
    greetline_shared::bootstrap::init_env();
    let _guard = greetline_shared::bootstrap::init_tracing("worker");

    let core = CoreConfig::from_env()?;
    let delivery = Arc::new(DeliveryConfig::from_env()?);
    let pool = greetline_shared::bootstrap::init_db(&core).await?;

    let metrics = Arc::new(DeliveryMetrics::new());
    let sender = HttpEmailSender::new(SenderConfig::from_delivery(&delivery), metrics.clone())?;

    let ctx = WorkerContext {
        logs: Arc::new(PgMessageLogStore::new(pool.clone())),
        users: Arc::new(PgUserStore::new(pool.clone())),
        queue: Arc::new(PgDeliveryQueue::new(pool)),
        sender: Arc::new(sender),
        config: delivery,
        metrics: metrics.clone(),
    };

    let shutdown = CancellationToken::new();
    let pool_task = tokio::spawn(run_worker_pool(ctx, shutdown.clone()));

    greetline_shared::bootstrap::wait_for_shutdown().await;
    info!("Shutdown signal received");
    shutdown.cancel();
    pool_task.await??;

    info!(metrics = ?metrics.snapshot(), "Worker stopped");
    Ok(())
}
