//! Greetline Worker - queue-consuming send pool
//!
//! Long-running consumers lease delivery messages, claim the underlying
//! message-log row by CAS, call the sender and settle both the row and the
//! lease. Redeliveries are no-ops thanks to the terminal-status check, so
//! the pipeline stays exactly-once at the row level even though the queue
//! is at-least-once.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use greetline_core::backoff::OUTER_REQUEUE;
use greetline_core::config::DeliveryConfig;
use greetline_core::metrics::DeliveryMetrics;
use greetline_core::models::MessageStatus;
use greetline_queue::{DeliveryPayload, DeliveryQueue, LeasedMessage};
use greetline_sender::{SendOutcome, Sender};
use greetline_store::{MessageLogStore, StatusUpdate, UserStore};

/// Everything a worker needs, shared across the pool
#[derive(Clone)]
pub struct WorkerContext {
    pub logs: Arc<dyn MessageLogStore>,
    pub users: Arc<dyn UserStore>,
    pub queue: Arc<dyn DeliveryQueue>,
    pub sender: Arc<dyn Sender>,
    pub config: Arc<DeliveryConfig>,
    pub metrics: Arc<DeliveryMetrics>,
}

/// How one leased message was settled; used for logging and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Sent,
    /// Row already terminal; redelivery acknowledged without sending
    DuplicateDelivery,
    /// Another worker holds the row; acknowledged without sending
    AlreadyOwned,
    /// Payload referenced a row that does not exist
    RowMissing,
    /// User was soft-deleted after scheduling; row moved to DEAD
    UserRemoved,
    /// Transient failure with retries left; requeued with backoff
    Retried { next_attempt: i32 },
    /// Retries exhausted or permanent failure; row moved to DEAD
    Dead,
}

/// Process one leased delivery end to end
pub async fn process_delivery(
    ctx: &WorkerContext,
    msg: &LeasedMessage,
) -> Result<Disposition> {
    let DeliveryPayload {
        message_log_id: id,
        attempt,
    } = msg.payload;

    let Some(row) = ctx.logs.get(id).await? else {
        warn!(%id, "Delivery references unknown message-log row, dropping");
        ctx.queue.ack(msg.receipt).await?;
        return Ok(Disposition::RowMissing);
    };

    // Redelivered after completion: nothing to do
    if row.status.is_terminal() {
        debug!(%id, status = %row.status, "Duplicate delivery for terminal row");
        ctx.queue.ack(msg.receipt).await?;
        return Ok(Disposition::DuplicateDelivery);
    }

    // Claim the row. A row arrives here as ENQUEUED on the first pass and as
    // FAILED on requeued retries.
    let claim = StatusUpdate {
        last_attempt_at: Some(Utc::now()),
        ..StatusUpdate::default()
    };
    let owned = ctx
        .logs
        .transition(id, MessageStatus::Enqueued, MessageStatus::Sending, claim.clone())
        .await?
        || ctx
            .logs
            .transition(id, MessageStatus::Failed, MessageStatus::Sending, claim)
            .await?;
    if !owned {
        ctx.queue.ack(msg.receipt).await?;
        return Ok(Disposition::AlreadyOwned);
    }

    let Some(user) = ctx.users.get_by_id(row.user_id).await? else {
        info!(%id, user_id = %row.user_id, "User removed since scheduling, dropping row");
        ctx.logs
            .transition(
                id,
                MessageStatus::Sending,
                MessageStatus::Dead,
                StatusUpdate {
                    last_error: Some("user_removed".to_string()),
                    ..StatusUpdate::default()
                },
            )
            .await?;
        ctx.metrics.record_dead();
        ctx.queue.ack(msg.receipt).await?;
        return Ok(Disposition::UserRemoved);
    };

    let started = Instant::now();
    let outcome = ctx.sender.send(&user.email, &row.message_content).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match outcome {
        SendOutcome::Sent { code } => {
            let updated = ctx
                .logs
                .transition(
                    id,
                    MessageStatus::Sending,
                    MessageStatus::Sent,
                    StatusUpdate {
                        response_code: Some(i32::from(code)),
                        ..StatusUpdate::default()
                    },
                )
                .await?;
            if !updated {
                // Recovery raced us between send and update; the send itself
                // happened, so the redelivery will land on the terminal check.
                warn!(%id, "Row left SENDING before completion could be recorded");
            }
            ctx.metrics.record_sent();
            info!(%id, attempt, latency_ms, outcome = "sent", code, "Send attempt finished");
            ctx.queue.ack(msg.receipt).await?;
            Ok(Disposition::Sent)
        }
        SendOutcome::TransientFailure { reason, code } => {
            ctx.metrics.record_transient_failure();
            if row.retry_count < ctx.config.max_retries {
                ctx.logs
                    .transition(
                        id,
                        MessageStatus::Sending,
                        MessageStatus::Failed,
                        StatusUpdate {
                            increment_retry: true,
                            last_error: Some(reason.clone()),
                            response_code: code.map(i32::from),
                            ..StatusUpdate::default()
                        },
                    )
                    .await?;
                let next_attempt = attempt + 1;
                let delay = OUTER_REQUEUE.jittered(u32::try_from(attempt).unwrap_or(0));
                ctx.queue
                    .publish(
                        DeliveryPayload {
                            message_log_id: id,
                            attempt: next_attempt,
                        },
                        delay,
                    )
                    .await?;
                ctx.queue.ack(msg.receipt).await?;
                info!(
                    %id, attempt, latency_ms, outcome = "retried", reason = %reason,
                    retry_count = row.retry_count + 1,
                    "Send attempt finished"
                );
                Ok(Disposition::Retried { next_attempt })
            } else {
                ctx.logs
                    .transition(
                        id,
                        MessageStatus::Sending,
                        MessageStatus::Dead,
                        StatusUpdate {
                            last_error: Some(reason.clone()),
                            response_code: code.map(i32::from),
                            ..StatusUpdate::default()
                        },
                    )
                    .await?;
                ctx.metrics.record_dead();
                ctx.queue.dead_letter(msg.receipt, &reason).await?;
                warn!(%id, attempt, latency_ms, outcome = "dead", reason = %reason, "Retries exhausted");
                Ok(Disposition::Dead)
            }
        }
        SendOutcome::PermanentFailure { reason, code } => {
            ctx.metrics.record_permanent_failure();
            ctx.metrics.record_dead();
            ctx.logs
                .transition(
                    id,
                    MessageStatus::Sending,
                    MessageStatus::Dead,
                    StatusUpdate {
                        last_error: Some(reason.clone()),
                        response_code: Some(i32::from(code)),
                        ..StatusUpdate::default()
                    },
                )
                .await?;
            ctx.queue.ack(msg.receipt).await?;
            warn!(%id, attempt, latency_ms, outcome = "dead", reason = %reason, code, "Permanent failure");
            Ok(Disposition::Dead)
        }
    }
}

/// Run the worker pool until cancelled, then drain within the graceful
/// shutdown window
pub async fn run_worker_pool(ctx: WorkerContext, shutdown: CancellationToken) -> Result<()> {
    info!(
        workers = ctx.config.worker_count,
        prefetch = ctx.config.worker_prefetch,
        "Starting worker pool"
    );

    let mut pool = JoinSet::new();
    for worker_id in 0..ctx.config.worker_count {
        pool.spawn(worker_loop(ctx.clone(), shutdown.clone(), worker_id));
    }
    let mut next_worker_id = ctx.config.worker_count;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            joined = pool.join_next() => match joined {
                Some(Err(e)) if e.is_panic() => {
                    // Fatal in one unit of work must not take the pool down
                    error!("Worker task panicked, respawning: {e}");
                    pool.spawn(worker_loop(ctx.clone(), shutdown.clone(), next_worker_id));
                    next_worker_id += 1;
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    info!("Worker pool draining");
    let drain = async {
        while pool.join_next().await.is_some() {}
    };
    let graceful = Duration::from_secs(ctx.config.graceful_shutdown_secs);
    if tokio::time::timeout(graceful, drain).await.is_err() {
        warn!("Graceful drain window elapsed, aborting in-flight workers");
        pool.abort_all();
    }
    info!("Worker pool stopped");
    Ok(())
}

async fn worker_loop(ctx: WorkerContext, shutdown: CancellationToken, worker_id: usize) {
    let idle = Duration::from_secs(1);

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let batch = tokio::select! {
            result = ctx.queue.lease(ctx.config.worker_prefetch) => result,
            _ = shutdown.cancelled() => break,
        };

        match batch {
            Ok(batch) if batch.is_empty() => {
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            Ok(batch) => {
                // The leased batch is finished even if shutdown arrives
                // mid-way; prefetch bounds how much that can be.
                for msg in batch {
                    if let Err(e) = process_delivery(&ctx, &msg).await {
                        warn!(worker_id, receipt = %msg.receipt, "Delivery processing failed: {e}");
                        let delay = OUTER_REQUEUE
                            .jittered(u32::try_from(msg.payload.attempt).unwrap_or(0));
                        if let Err(e) = ctx.queue.requeue(msg.receipt, delay).await {
                            warn!(worker_id, "Requeue failed, lease will expire instead: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(worker_id, "Queue lease failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }

    debug!(worker_id, "Worker loop exited");
}
