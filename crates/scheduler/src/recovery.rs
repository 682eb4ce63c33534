//! Recovery sweeper
//!
//! Detects rows stuck in non-terminal states after crashes, lost queue
//! messages or missed ticks, and moves them back to a re-entrant state.
//! Every transition is a CAS, so concurrent sweeps across replicas are
//! safe. Also hosts the daily retention purge when enabled.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use greetline_core::models::{MessageLog, MessageStatus};
use greetline_queue::DeliveryPayload;
use greetline_store::StatusUpdate;

use crate::SchedulerDeps;

/// Counts for one recovery sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// SCHEDULED rows past due that were enqueued directly
    pub requeued_scheduled: u64,
    /// Stuck ENQUEUED rows reset for the dispatcher
    pub reset_enqueued: u64,
    /// Stale SENDING rows failed over for retry
    pub failed_over_sending: u64,
    /// Retry-due FAILED rows re-enqueued
    pub requeued_failed: u64,
}

async fn enqueue_now(deps: &SchedulerDeps, row: &MessageLog) -> bool {
    let payload = DeliveryPayload {
        message_log_id: row.id,
        attempt: row.retry_count,
    };
    match deps.queue.publish(payload, Duration::ZERO).await {
        Ok(()) => true,
        Err(e) => {
            warn!(id = %row.id, "Recovery publish failed: {e}");
            false
        }
    }
}

/// One full sweep over the four stuck shapes
pub async fn run_recovery_sweep(deps: &SchedulerDeps, now: DateTime<Utc>) -> RecoveryOutcome {
    let mut outcome = RecoveryOutcome::default();
    let config = &deps.config;
    let limit = config.dispatch_batch_limit;

    // (a) SCHEDULED rows the dispatcher should have promoted long ago
    match deps
        .logs
        .find_overdue_scheduled(now, config.sweep_grace_secs, config.max_retries, limit)
        .await
    {
        Ok(rows) => {
            for row in rows {
                let claimed = deps
                    .logs
                    .transition(
                        row.id,
                        MessageStatus::Scheduled,
                        MessageStatus::Enqueued,
                        StatusUpdate::default(),
                    )
                    .await
                    .unwrap_or(false);
                if claimed && enqueue_now(deps, &row).await {
                    info!(id = %row.id, from = "SCHEDULED", to = "ENQUEUED", "Recovery requeued overdue row");
                    deps.metrics.record_recovery_requeue();
                    outcome.requeued_scheduled += 1;
                }
            }
        }
        Err(e) => error!("Overdue-scheduled query failed: {e}"),
    }

    // (b) ENQUEUED rows whose queue message evidently never arrived
    match deps
        .logs
        .find_stuck_enqueued(now, config.stuck_enqueued_secs, limit)
        .await
    {
        Ok(rows) => {
            for row in rows {
                let reset = deps
                    .logs
                    .transition(
                        row.id,
                        MessageStatus::Enqueued,
                        MessageStatus::Scheduled,
                        StatusUpdate::default(),
                    )
                    .await
                    .unwrap_or(false);
                if reset {
                    info!(id = %row.id, from = "ENQUEUED", to = "SCHEDULED", "Recovery reset stuck row");
                    outcome.reset_enqueued += 1;
                }
            }
        }
        Err(e) => error!("Stuck-enqueued query failed: {e}"),
    }

    // (c) SENDING rows abandoned by a crashed worker
    match deps
        .logs
        .find_stale_sending(now, config.stale_sending_secs, limit)
        .await
    {
        Ok(rows) => {
            for row in rows {
                let failed_over = deps
                    .logs
                    .transition(
                        row.id,
                        MessageStatus::Sending,
                        MessageStatus::Failed,
                        StatusUpdate {
                            last_error: Some("stale_sending_recovered".to_string()),
                            ..StatusUpdate::default()
                        },
                    )
                    .await
                    .unwrap_or(false);
                if failed_over && enqueue_now(deps, &row).await {
                    info!(id = %row.id, from = "SENDING", to = "FAILED", "Recovery failed over stale row");
                    deps.metrics.record_recovery_requeue();
                    outcome.failed_over_sending += 1;
                }
            }
        }
        Err(e) => error!("Stale-sending query failed: {e}"),
    }

    // (d) FAILED rows whose retry message got lost
    match deps
        .logs
        .find_retry_due_failed(now, config.max_retries, limit)
        .await
    {
        Ok(rows) => {
            for row in rows {
                let claimed = deps
                    .logs
                    .transition(
                        row.id,
                        MessageStatus::Failed,
                        MessageStatus::Enqueued,
                        StatusUpdate::default(),
                    )
                    .await
                    .unwrap_or(false);
                if claimed && enqueue_now(deps, &row).await {
                    info!(id = %row.id, from = "FAILED", to = "ENQUEUED", "Recovery requeued retry-due row");
                    deps.metrics.record_recovery_requeue();
                    outcome.requeued_failed += 1;
                }
            }
        }
        Err(e) => error!("Retry-due query failed: {e}"),
    }

    info!(
        requeued_scheduled = outcome.requeued_scheduled,
        reset_enqueued = outcome.reset_enqueued,
        failed_over_sending = outcome.failed_over_sending,
        requeued_failed = outcome.requeued_failed,
        "Recovery sweep complete"
    );
    outcome
}

async fn run_retention_purge(deps: &SchedulerDeps, now: DateTime<Utc>) {
    let days = deps.config.retention_days;
    if days <= 0 {
        return;
    }
    let cutoff = now - ChronoDuration::days(days);

    match deps.logs.purge_terminal_older_than(cutoff).await {
        Ok(purged) if purged > 0 => info!(purged, "Purged old terminal rows"),
        Ok(_) => {}
        Err(e) => error!("Terminal-row purge failed: {e}"),
    }
    match deps.queue.purge_dead_letters_older_than(cutoff).await {
        Ok(purged) if purged > 0 => info!(purged, "Purged old dead letters"),
        Ok(_) => {}
        Err(e) => error!("Dead-letter purge failed: {e}"),
    }
}

/// Sweep once at startup, then every `recovery_interval_secs` until
/// cancelled. The retention purge runs on the first sweep of each UTC day.
pub async fn run_recovery_loop(deps: SchedulerDeps, shutdown: CancellationToken) {
    let mut last_purge_day: Option<NaiveDate> = None;
    let mut interval =
        tokio::time::interval(Duration::from_secs(deps.config.recovery_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();
                run_recovery_sweep(&deps, now).await;
                log_queue_status(&deps).await;

                let today = now.date_naive();
                if deps.config.retention_days > 0 && last_purge_day != Some(today) {
                    run_retention_purge(&deps, now).await;
                    last_purge_day = Some(today);
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn log_queue_status(deps: &SchedulerDeps) {
    let depth = deps.queue.depth().await.unwrap_or(-1);
    let scheduled = deps
        .logs
        .count_with_status(MessageStatus::Scheduled)
        .await
        .unwrap_or(-1);
    let failed = deps
        .logs
        .count_with_status(MessageStatus::Failed)
        .await
        .unwrap_or(-1);
    if depth > 0 || scheduled > 0 || failed > 0 {
        info!(
            queue_depth = depth,
            scheduled_rows = scheduled,
            failed_rows = failed,
            "Queue status"
        );
    }
}
