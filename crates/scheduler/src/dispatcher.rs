//! Minute dispatcher
//!
//! Promotes due SCHEDULED rows to ENQUEUED and publishes them with a delay
//! so the queue releases each message at its send instant. The CAS makes
//! concurrent dispatcher instances safe: each row is enqueued at most once
//! per pass, losers skip. Queue trouble never blocks a tick; affected rows
//! stay SCHEDULED for the next tick or the sweeper.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use greetline_core::models::MessageStatus;
use greetline_queue::DeliveryPayload;
use greetline_store::StatusUpdate;

use crate::SchedulerDeps;

/// Counts for one dispatch tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub enqueued: u64,
    /// CAS lost to another dispatcher instance
    pub skipped: u64,
}

/// One dispatch pass over due rows
pub async fn run_dispatch_tick(deps: &SchedulerDeps, now: DateTime<Utc>) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();

    let batch = match deps
        .logs
        .find_due_for_enqueue(
            now,
            i64::try_from(deps.config.dispatch_horizon_secs).unwrap_or(3600),
            deps.config.dispatch_batch_limit,
        )
        .await
    {
        Ok(batch) => batch,
        Err(e) => {
            error!("Due-row query failed, skipping tick: {e}");
            return outcome;
        }
    };

    for row in batch {
        let claimed = match deps
            .logs
            .transition(
                row.id,
                MessageStatus::Scheduled,
                MessageStatus::Enqueued,
                StatusUpdate::default(),
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(id = %row.id, "Enqueue transition failed: {e}");
                continue;
            }
        };
        if !claimed {
            outcome.skipped += 1;
            continue;
        }

        let delay = (row.scheduled_send_time - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let payload = DeliveryPayload {
            message_log_id: row.id,
            attempt: 0,
        };
        match deps.queue.publish(payload, delay).await {
            Ok(()) => {
                outcome.enqueued += 1;
                deps.metrics.record_enqueued();
            }
            Err(e) => {
                warn!(id = %row.id, "Publish failed, rolling back to SCHEDULED: {e}");
                // Best effort; if this CAS also fails the sweeper's
                // stuck-ENQUEUED pass picks the row up.
                let _ = deps
                    .logs
                    .transition(
                        row.id,
                        MessageStatus::Enqueued,
                        MessageStatus::Scheduled,
                        StatusUpdate::default(),
                    )
                    .await;
            }
        }
    }

    if outcome.enqueued > 0 || outcome.skipped > 0 {
        info!(
            enqueued = outcome.enqueued,
            skipped = outcome.skipped,
            "Dispatch tick complete"
        );
    } else {
        debug!("Dispatch tick complete, nothing due");
    }
    outcome
}

/// Run a dispatch tick every `dispatch_interval_secs` until cancelled
pub async fn run_dispatcher_loop(deps: SchedulerDeps, shutdown: CancellationToken) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(deps.config.dispatch_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_dispatch_tick(&deps, Utc::now()).await;
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use greetline_core::config::DeliveryConfig;
    use greetline_core::metrics::DeliveryMetrics;
    use greetline_core::models::{MessageLog, MessageType};
    use greetline_core::strategy::StrategyRegistry;
    use greetline_core::types::UserId;
    use greetline_queue::DeliveryQueue;
    use greetline_queue::memory::InMemoryDeliveryQueue;
    use greetline_store::{InMemoryMessageLogStore, InMemoryUserStore, MessageLogStore};
    use std::sync::Arc;

    fn deps() -> (
        SchedulerDeps,
        Arc<InMemoryMessageLogStore>,
        Arc<InMemoryDeliveryQueue>,
    ) {
        let logs = Arc::new(InMemoryMessageLogStore::new());
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let deps = SchedulerDeps {
            users: Arc::new(InMemoryUserStore::new()),
            logs: logs.clone(),
            queue: queue.clone(),
            registry: Arc::new(StrategyRegistry::default()),
            config: Arc::new(DeliveryConfig::default()),
            metrics: Arc::new(DeliveryMetrics::new()),
        };
        (deps, logs, queue)
    }

    fn utc(h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, h, min, 0).unwrap()
    }

    async fn seed_row(logs: &InMemoryMessageLogStore, send: DateTime<Utc>) -> MessageLog {
        let row = MessageLog::new(UserId::new(), MessageType::Birthday, send, "hi".to_string());
        logs.create_if_absent(&row).await.unwrap();
        row
    }

    #[tokio::test]
    async fn test_due_row_is_enqueued_and_published() {
        let (deps, logs, queue) = deps();
        let row = seed_row(&logs, utc(12, 0)).await;

        let outcome = run_dispatch_tick(&deps, utc(12, 59)).await;

        assert_eq!(outcome, DispatchOutcome { enqueued: 1, skipped: 0 });
        let stored = logs.get(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Enqueued);
        assert_eq!(queue.depth().await.unwrap(), 1);

        // Past-due means zero delay: immediately leasable
        let leased = queue.lease(10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].payload.message_log_id, row.id);
        assert_eq!(leased[0].payload.attempt, 0);
    }

    #[tokio::test]
    async fn test_row_within_horizon_is_published_with_delay() {
        let (deps, logs, queue) = deps();
        // Due in 30 minutes, inside the 1h horizon
        seed_row(&logs, utc(13, 30)).await;

        let outcome = run_dispatch_tick(&deps, utc(13, 0)).await;

        assert_eq!(outcome.enqueued, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
        // Not visible yet; the queue holds it until the send instant
        assert!(queue.lease(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_row_beyond_horizon_is_untouched() {
        let (deps, logs, queue) = deps();
        let row = seed_row(&logs, utc(15, 0)).await;

        let outcome = run_dispatch_tick(&deps, utc(13, 0)).await;

        assert_eq!(outcome, DispatchOutcome::default());
        let stored = logs.get(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Scheduled);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_ticks_enqueue_once() {
        let (deps, logs, queue) = deps();
        seed_row(&logs, utc(12, 0)).await;

        let (a, b) = tokio::join!(
            run_dispatch_tick(&deps, utc(12, 59)),
            run_dispatch_tick(&deps, utc(12, 59)),
        );

        assert_eq!(a.enqueued + b.enqueued, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_limit_bounds_tick() {
        let (mut deps_base, logs, queue) = deps();
        let config = DeliveryConfig {
            dispatch_batch_limit: 2,
            ..DeliveryConfig::default()
        };
        deps_base.config = Arc::new(config);

        for minute in 0..5 {
            seed_row(&logs, utc(12, minute)).await;
        }

        let outcome = run_dispatch_tick(&deps_base, utc(13, 0)).await;
        assert_eq!(outcome.enqueued, 2);
        assert_eq!(queue.depth().await.unwrap(), 2);

        // The next tick picks up the rest
        let rest = run_dispatch_tick(&deps_base, utc(13, 1)).await;
        assert_eq!(rest.enqueued, 2);
        let last = run_dispatch_tick(&deps_base, utc(13, 2)).await;
        assert_eq!(last.enqueued, 1);
    }
}
