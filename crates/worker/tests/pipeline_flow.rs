//! End-to-end pipeline tests over the in-memory adapters
//!
//! Drives pre-calc, dispatch, recovery and the worker by explicit ticks
//! with injected clocks, so every scenario is deterministic: no test waits
//! for a real minute boundary.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::Arc;

use greetline_core::config::DeliveryConfig;
use greetline_core::metrics::DeliveryMetrics;
use greetline_core::models::{MessageStatus, User};
use greetline_core::strategy::StrategyRegistry;
use greetline_core::types::UserId;
use greetline_queue::memory::InMemoryDeliveryQueue;
use greetline_queue::{DeliveryQueue, LeasedMessage};
use greetline_scheduler::{
    SchedulerDeps, run_dispatch_tick, run_precalc, run_recovery_sweep, user_events,
};
use greetline_sender::{ScriptedSender, SendOutcome};
use greetline_store::{InMemoryMessageLogStore, InMemoryUserStore, MessageLogStore};
use greetline_worker::{Disposition, WorkerContext, process_delivery};

struct Pipeline {
    scheduler: SchedulerDeps,
    worker: WorkerContext,
    users: Arc<InMemoryUserStore>,
    logs: Arc<InMemoryMessageLogStore>,
    queue: Arc<InMemoryDeliveryQueue>,
    sender: Arc<ScriptedSender>,
}

fn pipeline() -> Pipeline {
    let users = Arc::new(InMemoryUserStore::new());
    let logs = Arc::new(InMemoryMessageLogStore::new());
    let queue = Arc::new(InMemoryDeliveryQueue::new());
    let sender = Arc::new(ScriptedSender::new());
    let config = Arc::new(DeliveryConfig::default());
    let metrics = Arc::new(DeliveryMetrics::new());

    let scheduler = SchedulerDeps {
        users: users.clone(),
        logs: logs.clone(),
        queue: queue.clone(),
        registry: Arc::new(StrategyRegistry::default()),
        config: config.clone(),
        metrics: metrics.clone(),
    };
    let worker = WorkerContext {
        logs: logs.clone(),
        users: users.clone(),
        queue: queue.clone(),
        sender: sender.clone(),
        config,
        metrics,
    };

    Pipeline {
        scheduler,
        worker,
        users,
        logs,
        queue,
        sender,
    }
}

fn alice() -> User {
    let now = Utc::now();
    User {
        id: UserId::new(),
        first_name: "Alice".to_string(),
        last_name: "Smith".to_string(),
        email: "a@example.com".to_string(),
        timezone: "America/New_York".to_string(),
        birthday_date: NaiveDate::from_ymd_opt(1990, 6, 15),
        anniversary_date: None,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn utc(m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, m, d, h, min, 0).unwrap()
}

async fn lease_one(queue: &InMemoryDeliveryQueue) -> LeasedMessage {
    let mut batch = queue.lease(1).await.unwrap();
    assert_eq!(batch.len(), 1, "expected a leasable message");
    batch.remove(0)
}

#[tokio::test]
async fn test_happy_path_precalc_to_sent() {
    let p = pipeline();
    p.users.upsert(alice()).await;

    // 00:00 UTC: pre-calc materializes the row at 13:00 UTC (09:00 EDT)
    let precalc = run_precalc(&p.scheduler, utc(6, 15, 0, 0)).await;
    assert_eq!(precalc.created, 1);

    // 12:59 UTC: within the 1h horizon, promoted and published with a 60s
    // delay; a second tick finds nothing because the row left SCHEDULED
    let dispatch = run_dispatch_tick(&p.scheduler, utc(6, 15, 12, 59)).await;
    assert_eq!(dispatch.enqueued, 1);
    let redispatch = run_dispatch_tick(&p.scheduler, utc(6, 15, 13, 0)).await;
    assert_eq!(redispatch.enqueued + redispatch.skipped, 0);

    let row = p.logs.all().await.remove(0);
    assert_eq!(row.status, MessageStatus::Enqueued);
    assert_eq!(row.scheduled_send_time, utc(6, 15, 13, 0));
    assert_eq!(row.delivery_date, NaiveDate::from_ymd_opt(2025, 6, 15).unwrap());

    // The delay is honored: nothing leasable until the send instant
    assert_eq!(p.queue.depth().await.unwrap(), 1);
    assert!(p.queue.lease(1).await.unwrap().is_empty());

    // ...then fast-forward to 13:00 instead of sleeping a real minute
    p.queue.make_all_visible().await;

    let msg = lease_one(&p.queue).await;
    let disposition = process_delivery(&p.worker, &msg).await.unwrap();
    assert_eq!(disposition, Disposition::Sent);

    let stored = p.logs.get(row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
    assert_eq!(stored.response_code, Some(200));
    assert_eq!(stored.retry_count, 0);

    // Exactly one POST with the contract body
    assert_eq!(
        p.sender.calls(),
        vec![(
            "a@example.com".to_string(),
            "Hey, Alice Smith it's your birthday".to_string()
        )]
    );
}

#[tokio::test]
async fn test_idempotent_precalc_under_replicas() {
    let p = pipeline();
    for _ in 0..3 {
        p.users.upsert(alice()).await;
    }
    // Three distinct users (distinct ids), two racing pre-calc replicas
    let (a, b) = tokio::join!(
        run_precalc(&p.scheduler, utc(6, 15, 0, 0)),
        run_precalc(&p.scheduler, utc(6, 15, 0, 0)),
    );

    assert_eq!(a.created + b.created, 3);
    assert_eq!(a.duplicates + b.duplicates, 3);
    assert_eq!(p.logs.len().await, 3);
}

#[tokio::test]
async fn test_crash_during_sending_recovers_to_sent() {
    let p = pipeline();
    p.users.upsert(alice()).await;
    run_precalc(&p.scheduler, utc(6, 15, 0, 0)).await;
    let row = p.logs.all().await.remove(0);

    // A worker claimed the row and died: ENQUEUED -> SENDING with a stale
    // attempt timestamp, and its queue message is gone.
    p.logs
        .transition(
            row.id,
            MessageStatus::Scheduled,
            MessageStatus::Enqueued,
            greetline_store::StatusUpdate::default(),
        )
        .await
        .unwrap();
    p.logs
        .transition(
            row.id,
            MessageStatus::Enqueued,
            MessageStatus::Sending,
            greetline_store::StatusUpdate {
                last_attempt_at: Some(utc(6, 15, 13, 0)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Sweep 10 minutes later: past the 5-minute stale-SENDING threshold
    let sweep = run_recovery_sweep(&p.scheduler, utc(6, 15, 13, 10)).await;
    assert_eq!(sweep.failed_over_sending, 1);

    let msg = lease_one(&p.queue).await;
    let disposition = process_delivery(&p.worker, &msg).await.unwrap();
    assert_eq!(disposition, Disposition::Sent);

    let stored = p.logs.get(row.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
    // One or two POSTs are acceptable after a crash; here the crashed
    // attempt never reached the wire, so exactly one.
    assert_eq!(p.sender.call_count(), 1);
}

#[tokio::test]
async fn test_user_deleted_after_scheduling_never_posts() {
    let p = pipeline();
    let user = alice();
    p.users.upsert(user.clone()).await;
    run_precalc(&p.scheduler, utc(6, 15, 0, 0)).await;

    p.users.soft_delete(user.id).await;

    // Dispatch at the send instant: delay 0, message immediately visible
    let dispatch = run_dispatch_tick(&p.scheduler, utc(6, 15, 13, 0)).await;
    assert_eq!(dispatch.enqueued, 1);

    let msg = lease_one(&p.queue).await;
    let disposition = process_delivery(&p.worker, &msg).await.unwrap();
    assert_eq!(disposition, Disposition::UserRemoved);

    let row = p.logs.all().await.remove(0);
    assert_eq!(row.status, MessageStatus::Dead);
    assert_eq!(row.last_error.as_deref(), Some("user_removed"));
    assert_eq!(p.sender.call_count(), 0);
}

#[tokio::test]
async fn test_sustained_outage_exhausts_to_dead() {
    let p = pipeline();
    p.users.upsert(alice()).await;
    run_precalc(&p.scheduler, utc(6, 15, 0, 0)).await;
    let row_id = p.logs.all().await.remove(0).id;

    run_dispatch_tick(&p.scheduler, utc(6, 15, 13, 0)).await;

    let max_retries = p.worker.config.max_retries;
    let mut attempts = 0;
    loop {
        // Every attempt fails transiently
        p.sender.push_outcome(SendOutcome::TransientFailure {
            reason: "http status 500".to_string(),
            code: Some(500),
        });
        let msg = lease_one(&p.queue).await;
        let disposition = process_delivery(&p.worker, &msg).await.unwrap();
        attempts += 1;

        match disposition {
            Disposition::Retried { .. } => {
                // The worker requeued with a jittered outer backoff;
                // fast-forward instead of sleeping through it
                p.queue.make_all_visible().await;
            }
            Disposition::Dead => break,
            other => panic!("unexpected disposition {other:?}"),
        }
        assert!(attempts < 20, "pipeline failed to converge");
    }

    // Initial attempt plus max_retries
    assert_eq!(attempts, max_retries + 1);
    assert_eq!(p.sender.call_count() as i32, max_retries + 1);

    let row = p.logs.get(row_id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Dead);
    assert_eq!(row.retry_count, max_retries);

    let dead = p.queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload.message_log_id, row_id);
    assert_eq!(p.worker.metrics.snapshot().dead_total, 1);
}

#[tokio::test]
async fn test_timezone_change_round_trip() {
    let p = pipeline();
    let old = alice();
    p.users.upsert(old.clone()).await;
    let now = utc(6, 15, 0, 0);
    run_precalc(&p.scheduler, now).await;

    let mut new = old.clone();
    new.timezone = "Europe/London".to_string();
    p.users.upsert(new.clone()).await;
    user_events::on_user_updated(&p.scheduler, &old, &new, now)
        .await
        .unwrap();

    let row = p.logs.all().await.remove(0);
    assert_eq!(
        row.scheduled_send_time,
        greetline_core::timezone::nine_am_local_to_utc(
            NaiveDate::from_ymd_opt(2025, 6, 15).unwrap(),
            "Europe/London"
        )
        .unwrap()
    );
    // BST: 09:00 local = 08:00 UTC
    assert_eq!(row.scheduled_send_time, utc(6, 15, 8, 0));
}

#[tokio::test]
async fn test_dispatch_worker_and_recovery_compose_exactly_once() {
    let p = pipeline();
    p.users.upsert(alice()).await;
    run_precalc(&p.scheduler, utc(6, 15, 0, 0)).await;

    // Dispatcher and a racing recovery sweep both try to promote the
    // overdue row; only one wins.
    let (dispatch, sweep) = tokio::join!(
        run_dispatch_tick(&p.scheduler, utc(6, 15, 13, 5)),
        run_recovery_sweep(&p.scheduler, utc(6, 15, 13, 5)),
    );
    assert_eq!(dispatch.enqueued + sweep.requeued_scheduled, 1);

    let msg = lease_one(&p.queue).await;
    assert_eq!(
        process_delivery(&p.worker, &msg).await.unwrap(),
        Disposition::Sent
    );
    assert_eq!(p.sender.call_count(), 1);

    // Any straggler redelivery is a no-op
    let leftovers = p.queue.lease(10).await.unwrap();
    for leftover in leftovers {
        assert_eq!(
            process_delivery(&p.worker, &leftover).await.unwrap(),
            Disposition::DuplicateDelivery
        );
    }
    assert_eq!(p.sender.call_count(), 1);
}
