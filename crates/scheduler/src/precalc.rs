//! Daily pre-calc
//!
//! Streams candidate users page by page, checks each against their own
//! timezone and materializes one SCHEDULED row per applicable (user,
//! variant). Running twice on the same UTC day changes nothing: the unique
//! idempotency key is the source of truth.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use greetline_core::models::{MessageLog, User};
use greetline_core::strategy::MessageStrategy;
use greetline_core::timezone::{
    candidate_month_days, is_event_today, nine_am_local_to_utc, today_in_zone,
};
use greetline_store::{CreateOutcome, MessageLogStore};

use crate::SchedulerDeps;

/// Users fetched per candidate page
const CANDIDATE_PAGE_SIZE: i64 = 500;

/// Counts for one pre-calc run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrecalcOutcome {
    pub created: u64,
    pub duplicates: u64,
    pub errors: u64,
}

/// Schedule one user for today's occurrence of a variant, if it applies.
///
/// Returns `None` when the variant does not apply (no event date, deleted
/// user, or not their day in their zone). Shared by pre-calc and the
/// user-created/updated entry points.
pub async fn schedule_user(
    logs: &dyn MessageLogStore,
    strategy: &dyn MessageStrategy,
    user: &User,
    now: DateTime<Utc>,
) -> Result<Option<CreateOutcome>> {
    if user.is_deleted() {
        return Ok(None);
    }
    let Some(event_date) = strategy.event_date(user) else {
        return Ok(None);
    };
    if !is_event_today(event_date, &user.timezone, now)? {
        return Ok(None);
    }

    let today_local = today_in_zone(&user.timezone, now)?;
    let target = strategy.target_date(user, today_local);
    let send_instant = nine_am_local_to_utc(target, &user.timezone)?;
    let content = strategy.render_for(user);

    let row = MessageLog::new(user.id, strategy.message_type(), send_instant, content);
    let outcome = logs.create_if_absent(&row).await?;
    Ok(Some(outcome))
}

/// One full pre-calc run across all registered variants
pub async fn run_precalc(deps: &SchedulerDeps, now: DateTime<Utc>) -> PrecalcOutcome {
    let mut outcome = PrecalcOutcome::default();
    let month_days = candidate_month_days(now);

    for strategy in deps.registry.all() {
        let message_type = strategy.message_type();
        let mut after = None;

        loop {
            let page = match deps
                .users
                .candidates_by_month_day(message_type, &month_days, after, CANDIDATE_PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    // Abort this variant's run; the next invocation catches up
                    error!(%message_type, "Candidate page fetch failed: {e}");
                    outcome.errors += 1;
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            after = page.last().map(|u| u.id);
            let page_len = page.len() as i64;

            for user in page {
                match schedule_user(deps.logs.as_ref(), strategy.as_ref(), &user, now).await {
                    Ok(Some(CreateOutcome::Created)) => {
                        outcome.created += 1;
                        deps.metrics.record_scheduled();
                    }
                    Ok(Some(CreateOutcome::AlreadyExists)) => {
                        outcome.duplicates += 1;
                        deps.metrics.record_duplicate();
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // One bad user never aborts the run
                        warn!(user_id = %user.id, %message_type, "Scheduling failed: {e}");
                        outcome.errors += 1;
                    }
                }
            }

            if page_len < CANDIDATE_PAGE_SIZE {
                break;
            }
        }
    }

    info!(
        created = outcome.created,
        duplicates = outcome.duplicates,
        errors = outcome.errors,
        "Pre-calc run complete"
    );
    outcome
}

/// Run pre-calc now (startup catch-up), then at every 00:00 UTC
pub async fn run_precalc_loop(deps: SchedulerDeps, shutdown: CancellationToken) {
    run_precalc(&deps, Utc::now()).await;

    loop {
        let now = Utc::now();
        let next_midnight = (now.date_naive() + ChronoDuration::days(1))
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now + ChronoDuration::days(1));
        let wait = (next_midnight - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                run_precalc(&deps, Utc::now()).await;
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
