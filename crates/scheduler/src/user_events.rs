//! User lifecycle entry points
//!
//! The user-CRUD collaborator notifies the pipeline through these plain
//! function-style hooks. Create/update schedule today's greeting when
//! applicable; timezone or event-date changes recompute live rows' send
//! instants; deletion dead-ends every live row for the user.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use greetline_core::models::User;
use greetline_core::timezone::{nine_am_local_to_utc, today_in_zone};
use greetline_core::types::UserId;
use greetline_store::{CreateOutcome, StatusUpdate};

use crate::SchedulerDeps;
use crate::precalc::schedule_user;

/// A user was created: schedule today's greetings where applicable
pub async fn on_user_created(deps: &SchedulerDeps, user: &User, now: DateTime<Utc>) -> Result<()> {
    for strategy in deps.registry.all() {
        match schedule_user(deps.logs.as_ref(), strategy.as_ref(), user, now).await? {
            Some(CreateOutcome::Created) => {
                deps.metrics.record_scheduled();
                info!(
                    user_id = %user.id,
                    message_type = %strategy.message_type(),
                    "Scheduled greeting for newly created user"
                );
            }
            Some(CreateOutcome::AlreadyExists) => {
                deps.metrics.record_duplicate();
            }
            None => {}
        }
    }
    Ok(())
}

/// A user was updated: schedule newly-applicable greetings, and recompute
/// live rows when the timezone or an event date changed.
///
/// SENT rows stay sent. SENDING rows are left alone; the in-flight attempt
/// completes first and later attempts pick up the new time.
pub async fn on_user_updated(
    deps: &SchedulerDeps,
    old: &User,
    new: &User,
    now: DateTime<Utc>,
) -> Result<()> {
    on_user_created(deps, new, now).await?;

    let zone_changed = old.timezone != new.timezone;
    for strategy in deps.registry.all() {
        let message_type = strategy.message_type();
        let date_changed = strategy.event_date(old) != strategy.event_date(new);
        if !zone_changed && !date_changed {
            continue;
        }

        let today_local = match today_in_zone(&new.timezone, now) {
            Ok(date) => date,
            Err(e) => {
                warn!(user_id = %new.id, "Reschedule skipped, bad timezone: {e}");
                continue;
            }
        };
        let target = strategy.target_date(new, today_local);
        let new_instant = match nine_am_local_to_utc(target, &new.timezone) {
            Ok(instant) => instant,
            Err(e) => {
                warn!(user_id = %new.id, "Reschedule skipped: {e}");
                continue;
            }
        };

        let updated = deps
            .logs
            .update_schedule(new.id, message_type, new_instant)
            .await?;
        if updated > 0 {
            info!(
                user_id = %new.id,
                %message_type,
                %new_instant,
                updated,
                "Rescheduled live rows after user update"
            );
        }
    }
    Ok(())
}

/// A user was deleted: dead-end every live row so nothing gets sent
pub async fn on_user_deleted(
    deps: &SchedulerDeps,
    user_id: UserId,
    _now: DateTime<Utc>,
) -> Result<()> {
    let rows = deps.logs.find_active_for_user(user_id).await?;
    for row in rows {
        let transitioned = deps
            .logs
            .transition(
                row.id,
                row.status,
                greetline_core::models::MessageStatus::Dead,
                StatusUpdate {
                    last_error: Some("user_removed".to_string()),
                    ..StatusUpdate::default()
                },
            )
            .await?;
        if transitioned {
            deps.metrics.record_dead();
            info!(id = %row.id, %user_id, "Dead-ended row for deleted user");
        }
    }
    Ok(())
}
