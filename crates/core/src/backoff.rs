//! Backoff policies
//!
//! Two layers of retry use these: the sender's in-call retries (smoothing
//! micro-blips) and the queue requeue delays (durable recovery across
//! restarts). Jittered delays use full jitter: a uniform draw from
//! [0, capped exponential delay].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngExt;
use std::time::Duration;

/// Exponential backoff with a cap
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

/// In-call sender retries: 1s base, x2, capped at 10s
pub const INNER_SEND: BackoffPolicy = BackoffPolicy {
    base: Duration::from_secs(1),
    factor: 2,
    cap: Duration::from_secs(10),
};

/// Queue requeue delays: 2s base, x2, capped at 5 minutes
pub const OUTER_REQUEUE: BackoffPolicy = BackoffPolicy {
    base: Duration::from_secs(2),
    factor: 2,
    cap: Duration::from_secs(300),
};

impl BackoffPolicy {
    /// Deterministic capped delay for the given zero-based attempt number
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self
            .factor
            .checked_pow(attempt)
            .map_or(u64::MAX, u64::from);
        let raw = self.base.as_millis().saturating_mul(u128::from(multiplier));
        let capped = raw.min(self.cap.as_millis());
        Duration::from_millis(capped as u64)
    }

    /// Full-jitter delay: uniform in [0, delay(attempt)]
    pub fn jittered(&self, attempt: u32) -> Duration {
        let ceiling = self.delay(attempt).as_millis() as u64;
        let millis = rand::rng().random_range(0..=ceiling);
        Duration::from_millis(millis)
    }
}

/// The earliest instant a FAILED row becomes due for another attempt.
///
/// Deterministic (no jitter) so that recovery sweeps across replicas agree
/// on what is overdue.
pub fn next_retry_due(last_attempt_at: DateTime<Utc>, retry_count: i32) -> DateTime<Utc> {
    let attempt = u32::try_from(retry_count).unwrap_or(u32::MAX);
    let delay = OUTER_REQUEUE.delay(attempt);
    last_attempt_at + ChronoDuration::milliseconds(delay.as_millis() as i64)
}
