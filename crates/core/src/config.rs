//! Configuration
//!
//! Loads configuration from environment variables. Every knob has a default;
//! only DATABASE_URL is required.

use anyhow::{Context, Result};
use std::env;

/// Common configuration used across services
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Database connection URL
    pub database_url: String,
}

impl CoreConfig {
    /// Load common configuration from environment variables
    ///
    /// This will also initialize dotenv if it hasn't been done yet.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
        })
    }
}

/// Delivery-pipeline tuning knobs
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Dispatcher tick period in seconds
    pub dispatch_interval_secs: u64,
    /// Recovery sweeper tick period in seconds
    pub recovery_interval_secs: u64,
    /// Dispatcher lookahead window in seconds
    pub dispatch_horizon_secs: u64,
    /// Rows promoted per dispatcher tick
    pub dispatch_batch_limit: i64,
    /// Worker pool size per process
    pub worker_count: usize,
    /// Queue prefetch per worker
    pub worker_prefetch: u32,
    /// Outer (requeue) retries per row
    pub max_retries: i32,
    /// Per-call sender timeout in seconds
    pub send_timeout_secs: u64,
    /// In-call sender attempts
    pub inner_retries: u32,
    /// Circuit breaker rolling window in seconds
    pub breaker_window_secs: u64,
    /// Circuit breaker error-rate open threshold, percent
    pub breaker_error_pct: u8,
    /// Minimum calls in the window before the breaker may open
    pub breaker_min_volume: u32,
    /// Open-state cooldown before the half-open probe, seconds
    pub breaker_reset_secs: u64,
    /// Recovery: SENDING rows older than this are considered stale, seconds
    pub stale_sending_secs: i64,
    /// Recovery: ENQUEUED rows untouched for this long go back to SCHEDULED, seconds
    pub stuck_enqueued_secs: i64,
    /// Recovery: SCHEDULED rows this far past due are swept, seconds
    pub sweep_grace_secs: i64,
    /// Drain window on shutdown, seconds
    pub graceful_shutdown_secs: u64,
    /// External email service endpoint
    pub email_service_url: String,
    /// Terminal rows older than this many days are purged; 0 disables
    pub retention_days: i64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: 60,
            recovery_interval_secs: 600,
            dispatch_horizon_secs: 3600,
            dispatch_batch_limit: 1000,
            worker_count: 10,
            worker_prefetch: 5,
            max_retries: 5,
            send_timeout_secs: 30,
            inner_retries: 3,
            breaker_window_secs: 10,
            breaker_error_pct: 50,
            breaker_min_volume: 10,
            breaker_reset_secs: 30,
            stale_sending_secs: 300,
            stuck_enqueued_secs: 900,
            sweep_grace_secs: 120,
            graceful_shutdown_secs: 30,
            email_service_url: "https://email-service.digitalenvision.com.au/send-email"
                .to_string(),
            retention_days: 0,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .ok()
            .with_context(|| format!("{key} must be a valid value, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl DeliveryConfig {
    /// Load delivery configuration from `GREETLINE_*` environment variables,
    /// falling back to the documented defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            dispatch_interval_secs: env_parsed(
                "GREETLINE_DISPATCH_INTERVAL_SECS",
                defaults.dispatch_interval_secs,
            )?,
            recovery_interval_secs: env_parsed(
                "GREETLINE_RECOVERY_INTERVAL_SECS",
                defaults.recovery_interval_secs,
            )?,
            dispatch_horizon_secs: env_parsed(
                "GREETLINE_DISPATCH_HORIZON_SECS",
                defaults.dispatch_horizon_secs,
            )?,
            dispatch_batch_limit: env_parsed(
                "GREETLINE_DISPATCH_BATCH_LIMIT",
                defaults.dispatch_batch_limit,
            )?,
            worker_count: env_parsed("GREETLINE_WORKER_COUNT", defaults.worker_count)?,
            worker_prefetch: env_parsed("GREETLINE_WORKER_PREFETCH", defaults.worker_prefetch)?,
            max_retries: env_parsed("GREETLINE_MAX_RETRIES", defaults.max_retries)?,
            send_timeout_secs: env_parsed(
                "GREETLINE_SEND_TIMEOUT_SECS",
                defaults.send_timeout_secs,
            )?,
            inner_retries: env_parsed("GREETLINE_INNER_RETRIES", defaults.inner_retries)?,
            breaker_window_secs: env_parsed(
                "GREETLINE_BREAKER_WINDOW_SECS",
                defaults.breaker_window_secs,
            )?,
            breaker_error_pct: env_parsed(
                "GREETLINE_BREAKER_ERROR_PCT",
                defaults.breaker_error_pct,
            )?,
            breaker_min_volume: env_parsed(
                "GREETLINE_BREAKER_MIN_VOLUME",
                defaults.breaker_min_volume,
            )?,
            breaker_reset_secs: env_parsed(
                "GREETLINE_BREAKER_RESET_SECS",
                defaults.breaker_reset_secs,
            )?,
            stale_sending_secs: env_parsed(
                "GREETLINE_STALE_SENDING_SECS",
                defaults.stale_sending_secs,
            )?,
            stuck_enqueued_secs: env_parsed(
                "GREETLINE_STUCK_ENQUEUED_SECS",
                defaults.stuck_enqueued_secs,
            )?,
            sweep_grace_secs: env_parsed("GREETLINE_SWEEP_GRACE_SECS", defaults.sweep_grace_secs)?,
            graceful_shutdown_secs: env_parsed(
                "GREETLINE_GRACEFUL_SHUTDOWN_SECS",
                defaults.graceful_shutdown_secs,
            )?,
            email_service_url: env::var("EMAIL_SERVICE_URL")
                .unwrap_or(defaults.email_service_url),
            retention_days: env_parsed("GREETLINE_RETENTION_DAYS", defaults.retention_days)?,
        })
    }
}
