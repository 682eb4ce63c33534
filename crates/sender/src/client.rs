//! HTTP email client
//!
//! POSTs `{ "email": ..., "message": ... }` to the external email service.
//! Response classification: any 2xx is sent; 408/425/429 and 5xx (and
//! timeouts/connection errors) are transient; other 4xx are permanent and
//! short-circuit retries.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use greetline_core::backoff::{BackoffPolicy, INNER_SEND};
use greetline_core::config::DeliveryConfig;
use greetline_core::metrics::DeliveryMetrics;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::{SendOutcome, Sender, SenderError};

/// Wire envelope of the external email service
#[derive(Serialize)]
struct EmailRequest<'a> {
    email: &'a str,
    message: &'a str,
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub url: String,
    pub timeout: Duration,
    /// Total in-call attempts (initial attempt included)
    pub inner_retries: u32,
    pub inner_backoff: BackoffPolicy,
    pub breaker: BreakerConfig,
}

impl SenderConfig {
    pub fn from_delivery(config: &DeliveryConfig) -> Self {
        Self {
            url: config.email_service_url.clone(),
            timeout: Duration::from_secs(config.send_timeout_secs),
            inner_retries: config.inner_retries.max(1),
            inner_backoff: INNER_SEND,
            breaker: BreakerConfig {
                window: Duration::from_secs(config.breaker_window_secs),
                error_pct: config.breaker_error_pct,
                min_volume: config.breaker_min_volume,
                cooldown: Duration::from_secs(config.breaker_reset_secs),
            },
        }
    }
}

/// Email sender over HTTP with timeout, in-call retries and circuit breaker
pub struct HttpEmailSender {
    http: reqwest::Client,
    url: String,
    inner_retries: u32,
    inner_backoff: BackoffPolicy,
    breaker: CircuitBreaker,
    metrics: Arc<DeliveryMetrics>,
}

impl HttpEmailSender {
    pub fn new(config: SenderConfig, metrics: Arc<DeliveryMetrics>) -> Result<Self, SenderError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            url: config.url,
            inner_retries: config.inner_retries.max(1),
            inner_backoff: config.inner_backoff,
            breaker: CircuitBreaker::new(config.breaker),
            metrics,
        })
    }

    async fn attempt(&self, to: &str, message: &str) -> SendOutcome {
        let result = self
            .http
            .post(&self.url)
            .json(&EmailRequest { email: to, message })
            .send()
            .await;
        classify(result)
    }
}

fn classify(result: Result<reqwest::Response, reqwest::Error>) -> SendOutcome {
    match result {
        Ok(response) => {
            let status = response.status();
            let code = status.as_u16();
            if status.is_success() {
                SendOutcome::Sent { code }
            } else if matches!(code, 408 | 425 | 429) || status.is_server_error() {
                SendOutcome::TransientFailure {
                    reason: format!("http status {code}"),
                    code: Some(code),
                }
            } else if status.is_client_error() {
                SendOutcome::PermanentFailure {
                    reason: format!("http status {code}"),
                    code,
                }
            } else {
                SendOutcome::TransientFailure {
                    reason: format!("unexpected http status {code}"),
                    code: Some(code),
                }
            }
        }
        Err(err) if err.is_timeout() => SendOutcome::TransientFailure {
            reason: "timeout".to_string(),
            code: None,
        },
        Err(err) => SendOutcome::TransientFailure {
            reason: err.to_string(),
            code: None,
        },
    }
}

#[async_trait]
impl Sender for HttpEmailSender {
    async fn send(&self, to: &str, message: &str) -> SendOutcome {
        let mut last = SendOutcome::TransientFailure {
            reason: "no attempt made".to_string(),
            code: None,
        };

        for attempt in 0..self.inner_retries {
            if !self.breaker.allow() {
                self.metrics.record_circuit_open();
                return SendOutcome::TransientFailure {
                    reason: "circuit_open".to_string(),
                    code: None,
                };
            }

            let outcome = self.attempt(to, message).await;
            // Only ill-health outcomes count against the breaker window
            self.breaker.record(outcome.is_transient());

            match outcome {
                SendOutcome::TransientFailure { ref reason, code } => {
                    debug!(attempt, reason = %reason, ?code, "Transient send failure");
                    last = outcome;
                    if attempt + 1 < self.inner_retries {
                        tokio::time::sleep(self.inner_backoff.jittered(attempt)).await;
                    }
                }
                other => return other,
            }
        }

        warn!(
            attempts = self.inner_retries,
            "Send attempts exhausted with transient failures"
        );
        last
    }
}
