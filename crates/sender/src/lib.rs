//! Greetline Sender - HTTP email egress
//!
//! One unit of "send this rendered message to this recipient" against the
//! external email service, with defense against a flaky dependency: a
//! per-call timeout, in-call retries with full jitter, and a rolling-window
//! circuit breaker. Outer, durable retries live in the worker/queue layer;
//! the retries here only smooth micro-blips.

pub mod breaker;
pub mod client;
pub mod scripted;

use async_trait::async_trait;
use thiserror::Error;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use client::{HttpEmailSender, SenderConfig};
pub use scripted::ScriptedSender;

/// Sender construction errors
#[derive(Error, Debug)]
pub enum SenderError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Outcome of one `send` call (after in-call retries)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent {
        code: u16,
    },
    /// Worth retrying later: timeout, connection error, 5xx, throttling
    TransientFailure {
        reason: String,
        code: Option<u16>,
    },
    /// Never worth retrying: the service rejected the request itself
    PermanentFailure {
        reason: String,
        code: u16,
    },
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SendOutcome::TransientFailure { .. })
    }

    /// HTTP status, when one was received
    pub fn response_code(&self) -> Option<i32> {
        match self {
            SendOutcome::Sent { code } => Some(i32::from(*code)),
            SendOutcome::TransientFailure { code, .. } => code.map(i32::from),
            SendOutcome::PermanentFailure { code, .. } => Some(i32::from(*code)),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SendOutcome::Sent { .. } => None,
            SendOutcome::TransientFailure { reason, .. }
            | SendOutcome::PermanentFailure { reason, .. } => Some(reason),
        }
    }
}

/// The send seam the worker pool depends on
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, to: &str, message: &str) -> SendOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_accessors() {
        let sent = SendOutcome::Sent { code: 200 };
        assert!(sent.is_sent());
        assert_eq!(sent.response_code(), Some(200));
        assert_eq!(sent.reason(), None);

        let transient = SendOutcome::TransientFailure {
            reason: "timeout".to_string(),
            code: None,
        };
        assert!(transient.is_transient());
        assert_eq!(transient.response_code(), None);
        assert_eq!(transient.reason(), Some("timeout"));

        let permanent = SendOutcome::PermanentFailure {
            reason: "bad request".to_string(),
            code: 400,
        };
        assert!(!permanent.is_transient());
        assert_eq!(permanent.response_code(), Some(400));
    }
}
