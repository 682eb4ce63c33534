//! Greetline Queue - durable work queue adapter
//!
//! The pipeline needs an at-least-once queue with delayed delivery,
//! per-message acknowledgement, a dead-letter queue and bounded prefetch.
//! Exactly-once is NOT required here; the message-log store enforces
//! idempotency. The default implementation rides the service's Postgres
//! (SKIP LOCKED leasing over a `queue_messages` table); an in-memory
//! implementation backs tests.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use greetline_core::types::MessageLogId;

/// Queue-layer errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unknown receipt: {0}")]
    UnknownReceipt(Uuid),
}

/// Result type alias for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// What workers pull off the queue. Everything else is re-read from the
/// message-log row, so redeliveries always see current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub message_log_id: MessageLogId,
    pub attempt: i32,
}

/// A leased message. The receipt must be settled exactly once with `ack`,
/// `requeue` or `dead_letter`; an unsettled lease becomes visible again
/// after the visibility timeout.
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub receipt: Uuid,
    pub payload: DeliveryPayload,
    /// How many times this message has been handed to a consumer
    pub delivery_count: i32,
}

/// Durable at-least-once queue seam
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Durably publish a payload, visible to consumers after `delay`
    async fn publish(&self, payload: DeliveryPayload, delay: Duration) -> QueueResult<()>;

    /// Lease up to `max` visible messages for this consumer
    async fn lease(&self, max: u32) -> QueueResult<Vec<LeasedMessage>>;

    /// Settle a lease: the message is done and removed
    async fn ack(&self, receipt: Uuid) -> QueueResult<()>;

    /// Settle a lease: make the message visible again after `delay`
    async fn requeue(&self, receipt: Uuid, delay: Duration) -> QueueResult<()>;

    /// Settle a lease: move the message to the dead-letter queue
    async fn dead_letter(&self, receipt: Uuid, reason: &str) -> QueueResult<()>;

    /// Messages currently in the queue (leased or visible)
    async fn depth(&self) -> QueueResult<i64>;

    /// Retention hook: drop dead letters older than `cutoff`
    async fn purge_dead_letters_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> QueueResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trips_as_json() {
        let payload = DeliveryPayload {
            message_log_id: MessageLogId::new(),
            attempt: 3,
        };
        let encoded = serde_json::to_value(payload).unwrap();
        let decoded: DeliveryPayload = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, payload);
    }
}
