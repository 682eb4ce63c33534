//! In-memory queue for tests and database-free local runs
//!
//! Mirrors the Postgres queue's semantics: delayed visibility, leasing with
//! a visibility timeout, requeue and a dead-letter store.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{DeliveryPayload, DeliveryQueue, LeasedMessage, QueueError, QueueResult};

#[derive(Debug, Clone)]
struct Entry {
    payload: DeliveryPayload,
    available_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
    delivery_count: i32,
}

/// A dead-lettered message with its reason, inspectable from tests
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub payload: DeliveryPayload,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    entries: HashMap<Uuid, Entry>,
    dead: Vec<DeadLetter>,
}

pub struct InMemoryDeliveryQueue {
    state: Mutex<State>,
    visibility: Duration,
}

impl Default for InMemoryDeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility: Duration::from_secs(300),
        }
    }

    pub fn with_visibility(visibility: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility,
        }
    }

    /// Test hook: dead-lettered messages in arrival order
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }

    /// Test hook: collapse all publish delays so every unleased message is
    /// immediately leasable
    pub async fn make_all_visible(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for entry in state.entries.values_mut() {
            if entry.available_at > now {
                entry.available_at = now;
            }
        }
    }

    /// Test hook: messages currently visible to a consumer
    pub async fn visible_len(&self) -> usize {
        let now = Utc::now();
        self.state
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.available_at <= now && e.leased_until.is_none_or(|l| l <= now))
            .count()
    }
}

fn chrono_delay(delay: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(delay.as_millis() as i64)
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn publish(&self, payload: DeliveryPayload, delay: Duration) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.entries.insert(
            Uuid::new_v4(),
            Entry {
                payload,
                available_at: Utc::now() + chrono_delay(delay),
                leased_until: None,
                delivery_count: 0,
            },
        );
        Ok(())
    }

    async fn lease(&self, max: u32) -> QueueResult<Vec<LeasedMessage>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let mut visible: Vec<(Uuid, DateTime<Utc>)> = state
            .entries
            .iter()
            .filter(|(_, e)| e.available_at <= now && e.leased_until.is_none_or(|l| l <= now))
            .map(|(id, e)| (*id, e.available_at))
            .collect();
        visible.sort_by_key(|(_, at)| *at);
        visible.truncate(max as usize);

        let leased_until = now + chrono_delay(self.visibility);
        let mut out = Vec::with_capacity(visible.len());
        for (id, _) in visible {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.leased_until = Some(leased_until);
                entry.delivery_count += 1;
                out.push(LeasedMessage {
                    receipt: id,
                    payload: entry.payload,
                    delivery_count: entry.delivery_count,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, receipt: Uuid) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state
            .entries
            .remove(&receipt)
            .ok_or(QueueError::UnknownReceipt(receipt))?;
        Ok(())
    }

    async fn requeue(&self, receipt: Uuid, delay: Duration) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(&receipt)
            .ok_or(QueueError::UnknownReceipt(receipt))?;
        entry.available_at = Utc::now() + chrono_delay(delay);
        entry.leased_until = None;
        Ok(())
    }

    async fn dead_letter(&self, receipt: Uuid, reason: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .remove(&receipt)
            .ok_or(QueueError::UnknownReceipt(receipt))?;
        state.dead.push(DeadLetter {
            payload: entry.payload,
            reason: reason.to_string(),
            dead_at: Utc::now(),
        });
        Ok(())
    }

    async fn depth(&self) -> QueueResult<i64> {
        Ok(self.state.lock().await.entries.len() as i64)
    }

    async fn purge_dead_letters_older_than(&self, cutoff: DateTime<Utc>) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.dead.len();
        state.dead.retain(|d| d.dead_at >= cutoff);
        Ok((before - state.dead.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greetline_core::types::MessageLogId;

    fn payload() -> DeliveryPayload {
        DeliveryPayload {
            message_log_id: MessageLogId::new(),
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_publish_lease_ack() {
        let queue = InMemoryDeliveryQueue::new();
        queue.publish(payload(), Duration::ZERO).await.unwrap();

        let leased = queue.lease(10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].delivery_count, 1);

        // Leased messages are invisible to other consumers
        assert!(queue.lease(10).await.unwrap().is_empty());

        queue.ack(leased[0].receipt).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delayed_message_not_visible_until_due() {
        let queue = InMemoryDeliveryQueue::new();
        queue
            .publish(payload(), Duration::from_millis(60))
            .await
            .unwrap();

        assert!(queue.lease(10).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.lease(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_makes_message_visible_again() {
        let queue = InMemoryDeliveryQueue::new();
        queue.publish(payload(), Duration::ZERO).await.unwrap();

        let leased = queue.lease(10).await.unwrap();
        queue
            .requeue(leased[0].receipt, Duration::ZERO)
            .await
            .unwrap();

        let again = queue.lease(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let queue = InMemoryDeliveryQueue::with_visibility(Duration::from_millis(40));
        queue.publish(payload(), Duration::ZERO).await.unwrap();

        let first = queue.lease(10).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = queue.lease(10).await.unwrap();
        assert_eq!(second.len(), 1, "expired lease should become visible");
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_records_reason() {
        let queue = InMemoryDeliveryQueue::new();
        let p = payload();
        queue.publish(p, Duration::ZERO).await.unwrap();

        let leased = queue.lease(10).await.unwrap();
        queue
            .dead_letter(leased[0].receipt, "retries exhausted")
            .await
            .unwrap();

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, p);
        assert_eq!(dead[0].reason, "retries exhausted");
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lease_respects_prefetch_bound() {
        let queue = InMemoryDeliveryQueue::new();
        for _ in 0..7 {
            queue.publish(payload(), Duration::ZERO).await.unwrap();
        }
        assert_eq!(queue.lease(5).await.unwrap().len(), 5);
        assert_eq!(queue.lease(5).await.unwrap().len(), 2);
    }
}
