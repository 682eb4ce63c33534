//! Postgres-backed queue
//!
//! Messages live in `queue_messages`; leasing marks `leased_until` under
//! `FOR UPDATE SKIP LOCKED` so concurrent consumers never double-lease a
//! visible message. Expired leases simply become visible again, which is
//! where at-least-once redelivery comes from. Dead letters move to
//! `queue_dead_letters` with the reason attached.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::{DeliveryPayload, DeliveryQueue, LeasedMessage, QueueResult};

/// Default lease visibility: generous enough for a slow send plus inner
/// retries, short enough that a crashed worker's messages come back well
/// inside the recovery sweeper's cadence.
const DEFAULT_VISIBILITY: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct PgDeliveryQueue {
    pool: PgPool,
    visibility: Duration,
}

impl PgDeliveryQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            visibility: DEFAULT_VISIBILITY,
        }
    }

    pub fn with_visibility(pool: PgPool, visibility: Duration) -> Self {
        Self { pool, visibility }
    }
}

#[async_trait]
impl DeliveryQueue for PgDeliveryQueue {
    async fn publish(&self, payload: DeliveryPayload, delay: Duration) -> QueueResult<()> {
        let available_at =
            Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, payload, available_at, created_at)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(serde_json::to_value(payload)?)
        .bind(available_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lease(&self, max: u32) -> QueueResult<Vec<LeasedMessage>> {
        let now = Utc::now();
        let leased_until =
            now + ChronoDuration::milliseconds(self.visibility.as_millis() as i64);

        let rows = sqlx::query(
            r#"
            UPDATE queue_messages
            SET leased_until = $1,
                delivery_count = delivery_count + 1
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE available_at <= $2
                  AND (leased_until IS NULL OR leased_until <= $2)
                ORDER BY available_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, delivery_count
            "#,
        )
        .bind(leased_until)
        .bind(now)
        .bind(i64::from(max))
        .fetch_all(&self.pool)
        .await?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.try_get("payload")?;
            leased.push(LeasedMessage {
                receipt: row.try_get("id")?,
                payload: serde_json::from_value(payload)?,
                delivery_count: row.try_get("delivery_count")?,
            });
        }
        Ok(leased)
    }

    async fn ack(&self, receipt: Uuid) -> QueueResult<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn requeue(&self, receipt: Uuid, delay: Duration) -> QueueResult<()> {
        let available_at =
            Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
        sqlx::query(
            r#"
            UPDATE queue_messages
            SET available_at = $2,
                leased_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(receipt)
        .bind(available_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letter(&self, receipt: Uuid, reason: &str) -> QueueResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO queue_dead_letters (id, payload, reason, dead_at)
            SELECT id, payload, $2, NOW()
            FROM queue_messages
            WHERE id = $1
            "#,
        )
        .bind(receipt)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(receipt)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn depth(&self) -> QueueResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn purge_dead_letters_older_than(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> QueueResult<u64> {
        let result = sqlx::query("DELETE FROM queue_dead_letters WHERE dead_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
