//! Message-log store
//!
//! The message-log table is the authoritative record of every greeting.
//! All status mutation goes through compare-and-set transitions; the unique
//! idempotency key makes concurrent pre-calc runs collapse to one row per
//! (user, variant, day).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use sqlx::PgPool;
use tokio::sync::RwLock;

use greetline_core::backoff::next_retry_due;
use greetline_core::models::{MessageLog, MessageStatus, MessageType};
use greetline_core::types::{MessageLogId, UserId};

use crate::{StoreError, StoreResult};

/// Result of a guarded insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A row with the same idempotency key already exists. Expected under
    /// concurrent pre-calc runs; counted, never an error.
    AlreadyExists,
}

/// Field updates applied alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub increment_retry: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub response_code: Option<i32>,
}

/// Persistence seam for message-log rows
#[async_trait]
pub trait MessageLogStore: Send + Sync {
    /// Insert guarded by the unique idempotency key
    async fn create_if_absent(&self, row: &MessageLog) -> StoreResult<CreateOutcome>;

    async fn get(&self, id: MessageLogId) -> StoreResult<Option<MessageLog>>;

    /// SCHEDULED rows due within `now + horizon`, oldest first
    async fn find_due_for_enqueue(
        &self,
        now: DateTime<Utc>,
        horizon_secs: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>>;

    /// SCHEDULED rows more than `grace_secs` past due with retries left
    async fn find_overdue_scheduled(
        &self,
        now: DateTime<Utc>,
        grace_secs: i64,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>>;

    /// ENQUEUED rows untouched for longer than `threshold_secs`
    async fn find_stuck_enqueued(
        &self,
        now: DateTime<Utc>,
        threshold_secs: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>>;

    /// SENDING rows whose last attempt started longer than `threshold_secs` ago
    async fn find_stale_sending(
        &self,
        now: DateTime<Utc>,
        threshold_secs: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>>;

    /// FAILED rows whose deterministic next-retry instant has passed
    async fn find_retry_due_failed(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>>;

    /// Compare-and-set on `status`. Returns false when the row is not in
    /// `from` anymore; the losing caller exits cleanly.
    async fn transition(
        &self,
        id: MessageLogId,
        from: MessageStatus,
        to: MessageStatus,
        update: StatusUpdate,
    ) -> StoreResult<bool>;

    /// Recompute the send instant for a user's live (SCHEDULED/ENQUEUED)
    /// rows of one variant. The idempotency key and delivery date are never
    /// rewritten. Returns the number of rows updated.
    async fn update_schedule(
        &self,
        user_id: UserId,
        message_type: MessageType,
        new_instant: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Non-terminal (SCHEDULED/ENQUEUED/FAILED) rows for a user
    async fn find_active_for_user(&self, user_id: UserId) -> StoreResult<Vec<MessageLog>>;

    async fn count_with_status(&self, status: MessageStatus) -> StoreResult<i64>;

    /// Drop terminal rows older than `cutoff`. Retention hook for the
    /// recovery loop; returns rows removed.
    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

/// Postgres-backed message-log store
#[derive(Clone)]
pub struct PgMessageLogStore {
    pool: PgPool,
}

impl PgMessageLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageLogStore for PgMessageLogStore {
    async fn create_if_absent(&self, row: &MessageLog) -> StoreResult<CreateOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO message_logs (
                id, user_id, message_type, scheduled_send_time, delivery_date,
                status, retry_count, idempotency_key, last_attempt_at,
                last_error, response_code, message_content, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW(), NOW())
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(row.user_id)
        .bind(row.message_type)
        .bind(row.scheduled_send_time)
        .bind(row.delivery_date)
        .bind(row.status)
        .bind(row.retry_count)
        .bind(&row.idempotency_key)
        .bind(row.last_attempt_at)
        .bind(&row.last_error)
        .bind(row.response_code)
        .bind(&row.message_content)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(CreateOutcome::Created)
        } else {
            Ok(CreateOutcome::AlreadyExists)
        }
    }

    async fn get(&self, id: MessageLogId) -> StoreResult<Option<MessageLog>> {
        let row = sqlx::query_as::<_, MessageLog>("SELECT * FROM message_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_due_for_enqueue(
        &self,
        now: DateTime<Utc>,
        horizon_secs: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLog>(
            r#"
            SELECT * FROM message_logs
            WHERE status = 'SCHEDULED'
              AND scheduled_send_time <= $1
            ORDER BY scheduled_send_time
            LIMIT $2
            "#,
        )
        .bind(now + Duration::seconds(horizon_secs))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_overdue_scheduled(
        &self,
        now: DateTime<Utc>,
        grace_secs: i64,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLog>(
            r#"
            SELECT * FROM message_logs
            WHERE status = 'SCHEDULED'
              AND scheduled_send_time < $1
              AND retry_count < $2
            ORDER BY scheduled_send_time
            LIMIT $3
            "#,
        )
        .bind(now - Duration::seconds(grace_secs))
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_stuck_enqueued(
        &self,
        now: DateTime<Utc>,
        threshold_secs: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLog>(
            r#"
            SELECT * FROM message_logs
            WHERE status = 'ENQUEUED'
              AND updated_at < $1
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(now - Duration::seconds(threshold_secs))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_stale_sending(
        &self,
        now: DateTime<Utc>,
        threshold_secs: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLog>(
            r#"
            SELECT * FROM message_logs
            WHERE status = 'SENDING'
              AND last_attempt_at IS NOT NULL
              AND last_attempt_at < $1
            ORDER BY last_attempt_at
            LIMIT $2
            "#,
        )
        .bind(now - Duration::seconds(threshold_secs))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_retry_due_failed(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>> {
        // Mirrors backoff::next_retry_due: 2s * 2^retry_count, capped at 300s
        let rows = sqlx::query_as::<_, MessageLog>(
            r#"
            SELECT * FROM message_logs
            WHERE status = 'FAILED'
              AND retry_count < $1
              AND last_attempt_at IS NOT NULL
              AND last_attempt_at
                  + make_interval(secs => LEAST(300.0, 2.0 * POWER(2.0, retry_count))) < $2
            ORDER BY last_attempt_at
            LIMIT $3
            "#,
        )
        .bind(max_retries)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn transition(
        &self,
        id: MessageLogId,
        from: MessageStatus,
        to: MessageStatus,
        update: StatusUpdate,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message_logs
            SET status = $3,
                retry_count = retry_count + $4,
                last_attempt_at = COALESCE($5, last_attempt_at),
                last_error = COALESCE($6, last_error),
                response_code = COALESCE($7, response_code),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(i32::from(update.increment_retry))
        .bind(update.last_attempt_at)
        .bind(update.last_error)
        .bind(update.response_code)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_schedule(
        &self,
        user_id: UserId,
        message_type: MessageType,
        new_instant: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE message_logs
            SET scheduled_send_time = $3,
                updated_at = NOW()
            WHERE user_id = $1
              AND message_type = $2
              AND status IN ('SCHEDULED', 'ENQUEUED')
            "#,
        )
        .bind(user_id)
        .bind(message_type)
        .bind(new_instant)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_active_for_user(&self, user_id: UserId) -> StoreResult<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLog>(
            r#"
            SELECT * FROM message_logs
            WHERE user_id = $1
              AND status IN ('SCHEDULED', 'ENQUEUED', 'FAILED')
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_with_status(&self, status: MessageStatus) -> StoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM message_logs WHERE status = $1")
                .bind(status)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM message_logs
            WHERE status IN ('SENT', 'DEAD')
              AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// In-memory message-log store for tests and database-free local runs.
/// Semantics mirror the Postgres implementation, including CAS behavior.
#[derive(Default)]
pub struct InMemoryMessageLogStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<MessageLogId, MessageLog>,
    by_key: HashMap<String, MessageLogId>,
}

impl InMemoryMessageLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: total row count
    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.rows.is_empty()
    }

    /// Test hook: snapshot of all rows
    pub async fn all(&self) -> Vec<MessageLog> {
        self.inner.read().await.rows.values().cloned().collect()
    }
}

fn sorted_limited(mut rows: Vec<MessageLog>, limit: i64) -> Vec<MessageLog> {
    rows.sort_by_key(|r| r.scheduled_send_time);
    rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    rows
}

#[async_trait]
impl MessageLogStore for InMemoryMessageLogStore {
    async fn create_if_absent(&self, row: &MessageLog) -> StoreResult<CreateOutcome> {
        let mut inner = self.inner.write().await;
        if inner.by_key.contains_key(&row.idempotency_key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.by_key.insert(row.idempotency_key.clone(), row.id);
        inner.rows.insert(row.id, row.clone());
        Ok(CreateOutcome::Created)
    }

    async fn get(&self, id: MessageLogId) -> StoreResult<Option<MessageLog>> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    async fn find_due_for_enqueue(
        &self,
        now: DateTime<Utc>,
        horizon_secs: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>> {
        let cutoff = now + Duration::seconds(horizon_secs);
        let rows = self
            .inner
            .read()
            .await
            .rows
            .values()
            .filter(|r| r.status == MessageStatus::Scheduled && r.scheduled_send_time <= cutoff)
            .cloned()
            .collect();
        Ok(sorted_limited(rows, limit))
    }

    async fn find_overdue_scheduled(
        &self,
        now: DateTime<Utc>,
        grace_secs: i64,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>> {
        let cutoff = now - Duration::seconds(grace_secs);
        let rows = self
            .inner
            .read()
            .await
            .rows
            .values()
            .filter(|r| {
                r.status == MessageStatus::Scheduled
                    && r.scheduled_send_time < cutoff
                    && r.retry_count < max_retries
            })
            .cloned()
            .collect();
        Ok(sorted_limited(rows, limit))
    }

    async fn find_stuck_enqueued(
        &self,
        now: DateTime<Utc>,
        threshold_secs: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>> {
        let cutoff = now - Duration::seconds(threshold_secs);
        let rows = self
            .inner
            .read()
            .await
            .rows
            .values()
            .filter(|r| r.status == MessageStatus::Enqueued && r.updated_at < cutoff)
            .cloned()
            .collect();
        Ok(sorted_limited(rows, limit))
    }

    async fn find_stale_sending(
        &self,
        now: DateTime<Utc>,
        threshold_secs: i64,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>> {
        let cutoff = now - Duration::seconds(threshold_secs);
        let rows = self
            .inner
            .read()
            .await
            .rows
            .values()
            .filter(|r| {
                r.status == MessageStatus::Sending
                    && r.last_attempt_at.is_some_and(|at| at < cutoff)
            })
            .cloned()
            .collect();
        Ok(sorted_limited(rows, limit))
    }

    async fn find_retry_due_failed(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<MessageLog>> {
        let rows = self
            .inner
            .read()
            .await
            .rows
            .values()
            .filter(|r| {
                r.status == MessageStatus::Failed
                    && r.retry_count < max_retries
                    && r.last_attempt_at
                        .is_some_and(|at| next_retry_due(at, r.retry_count) < now)
            })
            .cloned()
            .collect();
        Ok(sorted_limited(rows, limit))
    }

    async fn transition(
        &self,
        id: MessageLogId,
        from: MessageStatus,
        to: MessageStatus,
        update: StatusUpdate,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(row) = inner.rows.get_mut(&id) else {
            return Ok(false);
        };
        if row.status != from {
            return Ok(false);
        }
        row.status = to;
        if update.increment_retry {
            row.retry_count += 1;
        }
        if let Some(at) = update.last_attempt_at {
            row.last_attempt_at = Some(at);
        }
        if let Some(err) = update.last_error {
            row.last_error = Some(err);
        }
        if let Some(code) = update.response_code {
            row.response_code = Some(code);
        }
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_schedule(
        &self,
        user_id: UserId,
        message_type: MessageType,
        new_instant: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let mut updated = 0;
        for row in inner.rows.values_mut() {
            if row.user_id == user_id
                && row.message_type == message_type
                && matches!(row.status, MessageStatus::Scheduled | MessageStatus::Enqueued)
            {
                row.scheduled_send_time = new_instant;
                row.updated_at = Utc::now();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn find_active_for_user(&self, user_id: UserId) -> StoreResult<Vec<MessageLog>> {
        let rows = self
            .inner
            .read()
            .await
            .rows
            .values()
            .filter(|r| {
                r.user_id == user_id
                    && matches!(
                        r.status,
                        MessageStatus::Scheduled | MessageStatus::Enqueued | MessageStatus::Failed
                    )
            })
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn count_with_status(&self, status: MessageStatus) -> StoreResult<i64> {
        let count = self
            .inner
            .read()
            .await
            .rows
            .values()
            .filter(|r| r.status == status)
            .count();
        Ok(count as i64)
    }

    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let doomed: Vec<MessageLogId> = inner
            .rows
            .values()
            .filter(|r| r.status.is_terminal() && r.updated_at < cutoff)
            .map(|r| r.id)
            .collect();
        for id in &doomed {
            if let Some(row) = inner.rows.remove(id) {
                inner.by_key.remove(&row.idempotency_key);
            }
        }
        Ok(doomed.len() as u64)
    }
}
