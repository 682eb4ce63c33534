//! User store adapter
//!
//! The users table is owned by the external CRUD collaborator; the pipeline
//! only reads it. Eligibility for "today" is resolved in two steps: a broad
//! month-day candidate query here (covering the UTC±14h window), then the
//! per-user timezone check in the timezone engine. Candidate reads are
//! keyset-paged so a 1M-user day never loads everyone at once.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

use greetline_core::models::{MessageType, User};
use greetline_core::types::UserId;

use crate::StoreResult;

/// Read seam over the externally-owned users table
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fetch a user by id. Soft-deleted users are not returned.
    async fn get_by_id(&self, id: UserId) -> StoreResult<Option<User>>;

    /// One page of non-deleted users whose stored event date for
    /// `message_type` matches any of the given (month, day) pairs, ordered
    /// by id, starting strictly after `after`.
    async fn candidates_by_month_day(
        &self,
        message_type: MessageType,
        month_days: &[(u32, u32)],
        after: Option<UserId>,
        limit: i64,
    ) -> StoreResult<Vec<User>>;
}

/// Postgres-backed user store
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn event_column(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Birthday => "birthday_date",
        MessageType::Anniversary => "anniversary_date",
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn candidates_by_month_day(
        &self,
        message_type: MessageType,
        month_days: &[(u32, u32)],
        after: Option<UserId>,
        limit: i64,
    ) -> StoreResult<Vec<User>> {
        if month_days.is_empty() {
            return Ok(Vec::new());
        }

        // The column name comes from a closed enum, not user input. The
        // month-day clauses are built per pair so the expression index on
        // (date_part month, date_part day) applies.
        let column = event_column(message_type);
        let mut clauses = Vec::with_capacity(month_days.len());
        let mut param = 1;
        for _ in month_days {
            clauses.push(format!(
                "(date_part('month', {column}) = ${param} AND date_part('day', {column}) = ${next})",
                next = param + 1
            ));
            param += 2;
        }
        let sql = format!(
            r#"
            SELECT * FROM users
            WHERE deleted_at IS NULL
              AND {column} IS NOT NULL
              AND ({clauses})
              AND (${cursor}::uuid IS NULL OR id > ${cursor})
            ORDER BY id
            LIMIT ${limit_param}
            "#,
            clauses = clauses.join(" OR "),
            cursor = param,
            limit_param = param + 1,
        );

        let mut query = sqlx::query_as::<_, User>(&sql);
        for (month, day) in month_days {
            query = query.bind(i32::try_from(*month).unwrap_or(0));
            query = query.bind(i32::try_from(*day).unwrap_or(0));
        }
        let users = query
            .bind(after.map(uuid::Uuid::from))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }
}

/// In-memory user store for tests and database-free local runs
#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<UserId, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user
    pub async fn upsert(&self, user: User) {
        self.users.write().await.insert(user.id, user);
    }

    /// Mark a user soft-deleted
    pub async fn soft_delete(&self, id: UserId) {
        if let Some(user) = self.users.write().await.get_mut(&id) {
            user.deleted_at = Some(Utc::now());
        }
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        let users = self.users.read().await;
        Ok(users.get(&id).filter(|u| !u.is_deleted()).cloned())
    }

    async fn candidates_by_month_day(
        &self,
        message_type: MessageType,
        month_days: &[(u32, u32)],
        after: Option<UserId>,
        limit: i64,
    ) -> StoreResult<Vec<User>> {
        use chrono::Datelike;

        let users = self.users.read().await;
        let mut page: Vec<User> = users
            .values()
            .filter(|u| !u.is_deleted())
            .filter(|u| {
                u.event_date(message_type)
                    .is_some_and(|d| month_days.contains(&(d.month(), d.day())))
            })
            .filter(|u| after.is_none_or(|a| u.id.0 > a.0))
            .cloned()
            .collect();
        page.sort_by_key(|u| u.id.0);
        page.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(page)
    }
}
