//! Core domain models for Greetline
//!
//! These models represent the core business entities and map to database tables.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MessageLogId, UserId};

/// User entity
///
/// Owned by the external user-CRUD collaborator; the pipeline only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub timezone: String, // IANA timezone (e.g., "America/New_York")
    pub birthday_date: Option<NaiveDate>,
    pub anniversary_date: Option<NaiveDate>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Soft-deleted users are never greeted
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// The stored calendar date for the given event variant, if any
    pub fn event_date(&self, message_type: MessageType) -> Option<NaiveDate> {
        match message_type {
            MessageType::Birthday => self.birthday_date,
            MessageType::Anniversary => self.anniversary_date,
        }
    }
}

/// Greeting variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(sqlx::Type)]
#[sqlx(type_name = "message_type", rename_all = "UPPERCASE")]
pub enum MessageType {
    Birthday,
    Anniversary,
}

impl MessageType {
    /// Stable wire/key form (used in idempotency keys and logs)
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Birthday => "BIRTHDAY",
            MessageType::Anniversary => "ANNIVERSARY",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message-log status
///
/// Initial state is `Scheduled`; `Sent` and `Dead` are terminal.
/// SCHEDULED → ENQUEUED → SENDING → {SENT | FAILED}; FAILED → ENQUEUED while
/// retries remain; exhausting retries lands in DEAD. Every transition is a
/// compare-and-set on the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(sqlx::Type)]
#[sqlx(type_name = "message_status", rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Scheduled,
    Enqueued,
    Sending,
    Sent,
    Failed,
    Dead,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Dead)
    }

    /// Stable wire/key form
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "SCHEDULED",
            MessageStatus::Enqueued => "ENQUEUED",
            MessageStatus::Sending => "SENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authoritative unit of work: one greeting for one user on one day
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(sqlx::FromRow)]
pub struct MessageLog {
    pub id: MessageLogId,
    pub user_id: UserId,
    pub message_type: MessageType,
    /// 09:00 local for (type, user, target date), as a UTC instant.
    /// Set once at creation; recomputed only when the user's timezone or
    /// event date changes while the row is still SCHEDULED/ENQUEUED.
    pub scheduled_send_time: DateTime<Utc>,
    /// floor(scheduled_send_time) in UTC; part of the idempotency key
    pub delivery_date: NaiveDate,
    pub status: MessageStatus,
    pub retry_count: i32,
    pub idempotency_key: String,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub response_code: Option<i32>,
    pub message_content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageLog {
    /// Build a fresh SCHEDULED row for (user, variant, send instant)
    pub fn new(
        user_id: UserId,
        message_type: MessageType,
        scheduled_send_time: DateTime<Utc>,
        message_content: String,
    ) -> Self {
        let delivery_date = scheduled_send_time.date_naive();
        let now = Utc::now();
        Self {
            id: MessageLogId::new(),
            user_id,
            message_type,
            scheduled_send_time,
            delivery_date,
            status: MessageStatus::Scheduled,
            retry_count: 0,
            idempotency_key: idempotency_key(user_id, message_type, delivery_date),
            last_attempt_at: None,
            last_error: None,
            response_code: None,
            message_content,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The globally-unique key enforcing one row per (user, variant, delivery day)
pub fn idempotency_key(
    user_id: UserId,
    message_type: MessageType,
    delivery_date: NaiveDate,
) -> String {
    format!(
        "{}:{}:{}",
        user_id,
        message_type.as_str(),
        delivery_date.format("%Y-%m-%d")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_user() -> User {
        let now = Utc::now();
        User {
            id: UserId::new(),
            first_name: "Alice".to_string(),
            last_name: "Smith".to_string(),
            email: "alice@example.com".to_string(),
            timezone: "America/New_York".to_string(),
            birthday_date: NaiveDate::from_ymd_opt(1990, 6, 15),
            anniversary_date: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_event_date_selects_by_variant() {
        let user = test_user();
        assert_eq!(
            user.event_date(MessageType::Birthday),
            NaiveDate::from_ymd_opt(1990, 6, 15)
        );
        assert_eq!(user.event_date(MessageType::Anniversary), None);
    }

    #[test]
    fn test_full_name() {
        assert_eq!(test_user().full_name(), "Alice Smith");
    }

    #[test]
    fn test_idempotency_key_format() {
        let user_id = UserId::new();
        let date = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        let key = idempotency_key(user_id, MessageType::Birthday, date);
        assert_eq!(key, format!("{user_id}:BIRTHDAY:2025-06-15"));
    }

    #[test]
    fn test_new_row_derives_delivery_date_from_utc_floor() {
        // 9am in Auckland lands on the previous UTC calendar day
        let send = Utc.with_ymd_and_hms(2025, 6, 14, 21, 0, 0).unwrap();
        let row = MessageLog::new(
            UserId::new(),
            MessageType::Birthday,
            send,
            "hi".to_string(),
        );
        assert_eq!(row.delivery_date, NaiveDate::from_ymd_opt(2025, 6, 14).unwrap());
        assert_eq!(row.status, MessageStatus::Scheduled);
        assert_eq!(row.retry_count, 0);
        assert!(row.idempotency_key.ends_with(":BIRTHDAY:2025-06-14"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Dead.is_terminal());
        assert!(!MessageStatus::Scheduled.is_terminal());
        assert!(!MessageStatus::Enqueued.is_terminal());
        assert!(!MessageStatus::Sending.is_terminal());
        assert!(!MessageStatus::Failed.is_terminal());
    }
}
