//! Greetline Store - persistence adapters
//!
//! Trait seams over the message-log table (the single source of truth for
//! delivery state) and the externally-owned users table. Each seam ships a
//! Postgres implementation for production and an in-memory implementation
//! for tests and local runs without a database.

pub mod message_logs;
pub mod users;

use thiserror::Error;

/// Store-layer errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

pub use message_logs::{
    CreateOutcome, InMemoryMessageLogStore, MessageLogStore, PgMessageLogStore, StatusUpdate,
};
pub use users::{InMemoryUserStore, PgUserStore, UserStore};
