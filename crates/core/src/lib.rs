//! Greetline Core - Domain logic and models
//!
//! This crate contains pure domain logic with no I/O operations:
//! the message-log state machine, timezone math, message strategies,
//! backoff policies, configuration and metrics counters.

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod strategy;
pub mod timezone;
pub mod types;

pub use error::DeliveryError;
pub use models::{MessageLog, MessageStatus, MessageType, User};
pub use strategy::{MessageStrategy, StrategyRegistry};
pub use timezone::{is_event_today, nine_am_local_to_utc, parse_timezone, validate_timezone};
pub use types::{MessageLogId, UserId};
