//! Error types for Greetline core domain logic

use crate::models::MessageType;
use crate::types::UserId;
use thiserror::Error;

/// Core delivery domain errors
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Invalid timezone: {0}")]
    InvalidZone(String),

    #[error("User {user_id} has no {message_type} date")]
    MissingEventDate {
        user_id: UserId,
        message_type: MessageType,
    },

    #[error("Invalid event date for year {year}: {month:02}-{day:02}")]
    InvalidEventDate { year: i32, month: u32, day: u32 },

    #[error("No valid local time on or after 09:00 for {date} in {zone}")]
    UnmappableLocalTime {
        date: chrono::NaiveDate,
        zone: String,
    },
}

/// Result type alias for delivery domain operations
pub type DeliveryResult<T> = Result<T, DeliveryError>;
