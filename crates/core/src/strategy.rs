//! Message strategies
//!
//! Each greeting variant declares its tag, its rendered content and the
//! calendar date whose 09:00 local is the send instant. New variants are
//! added by registering a strategy; the pipeline itself never changes.

use chrono::NaiveDate;
use std::sync::Arc;

use crate::models::{MessageType, User};

/// One greeting variant
pub trait MessageStrategy: Send + Sync {
    fn message_type(&self) -> MessageType;

    /// The stored calendar date this variant anchors on, if the user has one
    fn event_date(&self, user: &User) -> Option<NaiveDate>;

    /// The rendered message body for this user
    fn render_for(&self, user: &User) -> String;

    /// The date whose 09:00 local is the send instant. Same-day variants
    /// return today; reminder-style variants may shift.
    fn target_date(&self, _user: &User, today_local: NaiveDate) -> NaiveDate {
        today_local
    }
}

/// Birthday greeting.
///
/// The message body is a published contract; changing it is a breaking
/// change for downstream consumers.
pub struct BirthdayStrategy;

impl MessageStrategy for BirthdayStrategy {
    fn message_type(&self) -> MessageType {
        MessageType::Birthday
    }

    fn event_date(&self, user: &User) -> Option<NaiveDate> {
        user.birthday_date
    }

    fn render_for(&self, user: &User) -> String {
        format!(
            "Hey, {} {} it's your birthday",
            user.first_name, user.last_name
        )
    }
}

/// Anniversary greeting
pub struct AnniversaryStrategy;

impl MessageStrategy for AnniversaryStrategy {
    fn message_type(&self) -> MessageType {
        MessageType::Anniversary
    }

    fn event_date(&self, user: &User) -> Option<NaiveDate> {
        user.anniversary_date
    }

    fn render_for(&self, user: &User) -> String {
        format!(
            "Hey, {} {} happy anniversary!",
            user.first_name, user.last_name
        )
    }
}

/// Registry of active greeting variants
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn MessageStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn register(&mut self, strategy: Arc<dyn MessageStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn get(&self, message_type: MessageType) -> Option<&Arc<dyn MessageStrategy>> {
        self.strategies
            .iter()
            .find(|s| s.message_type() == message_type)
    }

    pub fn all(&self) -> &[Arc<dyn MessageStrategy>] {
        &self.strategies
    }
}

impl Default for StrategyRegistry {
    /// Registry with the shipped variants (birthday, anniversary)
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BirthdayStrategy));
        registry.register(Arc::new(AnniversaryStrategy));
        registry
    }
}
