//! Scripted sender for tests
//!
//! Pops a queued outcome per call (falling back to success) and records
//! every (recipient, message) pair for assertions. Used by worker and
//! pipeline tests in place of the HTTP client.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::{SendOutcome, Sender};

#[derive(Default)]
pub struct ScriptedSender {
    script: Mutex<VecDeque<SendOutcome>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for the next unscripted call
    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.script
            .lock()
            .expect("scripted sender mutex poisoned")
            .push_back(outcome);
    }

    /// Every (recipient, message) pair seen so far
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .expect("scripted sender mutex poisoned")
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .expect("scripted sender mutex poisoned")
            .len()
    }
}

#[async_trait]
impl Sender for ScriptedSender {
    async fn send(&self, to: &str, message: &str) -> SendOutcome {
        self.calls
            .lock()
            .expect("scripted sender mutex poisoned")
            .push((to.to_string(), message.to_string()));
        self.script
            .lock()
            .expect("scripted sender mutex poisoned")
            .pop_front()
            .unwrap_or(SendOutcome::Sent { code: 200 })
    }
}
