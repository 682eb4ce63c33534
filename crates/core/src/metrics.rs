//! Process-wide delivery counters
//!
//! A single `DeliveryMetrics` is shared by the schedulers, the worker pool
//! and the sender. Counters only; the observability stack that scrapes or
//! ships them lives outside this service.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for the delivery pipeline
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    scheduled_total: AtomicU64,
    duplicate_total: AtomicU64,
    enqueued_total: AtomicU64,
    sent_total: AtomicU64,
    transient_failure_total: AtomicU64,
    permanent_failure_total: AtomicU64,
    dead_total: AtomicU64,
    recovery_requeued_total: AtomicU64,
    circuit_open_total: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub scheduled_total: u64,
    pub duplicate_total: u64,
    pub enqueued_total: u64,
    pub sent_total: u64,
    pub transient_failure_total: u64,
    pub permanent_failure_total: u64,
    pub dead_total: u64,
    pub recovery_requeued_total: u64,
    pub circuit_open_total: u64,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scheduled(&self) {
        self.scheduled_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self) {
        self.enqueued_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_failure(&self) {
        self.transient_failure_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permanent_failure(&self) {
        self.permanent_failure_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead(&self) {
        self.dead_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_requeue(&self) {
        self.recovery_requeued_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_open(&self) {
        self.circuit_open_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scheduled_total: self.scheduled_total.load(Ordering::Relaxed),
            duplicate_total: self.duplicate_total.load(Ordering::Relaxed),
            enqueued_total: self.enqueued_total.load(Ordering::Relaxed),
            sent_total: self.sent_total.load(Ordering::Relaxed),
            transient_failure_total: self.transient_failure_total.load(Ordering::Relaxed),
            permanent_failure_total: self.permanent_failure_total.load(Ordering::Relaxed),
            dead_total: self.dead_total.load(Ordering::Relaxed),
            recovery_requeued_total: self.recovery_requeued_total.load(Ordering::Relaxed),
            circuit_open_total: self.circuit_open_total.load(Ordering::Relaxed),
        }
    }
}
