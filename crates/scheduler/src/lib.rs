//! Greetline Scheduler - the three cooperating schedulers
//!
//! Pre-calc materializes one message-log row per (user, event, today) at
//! 00:00 UTC and on startup; the minute dispatcher promotes due rows onto
//! the queue; the recovery sweeper replays anything stuck mid-pipeline.
//! Correctness never depends on only one instance running: every promotion
//! is a CAS and every insert is guarded by the idempotency key.

pub mod dispatcher;
pub mod precalc;
pub mod recovery;
pub mod user_events;

use std::sync::Arc;

use greetline_core::config::DeliveryConfig;
use greetline_core::metrics::DeliveryMetrics;
use greetline_core::strategy::StrategyRegistry;
use greetline_queue::DeliveryQueue;
use greetline_store::{MessageLogStore, UserStore};

pub use dispatcher::{DispatchOutcome, run_dispatch_tick, run_dispatcher_loop};
pub use precalc::{PrecalcOutcome, run_precalc, run_precalc_loop, schedule_user};
pub use recovery::{RecoveryOutcome, run_recovery_loop, run_recovery_sweep};

/// Shared dependencies of the scheduler tasks
#[derive(Clone)]
pub struct SchedulerDeps {
    pub users: Arc<dyn UserStore>,
    pub logs: Arc<dyn MessageLogStore>,
    pub queue: Arc<dyn DeliveryQueue>,
    pub registry: Arc<StrategyRegistry>,
    pub config: Arc<DeliveryConfig>,
    pub metrics: Arc<DeliveryMetrics>,
}
