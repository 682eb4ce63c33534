//! Rolling-window circuit breaker
//!
//! Keyed on the one external sender endpoint. The window holds recent call
//! results; when the error rate over the window crosses the threshold (and
//! the window has minimum volume), the circuit opens and calls fail fast.
//! After the cooldown a single half-open probe decides between closing and
//! reopening. Breaker state is per-process; replicas make independent
//! decisions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing; calls are rejected until the cooldown passes
    Open,
    /// Cooldown passed; one probe call is allowed through
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Rolling window length
    pub window: Duration,
    /// Error-rate percentage at which the circuit opens
    pub error_pct: u8,
    /// Minimum calls in the window before the circuit may open
    pub min_volume: u32,
    /// Open-state cooldown before the half-open probe
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            error_pct: 50,
            min_volume: 10,
            cooldown: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: CircuitState,
    /// (when, failed) per recorded call, pruned to the window
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call may proceed right now. Transitions Open -> HalfOpen
    /// once the cooldown has elapsed and admits exactly one probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.cooldown);
                if cooled {
                    tracing::info!("Circuit breaker half-open, admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a call result. `failed` should be true only for outcomes that
    /// indicate service ill-health (timeouts, 5xx, throttling), not for
    /// request-level rejections.
    pub fn record(&self, failed: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                if failed {
                    tracing::warn!("Circuit breaker probe failed, reopening");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                } else {
                    tracing::info!("Circuit breaker probe succeeded, closing");
                    inner.state = CircuitState::Closed;
                    inner.window.clear();
                }
            }
            CircuitState::Closed => {
                inner.window.push_back((now, failed));
                // checked_sub: early in process life `now` may be closer to
                // the monotonic epoch than the window length
                if let Some(horizon) = now.checked_sub(self.config.window) {
                    while inner
                        .window
                        .front()
                        .is_some_and(|(at, _)| *at < horizon)
                    {
                        inner.window.pop_front();
                    }
                }

                let volume = inner.window.len() as u32;
                if volume >= self.config.min_volume {
                    let failures = inner.window.iter().filter(|(_, f)| *f).count() as u64;
                    let rate_pct = failures * 100 / u64::from(volume);
                    if rate_pct >= u64::from(self.config.error_pct) {
                        tracing::warn!(
                            failures,
                            volume,
                            "Circuit breaker opening on error rate"
                        );
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(now);
                    }
                }
            }
            // Late results from calls that started before the trip
            CircuitState::Open => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Mutex poisoning is unrecoverable here
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            window: Duration::from_secs(10),
            error_pct: 50,
            min_volume: 4,
            cooldown: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_stays_closed_under_min_volume() {
        let breaker = CircuitBreaker::new(quick_config());
        for _ in 0..3 {
            assert!(breaker.allow());
            breaker.record(true);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_on_error_rate() {
        let breaker = CircuitBreaker::new(quick_config());
        breaker.record(true);
        breaker.record(true);
        breaker.record(false);
        breaker.record(false);
        // 2/4 failures = 50% at min volume
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_low_error_rate_keeps_circuit_closed() {
        let breaker = CircuitBreaker::new(quick_config());
        breaker.record(true);
        breaker.record(false);
        breaker.record(false);
        breaker.record(false);
        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(quick_config());
        for _ in 0..4 {
            breaker.record(true);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(60));
        // Exactly one probe is admitted
        assert!(breaker.allow());
        assert!(!breaker.allow());

        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn test_half_open_probe_reopens_on_failure() {
        let breaker = CircuitBreaker::new(quick_config());
        for _ in 0..4 {
            breaker.record(true);
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.allow());
        breaker.record(true);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_cooldown_gates_probe() {
        let breaker = CircuitBreaker::new(quick_config());
        for _ in 0..4 {
            breaker.record(true);
        }
        // Still cooling down
        assert!(!breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
