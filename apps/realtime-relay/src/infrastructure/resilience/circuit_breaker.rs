//! Circuit breaker for upstream operations.
//!
//! Counts consecutive failures and refuses calls while the upstream looks
//! unhealthy, so a dead backend costs one fast denial instead of one timeout
//! per caller.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN (consecutive failures >= threshold)
//! OPEN → HALF_OPEN (reset timeout elapsed since the last failure)
//! HALF_OPEN → CLOSED (trial succeeds)
//! HALF_OPEN → OPEN (trial fails)
//! ```
//!
//! The `OPEN → HALF_OPEN` transition happens inside [`CircuitBreaker::can_request`],
//! which then admits one trial per `half_open_retry_interval`.
//!
//! # Example
//!
//! ```rust
//! use realtime_relay::domain::state::CircuitState;
//! use realtime_relay::infrastructure::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("upstream", CircuitBreakerConfig::default());
//!
//! if breaker.can_request() {
//!     breaker.record_success();
//! }
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::domain::clock::{SharedClock, duration_millis, system_clock};
use crate::domain::state::CircuitState;
use crate::infrastructure::metrics;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open after the last failure.
    pub reset_timeout: Duration,
    /// Minimum spacing between trials while half-open.
    pub half_open_retry_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_retry_interval: Duration::from_secs(5),
        }
    }
}

/// Listener invoked on every state transition with the new state and a reason.
pub type StateListener = Arc<dyn Fn(CircuitState, &str) + Send + Sync>;

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at_ms: Option<u64>,
    last_trial_ms: Option<u64>,
    total_failures: u64,
    total_successes: u64,
    transitions: u64,
}

/// Snapshot of breaker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures.
    pub failure_count: u32,
    /// Failures recorded since creation.
    pub total_failures: u64,
    /// Successes recorded since creation.
    pub total_successes: u64,
    /// Transitions since creation.
    pub transitions: u64,
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerState>,
    listeners: RwLock<Vec<StateListener>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("listeners", &self.listeners.read().len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a breaker on the system clock.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    /// Create a breaker on a specific clock.
    #[must_use]
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        let config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            ..config
        };
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Never transitions.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Register a transition listener.
    pub fn on_state_change(&self, listener: impl Fn(CircuitState, &str) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Whether an operation may be attempted now.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open and
    /// admits the caller as its first trial.
    pub fn can_request(&self) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = inner.opened_at_ms.unwrap_or(0);
                if now.saturating_sub(opened_at) < duration_millis(self.config.reset_timeout) {
                    return false;
                }
                inner.last_trial_ms = Some(now);
                let transition = Self::transition(&mut inner, CircuitState::HalfOpen);
                drop(inner);
                self.announce(transition, "reset timeout elapsed, admitting trial request");
                true
            }
            CircuitState::HalfOpen => {
                let interval = duration_millis(self.config.half_open_retry_interval);
                let due = inner
                    .last_trial_ms
                    .is_none_or(|last| now.saturating_sub(last) >= interval);
                if due {
                    inner.last_trial_ms = Some(now);
                }
                due
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.total_successes += 1;

        let transition = if inner.state == CircuitState::HalfOpen {
            inner.opened_at_ms = None;
            inner.last_trial_ms = None;
            Self::transition(&mut inner, CircuitState::Closed)
        } else {
            None
        };
        drop(inner);

        self.announce(transition, "trial request succeeded");
    }

    /// Record a failed operation.
    pub fn record_failure(&self, error: &impl std::fmt::Display) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.total_failures += 1;

        let (transition, reason) = match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.opened_at_ms = Some(now);
                let reason = format!(
                    "{} consecutive failures, last: {error}",
                    inner.failure_count
                );
                (Self::transition(&mut inner, CircuitState::Open), reason)
            }
            CircuitState::Closed => (None, String::new()),
            CircuitState::HalfOpen => {
                inner.opened_at_ms = Some(now);
                let reason = format!("trial request failed: {error}");
                (Self::transition(&mut inner, CircuitState::Open), reason)
            }
            CircuitState::Open => {
                inner.opened_at_ms = Some(now);
                (None, String::new())
            }
        };
        let failure_count = inner.failure_count;
        drop(inner);

        tracing::debug!(
            name = %self.name,
            failure_count,
            error = %error,
            "Circuit breaker recorded failure"
        );
        self.announce(transition, &reason);
    }

    /// Snapshot of counters.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            transitions: inner.transitions,
        }
    }

    /// Force the circuit open (for operators or tests).
    pub fn force_open(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        inner.opened_at_ms = Some(now);
        let transition = Self::transition(&mut inner, CircuitState::Open);
        drop(inner);
        self.announce(transition, "forced open");
    }

    /// Force the circuit closed and clear the failure count.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.opened_at_ms = None;
        inner.last_trial_ms = None;
        let transition = Self::transition(&mut inner, CircuitState::Closed);
        drop(inner);
        self.announce(transition, "forced closed");
    }

    fn transition(inner: &mut BreakerState, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.transitions += 1;
        Some((from, to))
    }

    fn announce(&self, transition: Option<(CircuitState, CircuitState)>, reason: &str) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => {
                tracing::warn!(name = %self.name, %from, %to, reason, "Circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                tracing::info!(name = %self.name, %from, %to, reason, "Circuit breaker testing");
            }
            CircuitState::Closed => {
                tracing::info!(name = %self.name, %from, %to, reason, "Circuit breaker closed");
            }
        }
        metrics::record_circuit_transition(&self.name, to);

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(to, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::domain::clock::ManualClock;

    fn breaker(threshold: u32, reset_ms: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
            half_open_retry_interval: Duration::from_millis(200),
        };
        (
            CircuitBreaker::with_clock("test", config, clock.clone()),
            clock,
        )
    }

    #[test]
    fn initial_state_is_closed() {
        let (breaker, _) = breaker(3, 1_000);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_request());
    }

    #[test]
    fn threshold_three_reset_one_second_scenario() {
        let (breaker, clock) = breaker(3, 1_000);

        breaker.record_failure(&"refused");
        breaker.record_failure(&"refused");
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(&"refused");
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.set(500);
        assert!(!breaker.can_request());
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.set(1_000);
        assert!(breaker.can_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn success_resets_consecutive_count() {
        let (breaker, _) = breaker(3, 1_000);
        breaker.record_failure(&"x");
        breaker.record_failure(&"x");
        breaker.record_success();
        breaker.record_failure(&"x");
        breaker.record_failure(&"x");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let (breaker, clock) = breaker(2, 1_000);
        breaker.record_failure(&"x");
        breaker.record_failure(&"x");
        clock.advance(Duration::from_millis(1_000));
        assert!(breaker.can_request());

        breaker.record_failure(&"trial failed");
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(999));
        assert!(!breaker.can_request());
    }

    #[test]
    fn failures_while_open_extend_the_window() {
        let (breaker, clock) = breaker(1, 1_000);
        breaker.record_failure(&"x");
        clock.advance(Duration::from_millis(800));
        breaker.record_failure(&"x");

        clock.advance(Duration::from_millis(800));
        assert!(!breaker.can_request());
        clock.advance(Duration::from_millis(200));
        assert!(breaker.can_request());
    }

    #[test]
    fn half_open_admits_one_trial_per_interval() {
        let (breaker, clock) = breaker(1, 1_000);
        breaker.record_failure(&"x");
        clock.advance(Duration::from_millis(1_000));

        assert!(breaker.can_request());
        assert!(!breaker.can_request());

        clock.advance(Duration::from_millis(199));
        assert!(!breaker.can_request());
        clock.advance(Duration::from_millis(1));
        assert!(breaker.can_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn listeners_receive_every_transition() {
        let (breaker, clock) = breaker(1, 100);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        breaker.on_state_change(move |state, reason| {
            sink.lock().push((state, reason.to_string()));
        });

        breaker.record_failure(&"boom");
        clock.advance(Duration::from_millis(100));
        assert!(breaker.can_request());
        breaker.record_success();

        let seen = seen.lock();
        let states: Vec<_> = seen.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            states,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
        assert!(seen[0].1.contains("boom"));
    }

    #[test]
    fn listener_may_query_breaker() {
        let (breaker, _) = breaker(1, 100);
        let breaker = Arc::new(breaker);
        let calls = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&breaker);
        let counter = calls.clone();
        breaker.on_state_change(move |state, _| {
            if let Some(b) = weak.upgrade() {
                assert_eq!(b.state(), state);
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });

        breaker.record_failure(&"x");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_counts() {
        let (breaker, _) = breaker(2, 100);
        breaker.record_success();
        breaker.record_failure(&"x");
        breaker.record_failure(&"x");

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.name, "test");
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.total_successes, 1);
        assert_eq!(snapshot.total_failures, 2);
        assert_eq!(snapshot.transitions, 1);
    }

    #[test]
    fn force_open_and_close() {
        let (breaker, _) = breaker(5, 1_000);
        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_request());

        breaker.force_close();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_request());
    }
}
