//! Reconnection Backoff
//!
//! Exponential backoff with a capped attempt count and a suspension window.
//! Retry `n` (counting from zero) waits `min(base × 2ⁿ, cap)`, optionally
//! jittered. Once the attempt budget is spent the policy asks for a
//! suspension, after which counting restarts from the first attempt.

use std::time::Duration;

use rand::Rng;

/// Backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on a single delay.
    pub cap: Duration,
    /// Retries before suspending (0 = never suspend).
    pub max_attempts: u32,
    /// Pause once the attempt budget is spent.
    pub suspension_window: Duration,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
            suspension_window: Duration::from_secs(300),
            jitter_factor: 0.0,
        }
    }
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Wait `delay`, then make retry number `attempt` (1-based).
    Retry {
        /// Attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Attempt budget spent; wait `window` before starting over.
    Suspend {
        /// Suspension length.
        window: Duration,
    },
}

/// Stateful backoff policy.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use realtime_relay::infrastructure::resilience::{BackoffConfig, BackoffPolicy, BackoffStep};
///
/// let mut policy = BackoffPolicy::new(BackoffConfig {
///     base: Duration::from_millis(100),
///     cap: Duration::from_secs(1),
///     max_attempts: 2,
///     suspension_window: Duration::from_secs(60),
///     jitter_factor: 0.0,
/// });
///
/// assert_eq!(
///     policy.next_step(),
///     BackoffStep::Retry { attempt: 1, delay: Duration::from_millis(100) }
/// );
/// assert_eq!(
///     policy.next_step(),
///     BackoffStep::Retry { attempt: 2, delay: Duration::from_millis(200) }
/// );
/// assert_eq!(
///     policy.next_step(),
///     BackoffStep::Suspend { window: Duration::from_secs(60) }
/// );
/// ```
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    attempt_count: u32,
}

impl BackoffPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Retries made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Advance the policy.
    ///
    /// Returning [`BackoffStep::Suspend`] also resets the attempt count.
    pub fn next_step(&mut self) -> BackoffStep {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            self.attempt_count = 0;
            return BackoffStep::Suspend {
                window: self.config.suspension_window,
            };
        }

        let delay = self.apply_jitter(self.delay_for(self.attempt_count));
        self.attempt_count += 1;
        BackoffStep::Retry {
            attempt: self.attempt_count,
            delay,
        }
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Unjittered delay for zero-based retry `n`.
    #[must_use]
    pub fn delay_for(&self, n: u32) -> Duration {
        let base = self.config.base.as_millis();
        let cap = self.config.cap.as_millis();
        let factor = 1u128.checked_shl(n).unwrap_or(u128::MAX);
        let millis = base.saturating_mul(factor).min(cap);
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
