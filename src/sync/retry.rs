//! Bounded exponential backoff for fetch retries and push reconnection.

use std::time::Duration;

use rand::Rng;

use super::error::FetchError;

/// Retry schedule for a fetch.
///
/// `max_attempts` counts the first try, so `1` disables retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential(self.base_delay, self.max_delay, attempt)
    }

    /// Whether a failure on attempt `attempt` (1-based) should be retried.
    pub fn should_retry(&self, error: &FetchError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(10))
    }
}

fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1_u32 << exponent).min(max)
}

/// Reconnection backoff with jitter.
///
/// Each delay is drawn uniformly from `[d/2, d]` where `d` is the capped
/// exponential delay for the current failure count, then raised to the
/// floor if one is set.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    floor: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            floor: Duration::ZERO,
            failures: 0,
        }
    }

    /// Never wait less than `floor`, capped at the maximum delay.
    pub fn set_floor(&mut self, floor: Duration) {
        self.floor = floor.min(self.max);
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let ceiling = exponential(self.base, self.max, self.failures);
        let half = ceiling / 2;
        let jittered = if ceiling <= half {
            ceiling
        } else {
            let millis = rand::rng().random_range(half.as_millis()..=ceiling.as_millis());
            Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
        };
        jittered.max(self.floor)
    }

    /// Consecutive failures since the last `reset`.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
