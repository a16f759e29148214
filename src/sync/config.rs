//! Tuning for the query coordinator and the push subscription manager.

use std::num::NonZeroUsize;
use std::time::Duration;

use super::retry::RetryPolicy;

const DEFAULT_STALE_TIME_SECS: u64 = 30;
const DEFAULT_METRIC_WINDOW: usize = 120;
const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_DEGRADED_AFTER_FAILURES: u32 = 3;

/// Query coordinator defaults; individual observers may override them.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Age after which cached data is refetched in the background.
    /// `None` disables age-based staleness.
    pub stale_time: Option<Duration>,
    pub retry: RetryPolicy,
    /// Most recent samples kept per metric series.
    pub metric_window: NonZeroUsize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Some(Duration::from_secs(DEFAULT_STALE_TIME_SECS)),
            retry: RetryPolicy::default(),
            metric_window: NonZeroUsize::new(DEFAULT_METRIC_WINDOW).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl From<&crate::config::QuerySettings> for QueryConfig {
    fn from(settings: &crate::config::QuerySettings) -> Self {
        Self {
            stale_time: settings.stale_time,
            retry: RetryPolicy::new(
                settings.retry_max_attempts.get(),
                settings.retry_base_delay,
                settings.retry_max_delay,
            ),
            metric_window: settings.metric_window,
        }
    }
}

/// Push reconnection tuning.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Consecutive failed connection attempts after which a topic reports
    /// live updates as unavailable. Reconnection continues regardless.
    pub degraded_after_failures: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            reconnect_max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            degraded_after_failures: DEFAULT_DEGRADED_AFTER_FAILURES,
        }
    }
}

impl From<&crate::config::PushSettings> for PushConfig {
    fn from(settings: &crate::config::PushSettings) -> Self {
        Self {
            reconnect_base_delay: settings.reconnect_base_delay,
            reconnect_max_delay: settings.reconnect_max_delay,
            degraded_after_failures: settings.degraded_after_failures.get(),
        }
    }
}
