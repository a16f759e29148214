//! Cache entry state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;

use super::error::FetchError;
use super::keys::QueryKey;

/// Monotonic write version.
///
/// Allocated from a single store-wide counter, so versions also increase
/// per key.
pub type Version = u64;

/// Fetch lifecycle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// Never fetched, or invalidated and waiting for a refetch.
    Idle,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryStatus::Idle => "idle",
            QueryStatus::Loading => "loading",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached state for one query key.
#[derive(Debug, Clone)]
pub struct QueryEntry {
    pub key: QueryKey,
    pub data: Option<Arc<Value>>,
    pub status: QueryStatus,
    pub error: Option<FetchError>,
    pub last_updated: Option<OffsetDateTime>,
    pub version: Version,
}

impl QueryEntry {
    /// The state of a key that has never been written.
    pub fn idle(key: QueryKey) -> Self {
        Self {
            key,
            data: None,
            status: QueryStatus::Idle,
            error: None,
            last_updated: None,
            version: 0,
        }
    }

    /// Fetch started; data from earlier fetches stays visible.
    pub fn loading(self) -> Self {
        Self {
            status: QueryStatus::Loading,
            ..self
        }
    }

    /// Fresh data from a fetch or a push patch.
    pub fn succeeded(self, data: impl Into<Arc<Value>>, at: OffsetDateTime) -> Self {
        Self {
            data: Some(data.into()),
            status: QueryStatus::Success,
            error: None,
            last_updated: Some(at),
            ..self
        }
    }

    /// Failed fetch; previous data is retained.
    pub fn failed(self, error: FetchError) -> Self {
        Self {
            status: QueryStatus::Error,
            error: Some(error),
            ..self
        }
    }

    /// Marked stale by invalidation; data is retained for display.
    pub fn invalidated(self) -> Self {
        Self {
            status: QueryStatus::Idle,
            ..self
        }
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Whether this entry should trigger a fetch for an observer.
    ///
    /// `stale_time == None` disables age-based staleness; missing data, idle
    /// and error entries are always stale.
    pub fn is_stale(&self, now: OffsetDateTime, stale_time: Option<Duration>) -> bool {
        if self.data.is_none() {
            return true;
        }
        match self.status {
            QueryStatus::Idle | QueryStatus::Error => return true,
            QueryStatus::Loading | QueryStatus::Success => {}
        }
        let (Some(stale_time), Some(last_updated)) = (stale_time, self.last_updated) else {
            return false;
        };
        now - last_updated >= stale_time
    }

    /// Compares data, status and error, ignoring version and timestamps.
    pub fn same_state(&self, other: &QueryEntry) -> bool {
        self.status == other.status && self.error == other.error && self.data == other.data
    }
}
