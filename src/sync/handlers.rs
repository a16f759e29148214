//! Push event handlers: decode a payload and patch the cache through the
//! reconciliation rules.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use trainboard_api_types::MetricSeries;

use super::error::PushError;
use super::keys::{JOBS, QueryKey};
use super::reconcile::{JobUpdate, apply_job_update, apply_metric_update, cached_job_state};
use super::store::{CacheStore, WriteOutcome};

pub const JOB_UPDATE: &str = "job_update";
pub const METRIC_UPDATE: &str = "metric_update";

pub const JOBS_TOPIC: &str = "jobs/sse";

pub fn job_metrics_topic(job_id: &str) -> String {
    format!("jobs/{job_id}/metrics/sse")
}

/// Applies one push event type to the cache.
pub trait PushHandler: Send + Sync {
    fn handle(&self, store: &CacheStore, payload: &str) -> Result<(), PushError>;
}

/// Patches cached job lists and the job's detail entry.
///
/// When the job's state differs from what the cache held, or the job was
/// not cached at all, job counts and the summary are invalidated as well.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobUpdateHandler;

impl PushHandler for JobUpdateHandler {
    fn handle(&self, store: &CacheStore, payload: &str) -> Result<(), PushError> {
        let value: Value =
            serde_json::from_str(payload).map_err(|err| PushError::parse(JOB_UPDATE, err))?;
        let update = Arc::new(JobUpdate::from_value(value).map_err(|err| PushError::parse(JOB_UPDATE, err))?);
        let identifier = update.identifier().to_owned();
        let detail = QueryKey::job(&identifier);

        let mut keys = store.keys_matching(|key| key.is_entity_list_of(JOBS));
        keys.push(detail);

        let new_state = update.value().get("state").cloned();
        let mut known_states = Vec::new();
        let mut patched = 0_usize;
        let at = OffsetDateTime::now_utc();

        for key in keys {
            if let Some(state) = store
                .get(&key)
                .and_then(|entry| cached_job_state(&entry, &identifier))
            {
                known_states.push(state);
            }

            let update = Arc::clone(&update);
            let outcome = store.update(&key, move |entry| apply_job_update(entry, &update, at));
            if matches!(outcome, WriteOutcome::Applied(_) | WriteOutcome::Deferred) {
                patched += 1;
            }
        }

        let state_changed = known_states.is_empty()
            || known_states
                .iter()
                .any(|state| Some(state) != new_state.as_ref());
        if state_changed {
            store.invalidate(|key| key.has_prefix(JOBS) && key.is_aggregate());
        }

        debug!(job = %identifier, patched, state_changed, "Applied job update");
        Ok(())
    }
}

/// Merges incoming samples into the job's series for the payload's source.
#[derive(Debug, Clone)]
pub struct MetricUpdateHandler {
    job_id: String,
    window: NonZeroUsize,
}

impl MetricUpdateHandler {
    pub fn new(job_id: impl Into<String>, window: NonZeroUsize) -> Self {
        Self {
            job_id: job_id.into(),
            window,
        }
    }
}

impl PushHandler for MetricUpdateHandler {
    fn handle(&self, store: &CacheStore, payload: &str) -> Result<(), PushError> {
        let series: MetricSeries =
            serde_json::from_str(payload).map_err(|err| PushError::parse(METRIC_UPDATE, err))?;
        let key = QueryKey::job_metrics(&self.job_id, series.source);
        let window = self.window;
        let at = OffsetDateTime::now_utc();
        let samples = series.metrics.len();

        let outcome = store.update(&key, move |entry| apply_metric_update(entry, &series, window, at));
        debug!(key = %key, samples, ?outcome, "Applied metric update");
        Ok(())
    }
}

/// Handlers keyed by event type, registered for one push subscription.
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: HashMap<String, Arc<dyn PushHandler>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, event_type: impl Into<String>, handler: impl PushHandler + 'static) -> Self {
        self.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    /// `job_update` handling for the jobs topic.
    pub fn jobs() -> Self {
        Self::new().on(JOB_UPDATE, JobUpdateHandler)
    }

    /// `metric_update` handling for a job's metrics topic.
    pub fn job_metrics(job_id: impl Into<String>, window: NonZeroUsize) -> Self {
        Self::new().on(METRIC_UPDATE, MetricUpdateHandler::new(job_id, window))
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn PushHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.event_types().collect();
        types.sort_unstable();
        f.debug_struct("EventHandlers").field("event_types", &types).finish()
    }
}
