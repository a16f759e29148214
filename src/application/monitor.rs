//! Headless dashboard views driven by the binary's subcommands.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use trainboard_api_types::{Job, JobState, MetricSeries, MetricSource};

use crate::resources::Resources;
use crate::sync::{
    EventHandlers, JOBS_TOPIC, LiveStatus, PushSubscription, PushSubscriptionManager, QueryCoordinator,
    QueryKey, QueryObserver, QueryState, QueryStatus, job_metrics_topic,
};

use super::error::AppError;

/// A job whose state differs from the last one seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    pub identifier: String,
    pub from: Option<JobState>,
    pub to: JobState,
}

impl JobTransition {
    /// The job just entered a state it cannot leave.
    pub fn completes(&self) -> bool {
        self.to.is_terminal() && !self.from.is_some_and(JobState::is_terminal)
    }
}

/// Remembers the last seen state of every job in a list.
#[derive(Debug, Default)]
pub struct JobStateTracker {
    states: HashMap<String, JobState>,
}

impl JobStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the jobs in `list`, returning those that are new or changed.
    /// Elements that do not decode as jobs are skipped.
    pub fn observe(&mut self, list: &Value) -> Vec<JobTransition> {
        let Some(items) = list.as_array() else {
            return Vec::new();
        };

        items
            .iter()
            .filter_map(decode::<Job>)
            .filter_map(|job| {
                let previous = self.states.insert(job.identifier.clone(), job.state);
                (previous != Some(job.state)).then(|| JobTransition {
                    identifier: job.identifier,
                    from: previous,
                    to: job.state,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

fn decode<T: DeserializeOwned>(value: &Value) -> Option<T> {
    <T as Deserialize>::deserialize(value).ok()
}

/// Counts shown on the dashboard landing page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub trains: u64,
    pub stations: u64,
    pub jobs: BTreeMap<&'static str, u64>,
    pub job_summary: Value,
}

/// Wires query observation and push subscriptions for the dashboard views.
#[derive(Clone)]
pub struct Monitor {
    coordinator: QueryCoordinator,
    push: PushSubscriptionManager,
    resources: Resources,
}

impl Monitor {
    pub fn new(coordinator: QueryCoordinator, push: PushSubscriptionManager, resources: Resources) -> Self {
        Self {
            coordinator,
            push,
            resources,
        }
    }

    pub fn coordinator(&self) -> &QueryCoordinator {
        &self.coordinator
    }

    pub fn push(&self) -> &PushSubscriptionManager {
        &self.push
    }

    pub fn observe(&self, key: QueryKey) -> Result<QueryObserver, AppError> {
        let query_fn = self
            .resources
            .query_fn(&key)
            .ok_or_else(|| AppError::unexpected(format!("no backend resource serves `{key}`")))?;
        Ok(self
            .coordinator
            .observe(key, query_fn, self.coordinator.default_options()))
    }

    pub async fn fetch(&self, key: QueryKey) -> Result<Arc<Value>, AppError> {
        let query_fn = self
            .resources
            .query_fn(&key)
            .ok_or_else(|| AppError::unexpected(format!("no backend resource serves `{key}`")))?;
        let data = self
            .coordinator
            .fetch_query(key, query_fn, self.coordinator.default_options())
            .await?;
        Ok(data)
    }

    /// Fetch train and station counts, job counts per state and the job summary.
    #[instrument(skip_all)]
    pub async fn summary(&self) -> Result<Summary, AppError> {
        let (trains, stations, job_summary) = futures::try_join!(
            self.count(QueryKey::train_count()),
            self.count(QueryKey::station_count()),
            self.fetch(QueryKey::job_summary()),
        )?;
        let per_state = try_join_all(JobState::ALL.into_iter().map(|state| async move {
            let count = self.count(QueryKey::job_count(state)).await?;
            Ok::<_, AppError>((state.as_str(), count))
        }))
        .await?;

        Ok(Summary {
            trains,
            stations,
            jobs: per_state.into_iter().collect(),
            job_summary: Value::clone(&job_summary),
        })
    }

    async fn count(&self, key: QueryKey) -> Result<u64, AppError> {
        let value = self.fetch(key.clone()).await?;
        value
            .as_u64()
            .ok_or_else(|| AppError::unexpected(format!("`{key}` did not resolve to a count")))
    }

    /// Follow the jobs list until `shutdown`, logging every job state change.
    #[instrument(skip_all)]
    pub async fn watch_jobs(&self, shutdown: CancellationToken) -> Result<(), AppError> {
        let mut jobs = self.observe(QueryKey::jobs())?;
        let subscription = self.push.subscribe(JOBS_TOPIC, EventHandlers::jobs());
        let mut live = subscription.live_changes();
        let mut tracker = JobStateTracker::new();

        report_jobs(&jobs.state(), &mut tracker);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                state = jobs.changed() => report_jobs(&state, &mut tracker),
                changed = live.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    report_live(&subscription, *live.borrow_and_update());
                }
            }
        }

        debug!(jobs = tracker.len(), "Stopped watching jobs");
        Ok(())
    }

    /// Follow one job's detail and its resource usage series until `shutdown`.
    #[instrument(skip(self, shutdown))]
    pub async fn watch_job(&self, id: &str, shutdown: CancellationToken) -> Result<(), AppError> {
        let mut detail = self.observe(QueryKey::job(id))?;
        let mut cpu = self.observe(QueryKey::job_metrics(id, MetricSource::Cpu))?;
        let mut memory = self.observe(QueryKey::job_metrics(id, MetricSource::Memory))?;
        let mut network = self.observe(QueryKey::job_metrics(id, MetricSource::Network))?;

        let _jobs = self.push.subscribe(JOBS_TOPIC, EventHandlers::jobs());
        let metrics_topic = job_metrics_topic(id);
        let metrics = self.push.subscribe(
            &metrics_topic,
            EventHandlers::job_metrics(id, self.resources.metric_window()),
        );
        let mut live = metrics.live_changes();

        report_detail(&detail.state());
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                state = detail.changed() => report_detail(&state),
                state = cpu.changed() => report_series(MetricSource::Cpu, &state),
                state = memory.changed() => report_series(MetricSource::Memory, &state),
                state = network.changed() => report_series(MetricSource::Network, &state),
                changed = live.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    report_live(&metrics, *live.borrow_and_update());
                }
            }
        }
        Ok(())
    }
}

fn report_jobs(state: &QueryState, tracker: &mut JobStateTracker) {
    if let Some(error) = &state.error {
        warn!(kind = ?error.kind(), error = %error, stale = state.data.is_some(), "Jobs list fetch failed");
    }
    let Some(list) = state.data.as_deref() else {
        return;
    };
    for transition in tracker.observe(list) {
        match transition.from {
            Some(from) if transition.completes() && transition.to == JobState::Failed => {
                warn!(job = %transition.identifier, %from, "Job failed");
            }
            Some(from) if transition.completes() => {
                info!(job = %transition.identifier, %from, to = %transition.to, "Job completed");
            }
            Some(from) => info!(job = %transition.identifier, %from, to = %transition.to, "Job state changed"),
            None => info!(job = %transition.identifier, state = %transition.to, "Job listed"),
        }
    }
}

fn report_detail(state: &QueryState) {
    if state.status == QueryStatus::Error {
        if let Some(error) = &state.error {
            warn!(kind = ?error.kind(), error = %error, "Job detail fetch failed");
        }
        return;
    }
    let Some(job) = state.data.as_deref().and_then(decode::<Job>) else {
        return;
    };
    info!(
        job = %job.identifier,
        state = %job.state,
        station = job.current_station.as_ref().and_then(|station| station.name.as_deref()),
        version = state.version,
        "Job detail"
    );
}

fn report_series(source: MetricSource, state: &QueryState) {
    let Some(series) = state
        .data
        .as_deref()
        .and_then(decode::<MetricSeries>)
    else {
        return;
    };
    let latest = series.latest().and_then(|sample| sample.numeric_value());
    info!(%source, samples = series.metrics.len(), ?latest, "Metric series updated");
}

fn report_live(subscription: &PushSubscription, status: LiveStatus) {
    match status {
        LiveStatus::Live => info!(topic = subscription.topic(), "Live updates flowing"),
        LiveStatus::Degraded => warn!(
            topic = subscription.topic(),
            state = %subscription.state(),
            "Live updates unavailable; showing cached data"
        ),
    }
}
