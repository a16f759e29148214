//! Query key definitions.
//!
//! A `QueryKey` names one cached, fetchable unit of data: a list, a single
//! entity, or an entity's sub-resource, optionally narrowed by parameters.

use std::collections::BTreeMap;
use std::fmt;

use trainboard_api_types::{JobState, MetricSource};
use url::form_urlencoded;

pub const JOBS: &str = "jobs";
pub const TRAINS: &str = "trains";
pub const STATIONS: &str = "stations";

pub const METRICS_SUB: &str = "metrics";
pub const METRIC_PARAM: &str = "metric";
pub const COUNT_PARAM: &str = "count";
pub const STATE_PARAM: &str = "state";
pub const SUMMARY_PARAM: &str = "summary";

/// Composite identifier for a cached query.
///
/// Equality, hashing and ordering are structural over all four components.
/// Parameters live in a `BTreeMap`, so insertion order never matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    resource: String,
    id: Option<String>,
    sub: Option<String>,
    params: BTreeMap<String, String>,
}

impl QueryKey {
    /// A collection of `resource`, e.g. `jobs`.
    pub fn list(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            id: None,
            sub: None,
            params: BTreeMap::new(),
        }
    }

    /// A single entity, e.g. `jobs/job-1`.
    pub fn detail(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::list(resource)
        }
    }

    /// A sub-resource of one entity, e.g. `jobs/job-1/metrics`.
    pub fn sub_resource(
        resource: impl Into<String>,
        id: impl Into<String>,
        sub: impl Into<String>,
    ) -> Self {
        Self {
            sub: Some(sub.into()),
            ..Self::detail(resource, id)
        }
    }

    /// Adds or replaces a filter parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn sub(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// True for any collection key of `resource`, with or without parameters.
    pub fn is_list_of(&self, resource: &str) -> bool {
        self.resource == resource && self.id.is_none() && self.sub.is_none()
    }

    /// True for a collection key that holds entity rows rather than a count
    /// or summary aggregate.
    pub fn is_entity_list_of(&self, resource: &str) -> bool {
        self.is_list_of(resource) && !self.is_aggregate()
    }

    /// True for count and summary keys.
    pub fn is_aggregate(&self) -> bool {
        self.params.contains_key(COUNT_PARAM) || self.params.contains_key(SUMMARY_PARAM)
    }

    /// True for the bare entity key `resource/id`, ignoring parameters.
    pub fn is_detail_of(&self, resource: &str, id: &str) -> bool {
        self.resource == resource && self.id.as_deref() == Some(id) && self.sub.is_none()
    }

    /// True for every key under `resource`.
    pub fn has_prefix(&self, resource: &str) -> bool {
        self.resource == resource
    }

    // ------------------------------------------------------------------
    // Keys used by the dashboard views
    // ------------------------------------------------------------------

    pub fn jobs() -> Self {
        Self::list(JOBS)
    }

    pub fn job(id: impl Into<String>) -> Self {
        Self::detail(JOBS, id)
    }

    pub fn job_metrics(id: impl Into<String>, source: MetricSource) -> Self {
        Self::sub_resource(JOBS, id, METRICS_SUB).with_param(METRIC_PARAM, source.as_str())
    }

    pub fn job_count(state: JobState) -> Self {
        Self::jobs()
            .with_param(COUNT_PARAM, "true")
            .with_param(STATE_PARAM, state.as_str())
    }

    pub fn job_summary() -> Self {
        Self::jobs().with_param(SUMMARY_PARAM, "true")
    }

    pub fn trains() -> Self {
        Self::list(TRAINS)
    }

    pub fn train(id: impl Into<String>) -> Self {
        Self::detail(TRAINS, id)
    }

    pub fn train_count() -> Self {
        Self::trains().with_param(COUNT_PARAM, "true")
    }

    pub fn stations() -> Self {
        Self::list(STATIONS)
    }

    pub fn station(id: impl Into<String>) -> Self {
        Self::detail(STATIONS, id)
    }

    pub fn station_count() -> Self {
        Self::stations().with_param(COUNT_PARAM, "true")
    }

    /// Metric source of a `jobs/{id}/metrics` key.
    pub fn metric_source(&self) -> Option<MetricSource> {
        if self.resource != JOBS || self.sub.as_deref() != Some(METRICS_SUB) {
            return None;
        }
        MetricSource::ALL
            .into_iter()
            .find(|source| self.param(METRIC_PARAM) == Some(source.as_str()))
    }
}

fn write_component(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    for chunk in form_urlencoded::byte_serialize(value.as_bytes()) {
        f.write_str(chunk)?;
    }
    Ok(())
}

/// Canonical form: `resource[/id[/sub]][?name=value&...]`, every component
/// form-encoded so distinct keys never render alike.
impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_component(f, &self.resource)?;
        if let Some(id) = &self.id {
            f.write_str("/")?;
            write_component(f, id)?;
        }
        if let Some(sub) = &self.sub {
            f.write_str("/")?;
            write_component(f, sub)?;
        }
        for (index, (name, value)) in self.params.iter().enumerate() {
            f.write_str(if index == 0 { "?" } else { "&" })?;
            write_component(f, name)?;
            f.write_str("=")?;
            write_component(f, value)?;
        }
        Ok(())
    }
}
