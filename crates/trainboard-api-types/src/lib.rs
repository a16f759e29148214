//! Response types shared between the monitoring backend and its clients.
//!
//! Entity types keep any fields they do not model in a flattened `extra`
//! map, so a value decoded from one endpoint and re-encoded into a cache
//! entry carries everything the server sent.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Lifecycle state of a train execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Cancelled,
    Failed,
    Finished,
    Idle,
    Running,
    Transmission,
    Waiting,
    /// A state this client does not know about yet.
    #[serde(other)]
    Unknown,
}

impl JobState {
    /// States the backend can count by (`/jobs/count?state=`).
    pub const ALL: [JobState; 7] = [
        JobState::Cancelled,
        JobState::Failed,
        JobState::Finished,
        JobState::Idle,
        JobState::Running,
        JobState::Transmission,
        JobState::Waiting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
            JobState::Finished => "finished",
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Transmission => "transmission",
            JobState::Waiting => "waiting",
            JobState::Unknown => "unknown",
        }
    }

    /// Whether the job can still change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Cancelled | JobState::Failed | JobState::Finished
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the station a job currently runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationRef {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// A train execution as returned by `/jobs`, `/jobs/{id}` and the jobs push topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub identifier: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_station: Option<StationRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Server-formatted creation timestamp, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn new(identifier: impl Into<String>, state: JobState) -> Self {
        Self {
            identifier: identifier.into(),
            state,
            creator: None,
            current_station: None,
            train_id: None,
            description: None,
            created_at: None,
            updated_at: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Train {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Resource usage family reported for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    Cpu,
    Memory,
    Network,
}

impl MetricSource {
    pub const ALL: [MetricSource; 3] = [MetricSource::Cpu, MetricSource::Memory, MetricSource::Network];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricSource::Cpu => "cpu",
            MetricSource::Memory => "memory",
            MetricSource::Network => "network",
        }
    }
}

impl fmt::Display for MetricSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One usage report event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Reported value; the backend sends it either as a string or a number.
    pub value: Value,
}

impl MetricSample {
    pub fn new(timestamp: OffsetDateTime, value: impl Into<Value>) -> Self {
        Self {
            id: None,
            job_id: None,
            station_id: None,
            timestamp,
            value: value.into(),
        }
    }

    /// Numeric reading, parsing string values the way gauges display them.
    pub fn numeric_value(&self) -> Option<f64> {
        match &self.value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

/// A window of samples for one job and one metric source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub source: MetricSource,
    #[serde(default)]
    pub metrics: Vec<MetricSample>,
}

impl MetricSeries {
    pub fn new(source: MetricSource, metrics: Vec<MetricSample>) -> Self {
        Self { source, metrics }
    }

    /// Most recent sample by timestamp.
    pub fn latest(&self) -> Option<&MetricSample> {
        self.metrics.iter().max_by_key(|sample| sample.timestamp)
    }
}

/// Body of the `/…/count` endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

/// One row of `/jobs/summary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateCount {
    pub state: JobState,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn job_keeps_unmodelled_fields() {
        let raw = json!({
            "identifier": "job-1",
            "state": "running",
            "metadataUri": "job:job-1",
            "currentStation": {"uri": "station:s1", "name": "Aachen"},
        });

        let job: Job = serde_json::from_value(raw.clone()).expect("job");
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.extra.get("metadataUri"), Some(&json!("job:job-1")));
        assert_eq!(serde_json::to_value(&job).expect("encode"), raw);
    }

    #[test]
    fn unknown_job_state_decodes() {
        let job: Job =
            serde_json::from_value(json!({"identifier": "j", "state": "paused"})).expect("job");
        assert_eq!(job.state, JobState::Unknown);
        assert!(!job.state.is_terminal());
    }

    #[test]
    fn metric_sample_value_parses_strings_and_numbers() {
        let sample: MetricSample = serde_json::from_value(json!({
            "jobId": "j1",
            "timestamp": "2024-10-24T10:00:00Z",
            "value": "42.5",
        }))
        .expect("sample");
        assert_eq!(sample.timestamp, datetime!(2024-10-24 10:00:00 UTC));
        assert_eq!(sample.numeric_value(), Some(42.5));

        let numeric = MetricSample::new(datetime!(2024-10-24 10:00:01 UTC), 7);
        assert_eq!(numeric.numeric_value(), Some(7.0));
    }

    #[test]
    fn latest_sample_ignores_order() {
        let series = MetricSeries::new(
            MetricSource::Cpu,
            vec![
                MetricSample::new(datetime!(2024-10-24 10:00:02 UTC), 2),
                MetricSample::new(datetime!(2024-10-24 10:00:03 UTC), 3),
                MetricSample::new(datetime!(2024-10-24 10:00:01 UTC), 1),
            ],
        );
        assert_eq!(series.latest().and_then(MetricSample::numeric_value), Some(3.0));
    }
}
