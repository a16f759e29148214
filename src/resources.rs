//! Backend resources behind the well-known query keys.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use trainboard_api_types::{CountResponse, MetricSample, MetricSeries, MetricSource};

use crate::sync::reconcile::normalize_series;
use crate::sync::{
    COUNT_PARAM, FetchError, JOBS, METRIC_PARAM, METRICS_SUB, QueryFn, QueryKey, STATIONS,
    SUMMARY_PARAM, TRAINS, query_fn,
};

const LIST_DEFAULTS: [(&str, &str); 3] = [("response_type", "default"), ("offset", "0"), ("limit", "10")];
const DETAIL_DEFAULTS: [(&str, &str); 1] = [("response_type", "default")];

/// One GET request relative to the API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub segments: Vec<String>,
    pub params: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            params: Vec::new(),
        }
    }

    /// Set `name`, replacing an earlier value.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.params.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name, value)),
        }
        self
    }
}

impl fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        let mut separator = '?';
        for (name, value) in &self.params {
            write!(f, "{separator}{name}={value}")?;
            separator = '&';
        }
        Ok(())
    }
}

/// Request/response transport for query data.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform `request`. Implementations return [`FetchError::Aborted`]
    /// once `token` is cancelled.
    async fn fetch(&self, request: &FetchRequest, token: CancellationToken) -> Result<Value, FetchError>;
}

/// The request serving `key`, or `None` for keys with no backend resource.
pub fn request_for(key: &QueryKey) -> Option<FetchRequest> {
    let resource = key.resource();
    if ![JOBS, TRAINS, STATIONS].contains(&resource) {
        return None;
    }

    match (key.id(), key.sub()) {
        (None, None) if key.param(COUNT_PARAM).is_some() => {
            let extra = key.params().iter().filter(|(name, _)| name.as_str() != COUNT_PARAM);
            Some(with_params(FetchRequest::new([resource, "count"]), extra))
        }
        (None, None) if key.param(SUMMARY_PARAM).is_some() => {
            (resource == JOBS).then(|| FetchRequest::new([JOBS, "summary"]))
        }
        (None, None) => Some(with_params(
            with_defaults(FetchRequest::new([resource]), &LIST_DEFAULTS),
            key.params(),
        )),
        (Some(id), None) => Some(with_defaults(FetchRequest::new([resource, id]), &DETAIL_DEFAULTS)),
        (Some(id), Some(METRICS_SUB)) if resource == JOBS => {
            let metric = key.param(METRIC_PARAM)?;
            Some(FetchRequest::new([JOBS, id, METRICS_SUB]).param(METRIC_PARAM, metric))
        }
        _ => None,
    }
}

fn with_defaults(request: FetchRequest, defaults: &[(&str, &str)]) -> FetchRequest {
    defaults
        .iter()
        .fold(request, |request, (name, value)| request.param(*name, *value))
}

fn with_params<'a, I>(request: FetchRequest, params: I) -> FetchRequest
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    params
        .into_iter()
        .fold(request, |request, (name, value)| request.param(name.as_str(), value.as_str()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Json,
    Count,
    Series(MetricSource),
}

impl Shape {
    fn of(key: &QueryKey) -> Self {
        if let Some(source) = key.metric_source() {
            Shape::Series(source)
        } else if key.param(COUNT_PARAM).is_some() {
            Shape::Count
        } else {
            Shape::Json
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeriesBody {
    Series(MetricSeries),
    Samples(Vec<MetricSample>),
}

fn shape_response(shape: Shape, body: Value, window: NonZeroUsize) -> Result<Value, FetchError> {
    let decode = |err: serde_json::Error| FetchError::Decode(err.to_string());
    match shape {
        Shape::Json => Ok(body),
        Shape::Count => {
            let CountResponse { count } = serde_json::from_value(body).map_err(decode)?;
            Ok(Value::from(count))
        }
        Shape::Series(source) => {
            let series = match serde_json::from_value(body).map_err(decode)? {
                SeriesBody::Series(series) => series,
                SeriesBody::Samples(samples) => MetricSeries::new(source, samples),
            };
            serde_json::to_value(normalize_series(series, window)).map_err(decode)
        }
    }
}

/// Builds query functions for well-known keys on top of a [`Fetcher`].
///
/// Count endpoints resolve to the bare count; metric series are sorted by
/// timestamp and bounded to the configured window.
#[derive(Clone)]
pub struct Resources {
    fetcher: Arc<dyn Fetcher>,
    metric_window: NonZeroUsize,
}

impl Resources {
    pub fn new(fetcher: Arc<dyn Fetcher>, metric_window: NonZeroUsize) -> Self {
        Self {
            fetcher,
            metric_window,
        }
    }

    pub fn metric_window(&self) -> NonZeroUsize {
        self.metric_window
    }

    pub fn query_fn(&self, key: &QueryKey) -> Option<QueryFn> {
        let request = Arc::new(request_for(key)?);
        let shape = Shape::of(key);
        let fetcher = Arc::clone(&self.fetcher);
        let window = self.metric_window;

        Some(query_fn(move |token| {
            let fetcher = Arc::clone(&fetcher);
            let request = Arc::clone(&request);
            async move {
                let body = fetcher.fetch(&request, token).await?;
                shape_response(shape, body, window)
            }
        }))
    }
}
