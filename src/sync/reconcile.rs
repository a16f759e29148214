//! Reconciliation rules: deterministic merges of push events into cache state.
//!
//! Nothing here touches the store. Callers pass the current entry and the
//! timestamp to stamp on changed entries, and write the result back through
//! `CacheStore::update`.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use trainboard_api_types::{Job, MetricSeries};

use super::entry::{QueryEntry, QueryStatus};
use super::keys::JOBS;

/// A decoded `job_update` payload, kept alongside its JSON form.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    job: Job,
    value: Value,
}

impl JobUpdate {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let job = Job::deserialize(&value)?;
        Ok(Self { job, value })
    }

    pub fn from_job(job: Job) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(&job)?;
        Ok(Self { job, value })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn identifier(&self) -> &str {
        &self.job.identifier
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

fn identifier_of(element: &Value) -> Option<&str> {
    element.get("identifier").and_then(Value::as_str)
}

/// Replace the element of `list` whose identifier matches the update.
///
/// Returns `None` when `list` is not an array or holds no such element; jobs
/// missing from a cached list are picked up by the next full refetch.
pub fn merge_job_into_list(list: &Value, update: &JobUpdate) -> Option<Value> {
    let items = list.as_array()?;
    let position = items
        .iter()
        .position(|item| identifier_of(item) == Some(update.identifier()))?;

    let mut merged = items.clone();
    merged[position] = update.value.clone();
    Some(Value::Array(merged))
}

/// Patch a cached jobs list entry. Entries without data are left untouched.
pub fn patch_job_list(entry: QueryEntry, update: &JobUpdate, at: OffsetDateTime) -> QueryEntry {
    let merged = entry
        .data
        .as_deref()
        .and_then(|list| merge_job_into_list(list, update));
    match merged {
        Some(list) => entry.succeeded(list, at),
        None => entry,
    }
}

/// Whether a push patch may write `entry` even though it holds no data.
///
/// Keys that were never written stay absent; a key whose first fetch is in
/// flight is written so the patch outranks that fetch's result.
fn accepts_patch(entry: &QueryEntry) -> bool {
    entry.has_data() || entry.status == QueryStatus::Loading
}

/// Replace a cached job detail entry with the update.
///
/// Only applies to the detail key of the updated job, and only when that key
/// holds data or is loading.
pub fn patch_job_detail(entry: QueryEntry, update: &JobUpdate, at: OffsetDateTime) -> QueryEntry {
    if !entry.key.is_detail_of(JOBS, update.identifier()) || !accepts_patch(&entry) {
        return entry;
    }
    entry.succeeded(update.value.clone(), at)
}

/// Apply one job update to a cached jobs list or job detail entry.
///
/// Detail keys are replaced, list keys merged by identifier; every other
/// entry is returned unchanged.
pub fn apply_job_update(entry: QueryEntry, update: &JobUpdate, at: OffsetDateTime) -> QueryEntry {
    if entry.key.id().is_some() {
        patch_job_detail(entry, update, at)
    } else {
        patch_job_list(entry, update, at)
    }
}

/// The cached state of job `identifier` in `entry`, whether it is a list or a detail entry.
pub fn cached_job_state(entry: &QueryEntry, identifier: &str) -> Option<Value> {
    let data = entry.data.as_deref()?;
    let job = match data {
        Value::Array(items) => items.iter().find(|item| identifier_of(item) == Some(identifier))?,
        Value::Object(_) if identifier_of(data) == Some(identifier) => data,
        _ => return None,
    };
    job.get("state").cloned()
}

/// Sort ascending by timestamp, collapse duplicate timestamps (last wins) and
/// keep the most recent `window` samples.
pub fn normalize_series(series: MetricSeries, window: NonZeroUsize) -> MetricSeries {
    let source = series.source;
    let by_time: BTreeMap<_, _> = series
        .metrics
        .into_iter()
        .map(|sample| (sample.timestamp, sample))
        .collect();
    MetricSeries::new(source, trim(by_time, window))
}

/// Merge `incoming` samples into `current` by timestamp.
///
/// A sample whose timestamp already exists replaces it; others are inserted
/// in timestamp order. Merging the same window twice is a no-op.
pub fn merge_metric_samples(
    current: &MetricSeries,
    incoming: &MetricSeries,
    window: NonZeroUsize,
) -> MetricSeries {
    if current.source != incoming.source {
        return current.clone();
    }

    let mut by_time: BTreeMap<_, _> = current
        .metrics
        .iter()
        .map(|sample| (sample.timestamp, sample.clone()))
        .collect();
    for sample in &incoming.metrics {
        by_time.insert(sample.timestamp, sample.clone());
    }
    MetricSeries::new(current.source, trim(by_time, window))
}

fn trim<K, V>(by_time: BTreeMap<K, V>, window: NonZeroUsize) -> Vec<V> {
    let skip = by_time.len().saturating_sub(window.get());
    by_time.into_values().skip(skip).collect()
}

/// Patch a cached series entry for `(job, update.source)`.
///
/// Entries of another metric source, and entries that neither hold data nor
/// are loading, are left untouched. A loading entry without data, or cached
/// data that does not decode as a series, is replaced by the update.
pub fn apply_metric_update(
    entry: QueryEntry,
    update: &MetricSeries,
    window: NonZeroUsize,
    at: OffsetDateTime,
) -> QueryEntry {
    if entry.key.metric_source() != Some(update.source) || !accepts_patch(&entry) {
        return entry;
    }

    let current = entry
        .data
        .as_deref()
        .and_then(|data| MetricSeries::deserialize(data).ok());
    let merged = match current {
        Some(current) => merge_metric_samples(&current, update, window),
        None => normalize_series(update.clone(), window),
    };
    match serde_json::to_value(&merged) {
        Ok(value) => entry.succeeded(value, at),
        Err(_) => entry,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use time::macros::datetime;
    use trainboard_api_types::{JobState, MetricSample, MetricSource};

    use super::*;
    use crate::sync::keys::QueryKey;

    const T0: OffsetDateTime = datetime!(2024-10-24 10:00:00 UTC);

    fn job(id: &str, state: &str) -> Value {
        json!({"identifier": id, "state": state, "creator": "hamza"})
    }

    fn update(id: &str, state: JobState) -> JobUpdate {
        JobUpdate::from_job(Job::new(id, state)).expect("job update")
    }

    fn cached(key: QueryKey, data: Value) -> QueryEntry {
        QueryEntry::idle(key).succeeded(data, T0)
    }

    fn at(seconds: i64) -> OffsetDateTime {
        T0 + time::Duration::seconds(seconds)
    }

    fn window(size: usize) -> NonZeroUsize {
        NonZeroUsize::new(size).expect("non-zero window")
    }

    fn series(source: MetricSource, points: &[(i64, i64)]) -> MetricSeries {
        MetricSeries::new(
            source,
            points
                .iter()
                .map(|(t, v)| MetricSample::new(at(*t), *v))
                .collect(),
        )
    }

    #[test]
    fn job_update_replaces_matching_list_element_and_detail() {
        let list = cached(QueryKey::jobs(), json!([job("job-1", "waiting"), job("job-2", "running")]));
        let detail = cached(QueryKey::job("job-2"), job("job-2", "running"));
        let change = update("job-2", JobState::Finished);

        let list = apply_job_update(list, &change, at(1));
        let items = list.data.as_deref().and_then(Value::as_array).expect("array");
        assert_eq!(items[0], job("job-1", "waiting"));
        assert_eq!(items[1]["state"], json!("finished"));
        assert_eq!(list.last_updated, Some(at(1)));

        let detail = apply_job_update(detail, &change, at(1));
        assert_eq!(detail.data.as_deref().map(|d| &d["state"]), Some(&json!("finished")));
    }

    #[test]
    fn applying_the_same_job_update_twice_is_idempotent() {
        let list = cached(QueryKey::jobs(), json!([job("a", "idle"), job("b", "idle")]));
        let change = update("b", JobState::Running);

        let once = patch_job_list(list, &change, at(1));
        let twice = patch_job_list(once.clone(), &change, at(2));

        assert!(once.same_state(&twice));
        let items = twice.data.as_deref().and_then(Value::as_array).expect("array");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["identifier"], json!("a"));
    }

    #[test]
    fn job_absent_from_list_leaves_list_untouched() {
        let list = cached(QueryKey::jobs(), json!([job("job-1", "waiting")]));
        let next = apply_job_update(list.clone(), &update("job-9", JobState::Running), at(1));
        assert!(next.same_state(&list));
    }

    #[test]
    fn entries_without_data_are_not_created() {
        let empty_list = QueryEntry::idle(QueryKey::jobs()).loading();
        let empty_detail = QueryEntry::idle(QueryKey::job("job-1"));
        let change = update("job-1", JobState::Failed);

        assert_eq!(apply_job_update(empty_list, &change, at(1)).status, QueryStatus::Loading);
        assert!(apply_job_update(empty_detail, &change, at(1)).data.is_none());
    }

    #[test]
    fn loading_detail_without_data_takes_the_update() {
        let loading = QueryEntry::idle(QueryKey::job("job-1")).loading();
        let next = apply_job_update(loading, &update("job-1", JobState::Finished), at(1));

        assert_eq!(next.status, QueryStatus::Success);
        assert_eq!(next.data.as_deref().map(|d| &d["state"]), Some(&json!("finished")));
    }

    #[test]
    fn loading_series_without_data_takes_the_normalized_update() {
        let key = QueryKey::job_metrics("j1", MetricSource::Cpu);
        let incoming = series(MetricSource::Cpu, &[(3, 3), (1, 1), (2, 2)]);

        let idle = apply_metric_update(QueryEntry::idle(key.clone()), &incoming, window(2), at(5));
        assert!(idle.data.is_none());

        let loading = apply_metric_update(QueryEntry::idle(key).loading(), &incoming, window(2), at(5));
        let written = MetricSeries::deserialize(loading.data.as_deref().expect("data")).expect("series");
        let times: Vec<_> = written.metrics.iter().map(|s| s.timestamp).collect();
        assert_eq!(times, vec![at(2), at(3)]);
    }

    #[test]
    fn detail_of_another_job_is_untouched() {
        let other = cached(QueryKey::job("job-1"), job("job-1", "running"));
        let next = patch_job_detail(other.clone(), &update("job-2", JobState::Failed), at(1));
        assert!(next.same_state(&other));
    }

    #[test]
    fn count_entries_are_not_lists() {
        let count = cached(QueryKey::job_count(JobState::Running), json!(4));
        let next = patch_job_list(count.clone(), &update("job-1", JobState::Running), at(1));
        assert!(next.same_state(&count));
    }

    #[test]
    fn metric_sample_at_existing_timestamp_replaces_value() {
        let current = series(MetricSource::Cpu, &[(1, 10), (2, 20), (3, 30)]);
        let incoming = series(MetricSource::Cpu, &[(2, 99)]);

        let merged = merge_metric_samples(&current, &incoming, window(10));
        let values: Vec<_> = merged
            .metrics
            .iter()
            .map(|s| (s.timestamp, s.numeric_value()))
            .collect();
        assert_eq!(
            values,
            vec![(at(1), Some(10.0)), (at(2), Some(99.0)), (at(3), Some(30.0))]
        );
    }

    #[test]
    fn new_samples_are_inserted_in_order_and_window_is_bounded() {
        let current = series(MetricSource::Memory, &[(1, 1), (3, 3), (5, 5)]);
        let incoming = series(MetricSource::Memory, &[(4, 4), (2, 2), (6, 6)]);

        let merged = merge_metric_samples(&current, &incoming, window(4));
        let times: Vec<_> = merged.metrics.iter().map(|s| s.timestamp).collect();
        assert_eq!(times, vec![at(3), at(4), at(5), at(6)]);
    }

    #[test]
    fn normalize_sorts_descending_responses() {
        let descending = series(MetricSource::Network, &[(3, 3), (2, 2), (1, 1)]);
        let normalized = normalize_series(descending, window(2));
        let times: Vec<_> = normalized.metrics.iter().map(|s| s.timestamp).collect();
        assert_eq!(times, vec![at(2), at(3)]);
    }

    #[test]
    fn metric_update_targets_matching_source_only() {
        let cpu_key = QueryKey::job_metrics("j1", MetricSource::Cpu);
        let data = serde_json::to_value(series(MetricSource::Cpu, &[(1, 1)])).expect("series");
        let entry = cached(cpu_key, data);

        let network = series(MetricSource::Network, &[(2, 2)]);
        let untouched = apply_metric_update(entry.clone(), &network, window(10), at(5));
        assert!(untouched.same_state(&entry));

        let cpu = series(MetricSource::Cpu, &[(2, 2)]);
        let patched = apply_metric_update(entry, &cpu, window(10), at(5));
        let merged = MetricSeries::deserialize(patched.data.as_deref().expect("data")).expect("series");
        assert_eq!(merged.metrics.len(), 2);
        assert_eq!(patched.last_updated, Some(T0 + Duration::from_secs(5)));
    }

    #[test]
    fn cached_state_reads_lists_and_details() {
        let list = cached(QueryKey::jobs(), json!([job("a", "idle")]));
        let detail = cached(QueryKey::job("a"), job("a", "running"));
        assert_eq!(cached_job_state(&list, "a"), Some(json!("idle")));
        assert_eq!(cached_job_state(&detail, "a"), Some(json!("running")));
        assert_eq!(cached_job_state(&list, "b"), None);
    }
}
