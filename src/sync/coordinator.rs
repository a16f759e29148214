//! Query coordinator: fetch lifecycle on top of the cache store.
//!
//! For each observed key there is at most one in-flight fetch. Concurrent
//! observers join it; when the last observer leaves, the fetch is cancelled
//! and whatever it returns is never written.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::config::QueryConfig;
use super::entry::{QueryEntry, QueryStatus, Version};
use super::error::FetchError;
use super::keys::QueryKey;
use super::lock::mutex_lock;
use super::retry::RetryPolicy;
use super::store::{CacheStore, ListenerHandle, WriteOutcome};

const SOURCE: &str = "sync::coordinator";

const METRIC_FETCHES: &str = "trainboard_query_fetches_total";
const METRIC_RETRIES: &str = "trainboard_query_retries_total";

/// Cancelable fetch for one key. Receives a token that is cancelled when the
/// result is no longer wanted.
pub type QueryFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

/// Wrap an async closure as a [`QueryFn`].
pub fn query_fn<F, Fut>(fetch: F) -> QueryFn
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    Arc::new(move |token| fetch(token).boxed())
}

type FetchOutcome = Result<Arc<Value>, FetchError>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Per-observation fetch options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// `None` serves cached data indefinitely once fetched.
    pub stale_time: Option<Duration>,
    pub retry: RetryPolicy,
    /// Disabled observers read the cache but never trigger fetches.
    pub enabled: bool,
}

impl QueryOptions {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            stale_time: config.stale_time,
            retry: config.retry,
            enabled: true,
        }
    }

    pub fn with_stale_time(mut self, stale_time: Option<Duration>) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default())
    }
}

/// What an observer of a key sees.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub data: Option<Arc<Value>>,
    pub status: QueryStatus,
    pub error: Option<FetchError>,
    pub last_updated: Option<OffsetDateTime>,
    pub version: Version,
    pub is_fetching: bool,
}

impl QueryState {
    fn new(entry: Option<&QueryEntry>, is_fetching: bool) -> Self {
        match entry {
            Some(entry) => Self {
                data: entry.data.clone(),
                status: entry.status,
                error: entry.error.clone(),
                last_updated: entry.last_updated,
                version: entry.version,
                is_fetching,
            },
            None => Self {
                data: None,
                status: QueryStatus::Idle,
                error: None,
                last_updated: None,
                version: 0,
                is_fetching,
            },
        }
    }
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
    /// Held by the fetch while it writes; taken after cancelling by whoever
    /// abandons the fetch, so no write lands after that point.
    write_gate: Arc<Mutex<()>>,
    future: SharedFetch,
}

struct KeyState {
    observers: usize,
    query_fn: QueryFn,
    options: QueryOptions,
    in_flight: Option<InFlight>,
    changes: watch::Sender<Version>,
    listener: Option<ListenerHandle>,
}

struct CoordinatorInner {
    store: CacheStore,
    config: QueryConfig,
    keys: Mutex<HashMap<QueryKey, KeyState>>,
    generations: AtomicU64,
}

/// Runs fetches for observed keys and writes their results to the store.
///
/// Must be used from within a Tokio runtime: fetches run as spawned tasks.
#[derive(Clone)]
pub struct QueryCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl QueryCoordinator {
    pub fn new(store: CacheStore, config: QueryConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                config,
                keys: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Options built from the coordinator's configuration.
    pub fn default_options(&self) -> QueryOptions {
        QueryOptions::from_config(&self.inner.config)
    }

    /// Start observing `key`.
    ///
    /// Cached data is visible through the returned observer immediately. A
    /// fetch is started (or joined) when the entry is absent or stale.
    /// The latest observer's `query_fn` and options are used for refetches
    /// triggered by invalidation.
    #[instrument(skip_all, fields(key = %key))]
    pub fn observe(&self, key: QueryKey, query_fn: QueryFn, options: QueryOptions) -> QueryObserver {
        let changes = {
            let mut keys = mutex_lock(&self.inner.keys, SOURCE, "observe");
            let state = keys.entry(key.clone()).or_insert_with(|| KeyState {
                observers: 0,
                query_fn: Arc::clone(&query_fn),
                options: options.clone(),
                in_flight: None,
                changes: watch::Sender::new(0),
                listener: None,
            });
            state.observers += 1;
            state.query_fn = query_fn;
            state.options = options;
            if state.listener.is_none() {
                state.listener = Some(self.inner.listen(&key));
            }
            let changes = state.changes.subscribe();
            if state.options.enabled {
                self.inner.ensure_fetch(&key, state, false);
            }
            debug!(observers = state.observers, "Query observed");
            changes
        };

        QueryObserver {
            inner: Arc::clone(&self.inner),
            key,
            changes,
        }
    }

    /// Ensure fresh data for `key` and wait for it.
    ///
    /// Serves fresh cached data without calling `query_fn`. The fetch error
    /// is returned even when a newer write kept it out of the cache.
    pub async fn fetch_query(
        &self,
        key: QueryKey,
        query_fn: QueryFn,
        options: QueryOptions,
    ) -> Result<Arc<Value>, FetchError> {
        let observer = self.observe(key, query_fn, options.with_enabled(true));
        let (state, outcome) = observer.settle().await;
        match outcome {
            Some(outcome) => outcome,
            None => state
                .data
                .ok_or_else(|| state.error.unwrap_or(FetchError::Aborted)),
        }
    }

    /// Invalidate matching entries.
    ///
    /// Observed keys among them cancel their in-flight fetch and refetch;
    /// unobserved ones stay stale until next observed.
    pub fn invalidate<P>(&self, predicate: P) -> Vec<QueryKey>
    where
        P: Fn(&QueryKey) -> bool,
    {
        self.inner.store.invalidate(predicate)
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        mutex_lock(&self.inner.keys, SOURCE, "observer_count")
            .get(key)
            .map_or(0, |state| state.observers)
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.inner.in_flight(key).is_some()
    }
}

impl CoordinatorInner {
    fn listen(self: &Arc<Self>, key: &QueryKey) -> ListenerHandle {
        let coordinator = Arc::downgrade(self);
        let observed = key.clone();
        self.store.subscribe(key, move |entry| {
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.on_entry_changed(&observed, entry);
            }
        })
    }

    fn on_entry_changed(self: &Arc<Self>, key: &QueryKey, entry: &QueryEntry) {
        let mut keys = mutex_lock(&self.keys, SOURCE, "on_entry_changed");
        let Some(state) = keys.get_mut(key) else {
            return;
        };
        state.changes.send_replace(entry.version);

        if entry.status != QueryStatus::Idle || state.observers == 0 || !state.options.enabled {
            return;
        }
        if let Some(superseded) = state.in_flight.take() {
            superseded.token.cancel();
            debug!(key = %key, generation = superseded.generation, "In-flight fetch superseded by invalidation");
        }
        self.ensure_fetch(key, state, true);
    }

    /// Join the in-flight fetch for `key`, or start one if needed.
    ///
    /// Called with the key map locked; never writes to the store itself.
    fn ensure_fetch(self: &Arc<Self>, key: &QueryKey, state: &mut KeyState, force: bool) -> Option<SharedFetch> {
        if let Some(in_flight) = &state.in_flight {
            return Some(in_flight.future.clone());
        }
        if !force && !self.needs_fetch(key, state.options.stale_time) {
            return None;
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let write_gate = Arc::new(Mutex::new(()));
        let task = tokio::spawn(Arc::clone(self).run_fetch(
            key.clone(),
            generation,
            Arc::clone(&state.query_fn),
            state.options.retry,
            token.clone(),
            Arc::clone(&write_gate),
        ));

        let coordinator = Arc::downgrade(self);
        let task_key = key.clone();
        let future = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(key = %task_key, error = %err, "Fetch task did not complete");
                    if let Some(coordinator) = coordinator.upgrade() {
                        coordinator.finish(&task_key, generation);
                    }
                    Err(FetchError::Aborted)
                }
            }
        }
        .boxed()
        .shared();

        debug!(key = %key, generation, "Fetch started");
        state.in_flight = Some(InFlight {
            generation,
            token,
            write_gate,
            future: future.clone(),
        });
        Some(future)
    }

    fn needs_fetch(&self, key: &QueryKey, stale_time: Option<Duration>) -> bool {
        match self.store.get(key) {
            None => true,
            // Loading with no fetch in flight means the fetch that set it was cancelled.
            Some(entry) => {
                entry.status == QueryStatus::Loading
                    || entry.is_stale(OffsetDateTime::now_utc(), stale_time)
            }
        }
    }

    async fn run_fetch(
        self: Arc<Self>,
        key: QueryKey,
        generation: u64,
        query_fn: QueryFn,
        retry: RetryPolicy,
        token: CancellationToken,
        write_gate: Arc<Mutex<()>>,
    ) -> FetchOutcome {
        let version = {
            let _gate = mutex_lock(&write_gate, SOURCE, "run_fetch.start");
            if token.is_cancelled() {
                return Err(FetchError::Aborted);
            }
            self.store.update(&key, QueryEntry::loading);
            self.store.next_version()
        };
        let outcome = fetch_with_retry(&key, &query_fn, retry, &token)
            .await
            .map(Arc::new);

        let written = {
            let _gate = mutex_lock(&write_gate, SOURCE, "run_fetch.write");
            if token.is_cancelled() || !self.is_current(&key, generation) {
                counter!(METRIC_FETCHES, "outcome" => "superseded").increment(1);
                debug!(key = %key, generation, "Fetch result discarded");
                return outcome;
            }

            match &outcome {
                Ok(data) => {
                    let data = Arc::clone(data);
                    let at = OffsetDateTime::now_utc();
                    counter!(METRIC_FETCHES, "outcome" => "success").increment(1);
                    self.store
                        .write_versioned(&key, version, move |entry| entry.succeeded(data, at))
                }
                Err(err) => {
                    counter!(METRIC_FETCHES, "outcome" => "error").increment(1);
                    warn!(key = %key, kind = ?err.kind(), error = %err, "Fetch failed");
                    let err = err.clone();
                    self.store
                        .write_versioned(&key, version, move |entry| entry.failed(err))
                }
            }
        };
        if let WriteOutcome::StaleDiscarded { current, attempted } = written {
            debug!(key = %key, current, attempted, "Fetch result older than cached state");
        }

        self.finish(&key, generation);
        outcome
    }

    fn is_current(&self, key: &QueryKey, generation: u64) -> bool {
        mutex_lock(&self.keys, SOURCE, "is_current")
            .get(key)
            .and_then(|state| state.in_flight.as_ref())
            .is_some_and(|in_flight| in_flight.generation == generation)
    }

    fn finish(&self, key: &QueryKey, generation: u64) {
        let mut keys = mutex_lock(&self.keys, SOURCE, "finish");
        if let Some(state) = keys.get_mut(key)
            && state
                .in_flight
                .as_ref()
                .is_some_and(|in_flight| in_flight.generation == generation)
        {
            state.in_flight = None;
        }
    }

    fn in_flight(&self, key: &QueryKey) -> Option<(u64, SharedFetch)> {
        mutex_lock(&self.keys, SOURCE, "in_flight")
            .get(key)
            .and_then(|state| state.in_flight.as_ref())
            .map(|in_flight| (in_flight.generation, in_flight.future.clone()))
    }

    fn release(&self, key: &QueryKey) {
        let removed = {
            let mut keys = mutex_lock(&self.keys, SOURCE, "release");
            let Some(state) = keys.get_mut(key) else {
                return;
            };
            state.observers = state.observers.saturating_sub(1);
            if state.observers > 0 {
                return;
            }
            keys.remove(key)
        };

        if let Some(state) = removed
            && let Some(in_flight) = state.in_flight
        {
            in_flight.token.cancel();
            // Waits out a write already under way.
            drop(mutex_lock(&in_flight.write_gate, SOURCE, "release.gate"));
            debug!(key = %key, generation = in_flight.generation, "Last observer left; fetch cancelled");
        }
    }
}

async fn fetch_with_retry(
    key: &QueryKey,
    query_fn: &QueryFn,
    retry: RetryPolicy,
    token: &CancellationToken,
) -> Result<Value, FetchError> {
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Aborted),
            result = query_fn(token.clone()) => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if retry.should_retry(&err, attempt) => {
                let delay = retry.delay_for(attempt);
                counter!(METRIC_RETRIES).increment(1);
                debug!(key = %key, attempt, ?delay, error = %err, "Retrying fetch");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(FetchError::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A live observation of one key; dropping it stops observing.
pub struct QueryObserver {
    inner: Arc<CoordinatorInner>,
    key: QueryKey,
    changes: watch::Receiver<Version>,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn state(&self) -> QueryState {
        let is_fetching = self.inner.in_flight(&self.key).is_some();
        let entry = self.inner.store.get(&self.key);
        QueryState::new(entry.as_deref(), is_fetching)
    }

    /// Wait for the next change to the entry, then return the new state.
    pub async fn changed(&mut self) -> QueryState {
        if self.changes.changed().await.is_err() {
            debug!(key = %self.key, "Change feed closed");
        }
        self.state()
    }

    /// Wait until no fetch is in flight for the key.
    pub async fn settled(&self) -> QueryState {
        self.settle().await.0
    }

    /// Fetch now, joining a fetch that is already in flight.
    pub async fn refetch(&self) -> Result<Arc<Value>, FetchError> {
        let future = {
            let mut keys = mutex_lock(&self.inner.keys, SOURCE, "refetch");
            keys.get_mut(&self.key)
                .and_then(|state| self.inner.ensure_fetch(&self.key, state, true))
        };
        match future {
            Some(future) => future.await,
            None => Err(FetchError::Aborted),
        }
    }

    async fn settle(&self) -> (QueryState, Option<FetchOutcome>) {
        let mut last: Option<(u64, FetchOutcome)> = None;
        while let Some((generation, future)) = self.inner.in_flight(&self.key) {
            if last.as_ref().is_some_and(|(seen, _)| *seen == generation) {
                break;
            }
            last = Some((generation, future.await));
        }
        (self.state(), last.map(|(_, outcome)| outcome))
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.inner.release(&self.key);
    }
}
