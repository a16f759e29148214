//! Process-wide query cache.
//!
//! Pure state plus notification: no network or timer logic lives here. Every
//! mutation goes through a read-modify-write updater so fetch completions and
//! push patches for the same key can never lose each other's writes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use metrics::counter;
use tracing::{debug, trace};

use super::entry::{QueryEntry, Version};
use super::keys::QueryKey;
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "sync::store";

const METRIC_WRITES: &str = "trainboard_cache_writes_total";
const METRIC_STALE_DISCARDED: &str = "trainboard_cache_stale_writes_discarded_total";

type Updater = Box<dyn FnOnce(QueryEntry) -> QueryEntry + Send>;
type Listener = Arc<dyn Fn(&QueryEntry) + Send + Sync>;
type ListenerId = u64;

/// Result of a store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Committed under the given version; listeners were notified.
    Applied(Version),
    /// The updater produced the same observable state; nothing changed.
    Unchanged,
    /// The write carried a version older than the entry's current one.
    StaleDiscarded { current: Version, attempted: Version },
    /// Issued while the key's listeners were running; queued and applied
    /// right after the current notification round.
    Deferred,
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied(_))
    }
}

struct PendingWrite {
    version: Option<Version>,
    updater: Updater,
}

#[derive(Default)]
struct Dispatch {
    notifying: HashSet<QueryKey>,
    deferred: HashMap<QueryKey, VecDeque<PendingWrite>>,
}

struct StoreInner {
    entries: RwLock<HashMap<QueryKey, Arc<QueryEntry>>>,
    listeners: RwLock<HashMap<QueryKey, Vec<(ListenerId, Listener)>>>,
    dispatch: Mutex<Dispatch>,
    version_counter: AtomicU64,
    listener_counter: AtomicU64,
}

enum Commit {
    Applied(Arc<QueryEntry>),
    Unchanged,
    Stale { current: Version, attempted: Version },
}

/// Shared handle to the query cache.
///
/// Cloning is cheap; all clones address the same entries. Create one per
/// session and `clear` it on teardown.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                dispatch: Mutex::new(Dispatch::default()),
                version_counter: AtomicU64::new(1),
                listener_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Allocate a version greater than every version handed out so far.
    pub fn next_version(&self) -> Version {
        self.inner.version_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self, key: &QueryKey) -> Option<Arc<QueryEntry>> {
        rw_read(&self.inner.entries, SOURCE, "get").get(key).cloned()
    }

    /// Atomic read-modify-write stamped with a fresh version.
    ///
    /// The updater receives the current entry, or an idle one if the key has
    /// never been written.
    pub fn update<F>(&self, key: &QueryKey, updater: F) -> WriteOutcome
    where
        F: FnOnce(QueryEntry) -> QueryEntry + Send + 'static,
    {
        self.write(key, None, Box::new(updater))
    }

    /// Atomic read-modify-write carrying a version allocated earlier.
    ///
    /// Discarded when the entry's current version is higher, which is how a
    /// fetch that started before a push loses to that push.
    pub fn write_versioned<F>(&self, key: &QueryKey, version: Version, updater: F) -> WriteOutcome
    where
        F: FnOnce(QueryEntry) -> QueryEntry + Send + 'static,
    {
        self.write(key, Some(version), Box::new(updater))
    }

    /// Register a listener invoked synchronously after each applied write to `key`.
    ///
    /// Writes to the same key issued from inside the listener are deferred
    /// until the listener returns.
    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> ListenerHandle
    where
        F: Fn(&QueryEntry) + Send + Sync + 'static,
    {
        let id = self.inner.listener_counter.fetch_add(1, Ordering::Relaxed);
        rw_write(&self.inner.listeners, SOURCE, "subscribe")
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));

        ListenerHandle {
            store: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
        }
    }

    pub fn listener_count(&self, key: &QueryKey) -> usize {
        rw_read(&self.inner.listeners, SOURCE, "listener_count")
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Mark every matching entry stale while keeping its data.
    ///
    /// Returns the keys whose entries changed.
    pub fn invalidate<P>(&self, predicate: P) -> Vec<QueryKey>
    where
        P: Fn(&QueryKey) -> bool,
    {
        let keys = self.keys_matching(predicate);
        let invalidated: Vec<QueryKey> = keys
            .into_iter()
            .filter(|key| {
                matches!(
                    self.update(key, QueryEntry::invalidated),
                    WriteOutcome::Applied(_) | WriteOutcome::Deferred
                )
            })
            .collect();

        if !invalidated.is_empty() {
            debug!(count = invalidated.len(), "Cache entries invalidated");
        }
        invalidated
    }

    pub fn keys_matching<P>(&self, predicate: P) -> Vec<QueryKey>
    where
        P: Fn(&QueryKey) -> bool,
    {
        rw_read(&self.inner.entries, SOURCE, "keys_matching")
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and pending deferred write. Listeners stay registered.
    pub fn clear(&self) {
        let mut dispatch = mutex_lock(&self.inner.dispatch, SOURCE, "clear.dispatch");
        dispatch.deferred.clear();
        rw_write(&self.inner.entries, SOURCE, "clear.entries").clear();
        debug!("Cache cleared");
    }

    fn write(&self, key: &QueryKey, version: Option<Version>, updater: Updater) -> WriteOutcome {
        let mut dispatch = mutex_lock(&self.inner.dispatch, SOURCE, "write.dispatch");
        if dispatch.notifying.contains(key) {
            dispatch
                .deferred
                .entry(key.clone())
                .or_default()
                .push_back(PendingWrite { version, updater });
            trace!(key = %key, "Write deferred until listeners return");
            return WriteOutcome::Deferred;
        }

        let entry = match self.commit(key, version, updater) {
            Commit::Applied(entry) => entry,
            Commit::Unchanged => return WriteOutcome::Unchanged,
            Commit::Stale { current, attempted } => {
                return WriteOutcome::StaleDiscarded { current, attempted };
            }
        };
        let applied = entry.version;

        dispatch.notifying.insert(key.clone());
        drop(dispatch);

        self.notify_in_order(key, entry);
        WriteOutcome::Applied(applied)
    }

    /// Notify listeners for `entry`, then drain writes deferred meanwhile.
    ///
    /// The key stays in `notifying` until its deferred queue is empty, so
    /// notifications for one key are delivered in commit order.
    fn notify_in_order(&self, key: &QueryKey, entry: Arc<QueryEntry>) {
        let mut next = Some(entry);
        while let Some(entry) = next.take() {
            self.notify(key, &entry);

            let mut dispatch = mutex_lock(&self.inner.dispatch, SOURCE, "notify.dispatch");
            loop {
                let pending = dispatch
                    .deferred
                    .get_mut(key)
                    .and_then(VecDeque::pop_front);
                let Some(pending) = pending else {
                    dispatch.deferred.remove(key);
                    dispatch.notifying.remove(key);
                    break;
                };
                if let Commit::Applied(entry) = self.commit(key, pending.version, pending.updater) {
                    next = Some(entry);
                    break;
                }
            }
        }
    }

    fn notify(&self, key: &QueryKey, entry: &QueryEntry) {
        let listeners: Vec<Listener> = rw_read(&self.inner.listeners, SOURCE, "notify")
            .get(key)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(entry);
        }
    }

    fn commit(&self, key: &QueryKey, version: Option<Version>, updater: Updater) -> Commit {
        let mut entries = rw_write(&self.inner.entries, SOURCE, "commit");
        let current = entries
            .get(key)
            .map(|entry| QueryEntry::clone(entry))
            .unwrap_or_else(|| QueryEntry::idle(key.clone()));

        if let Some(attempted) = version
            && attempted < current.version
        {
            counter!(METRIC_STALE_DISCARDED).increment(1);
            debug!(
                key = %key,
                current = current.version,
                attempted,
                "Stale write discarded"
            );
            return Commit::Stale {
                current: current.version,
                attempted,
            };
        }

        let mut next = updater(current.clone());
        if next.same_state(&current) {
            return Commit::Unchanged;
        }

        next.key = key.clone();
        next.version = version.unwrap_or_else(|| self.next_version());
        let next = Arc::new(next);
        entries.insert(key.clone(), Arc::clone(&next));

        counter!(METRIC_WRITES, "status" => next.status.as_str()).increment(1);
        trace!(key = %key, version = next.version, status = %next.status, "Cache entry written");
        Commit::Applied(next)
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a store listener registered; dropping it unsubscribes.
pub struct ListenerHandle {
    store: Weak<StoreInner>,
    key: QueryKey,
    id: ListenerId,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let mut listeners = rw_write(&store.listeners, SOURCE, "unsubscribe");
        if let Some(registered) = listeners.get_mut(&self.key) {
            registered.retain(|(id, _)| *id != self.id);
            if registered.is_empty() {
                listeners.remove(&self.key);
            }
        }
    }
}
