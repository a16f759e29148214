//! Push subscription manager: one shared connection per topic.
//!
//! Every distinct topic gets a single connection task, reference counted by
//! its live [`PushSubscription`]s. The task reconnects with jittered backoff
//! until the last subscription is dropped; inbound messages are routed by
//! event type to the handlers of every subscription on the topic.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::config::PushConfig;
use super::error::ChannelError;
use super::handlers::{EventHandlers, PushHandler};
use super::lock::{mutex_lock, rw_read, rw_write};
use super::retry::Backoff;
use super::store::CacheStore;

const SOURCE: &str = "sync::push";

const METRIC_EVENTS: &str = "trainboard_push_events_total";
const METRIC_PARSE_ERRORS: &str = "trainboard_push_parse_errors_total";
const METRIC_RECONNECTS: &str = "trainboard_push_reconnects_total";
const METRIC_CONNECTIONS: &str = "trainboard_push_connections";

/// One named event received on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub event_type: String,
    pub data: String,
    pub id: Option<String>,
}

impl PushMessage {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            id: None,
        }
    }
}

/// Messages of one open connection. The stream ends, or yields an error,
/// when the connection drops.
pub type EventStream = BoxStream<'static, Result<PushMessage, ChannelError>>;

/// Opens long-lived one-directional event streams.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self, topic: &str) -> Result<EventStream, ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    /// Waiting to reconnect after `attempt` consecutive failures.
    Reconnecting { attempt: u32 },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => f.write_str("closed"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Open => f.write_str("open"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

/// Whether live updates are currently flowing for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStatus {
    Live,
    /// Too many consecutive connection failures; cached data may lag.
    Degraded,
}

type Subscribers = Arc<RwLock<HashMap<Uuid, EventHandlers>>>;

struct Topic {
    subscribers: Subscribers,
    token: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    live: watch::Receiver<LiveStatus>,
}

struct ManagerInner {
    channel: Arc<dyn PushChannel>,
    store: CacheStore,
    config: PushConfig,
    topics: Mutex<HashMap<String, Topic>>,
}

/// Shares push connections between subscribers and applies their events to
/// the cache.
///
/// Must be used from within a Tokio runtime: connections run as spawned tasks.
#[derive(Clone)]
pub struct PushSubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl PushSubscriptionManager {
    pub fn new(channel: Arc<dyn PushChannel>, store: CacheStore, config: PushConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                channel,
                store,
                config,
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe `handlers` to `topic`, opening the connection if this is the
    /// topic's first subscription.
    #[instrument(skip(self, handlers), fields(event_types = ?handlers))]
    pub fn subscribe(&self, topic: &str, handlers: EventHandlers) -> PushSubscription {
        let id = Uuid::new_v4();
        let mut topics = mutex_lock(&self.inner.topics, SOURCE, "subscribe");
        let entry = topics
            .entry(topic.to_owned())
            .or_insert_with(|| self.inner.open(topic));
        rw_write(&entry.subscribers, SOURCE, "subscribe.handlers").insert(id, handlers);

        let subscribers = rw_read(&entry.subscribers, SOURCE, "subscribe.count").len();
        debug!(topic, subscribers, "Push subscription added");

        PushSubscription {
            manager: Arc::clone(&self.inner),
            topic: topic.to_owned(),
            id,
            state: entry.state.clone(),
            live: entry.live.clone(),
        }
    }

    pub fn topic_count(&self) -> usize {
        mutex_lock(&self.inner.topics, SOURCE, "topic_count").len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        mutex_lock(&self.inner.topics, SOURCE, "subscriber_count")
            .get(topic)
            .map_or(0, |entry| rw_read(&entry.subscribers, SOURCE, "subscriber_count").len())
    }

    /// Current connection state of `topic`; `Closed` when nobody subscribes.
    pub fn connection_state(&self, topic: &str) -> ConnectionState {
        mutex_lock(&self.inner.topics, SOURCE, "connection_state")
            .get(topic)
            .map_or(ConnectionState::Closed, |entry| *entry.state.borrow())
    }

    /// Close every topic connection. Existing subscriptions stay valid but
    /// receive nothing further.
    pub fn close_all(&self) {
        let topics: Vec<(String, Topic)> = mutex_lock(&self.inner.topics, SOURCE, "close_all")
            .drain()
            .collect();
        for (topic, entry) in topics {
            entry.token.cancel();
            debug!(topic, "Push topic closed");
        }
    }
}

impl ManagerInner {
    fn open(&self, topic: &str) -> Topic {
        let subscribers: Subscribers = Arc::default();
        let token = CancellationToken::new();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (live_tx, live) = watch::channel(LiveStatus::Live);

        let connection = Connection {
            channel: Arc::clone(&self.channel),
            store: self.store.clone(),
            config: self.config.clone(),
            topic: topic.to_owned(),
            subscribers: Arc::clone(&subscribers),
            state: state_tx,
            live: live_tx,
        };
        tokio::spawn(connection.run(token.clone()));
        info!(topic, "Push topic opened");

        Topic {
            subscribers,
            token,
            state,
            live,
        }
    }

    fn unsubscribe(&self, topic: &str, id: Uuid) {
        let mut topics = mutex_lock(&self.topics, SOURCE, "unsubscribe");
        let Some(entry) = topics.get(topic) else {
            return;
        };

        let remaining = {
            let mut subscribers = rw_write(&entry.subscribers, SOURCE, "unsubscribe.handlers");
            subscribers.remove(&id);
            subscribers.len()
        };
        debug!(topic, remaining, "Push subscription removed");

        if remaining == 0
            && let Some(entry) = topics.remove(topic)
        {
            entry.token.cancel();
            info!(topic, "Push topic closed after last subscriber left");
        }
    }
}

struct Connection {
    channel: Arc<dyn PushChannel>,
    store: CacheStore,
    config: PushConfig,
    topic: String,
    subscribers: Subscribers,
    state: watch::Sender<ConnectionState>,
    live: watch::Sender<LiveStatus>,
}

impl Connection {
    async fn run(self, token: CancellationToken) {
        let mut backoff = Backoff::new(self.config.reconnect_base_delay, self.config.reconnect_max_delay);

        loop {
            self.state.send_replace(ConnectionState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                connected = self.channel.connect(&self.topic) => connected,
            };

            match connected {
                Ok(stream) => {
                    backoff.reset();
                    self.state.send_replace(ConnectionState::Open);
                    if self.live.send_replace(LiveStatus::Live) == LiveStatus::Degraded {
                        info!(topic = %self.topic, "Live updates restored");
                    }
                    debug!(topic = %self.topic, "Push channel open");

                    gauge!(METRIC_CONNECTIONS).increment(1.0);
                    let ended = self.pump(stream, &token).await;
                    gauge!(METRIC_CONNECTIONS).decrement(1.0);

                    match ended {
                        None => break,
                        Some(err) => {
                            if let Some(hint) = err.retry_hint() {
                                backoff.set_floor(hint);
                            }
                            warn!(topic = %self.topic, error = %err, "Push channel disconnected");
                        }
                    }
                }
                Err(err) => warn!(topic = %self.topic, error = %err, "Push channel connection failed"),
            }

            let delay = backoff.next_delay();
            let attempt = backoff.failures();
            counter!(METRIC_RECONNECTS).increment(1);
            if attempt >= self.config.degraded_after_failures
                && self.live.send_replace(LiveStatus::Degraded) == LiveStatus::Live
            {
                warn!(topic = %self.topic, attempt, "Live updates unavailable; still reconnecting");
            }
            self.state.send_replace(ConnectionState::Reconnecting { attempt });
            debug!(topic = %self.topic, attempt, ?delay, "Reconnecting push channel");

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Closed);
        debug!(topic = %self.topic, "Push connection task stopped");
    }

    /// Deliver messages until the connection drops (`Some`) or the topic is
    /// closed (`None`).
    async fn pump(&self, mut stream: EventStream, token: &CancellationToken) -> Option<ChannelError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(message)) => self.dispatch(&message),
                Some(Err(err)) => return Some(err),
                None => {
                    return Some(ChannelError::Closed {
                        topic: self.topic.clone(),
                        retry: None,
                    });
                }
            }
        }
    }

    fn dispatch(&self, message: &PushMessage) {
        counter!(METRIC_EVENTS, "event_type" => message.event_type.clone()).increment(1);

        let handlers: Vec<Arc<dyn PushHandler>> = rw_read(&self.subscribers, SOURCE, "dispatch")
            .values()
            .filter_map(|handlers| handlers.get(&message.event_type))
            .collect();
        if handlers.is_empty() {
            debug!(topic = %self.topic, event_type = %message.event_type, "Ignoring unhandled push event");
            return;
        }

        for handler in handlers {
            if let Err(err) = handler.handle(&self.store, &message.data) {
                counter!(METRIC_PARSE_ERRORS).increment(1);
                warn!(
                    topic = %self.topic,
                    event_type = %message.event_type,
                    kind = ?err.kind(),
                    error = %err,
                    "Dropping malformed push event"
                );
            }
        }
    }
}

/// A live subscription to a topic; dropping it unsubscribes.
pub struct PushSubscription {
    manager: Arc<ManagerInner>,
    topic: String,
    id: Uuid,
    state: watch::Receiver<ConnectionState>,
    live: watch::Receiver<LiveStatus>,
}

impl PushSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn live_status(&self) -> LiveStatus {
        *self.live.borrow()
    }

    pub fn live_changes(&self) -> watch::Receiver<LiveStatus> {
        self.live.clone()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for PushSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSubscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.manager.unsubscribe(&self.topic, self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::channel::mpsc::{UnboundedSender, unbounded};
    use serde_json::json;
    use time::macros::datetime;
    use tokio::sync::mpsc;

    use super::*;
    use crate::sync::handlers::{JOB_UPDATE, JOBS_TOPIC};
    use crate::sync::keys::QueryKey;

    type Feed = UnboundedSender<Result<PushMessage, ChannelError>>;

    /// Hands out one scripted stream per successful connect.
    #[derive(Default)]
    struct ScriptedChannel {
        connects: AtomicUsize,
        failures_before_open: usize,
        feeds: Mutex<Vec<Feed>>,
    }

    impl ScriptedChannel {
        fn failing(failures_before_open: usize) -> Self {
            Self {
                failures_before_open,
                ..Self::default()
            }
        }

        fn feed(&self) -> Option<Feed> {
            self.feeds.lock().ok().and_then(|feeds| feeds.last().cloned())
        }
    }

    #[async_trait]
    impl PushChannel for ScriptedChannel {
        async fn connect(&self, topic: &str) -> Result<EventStream, ChannelError> {
            let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures_before_open {
                return Err(ChannelError::Connect {
                    topic: topic.to_owned(),
                    message: "connection refused".into(),
                });
            }
            let (tx, rx) = unbounded();
            self.feeds.lock().expect("feeds").push(tx);
            Ok(rx.boxed())
        }
    }

    fn manager(channel: &Arc<ScriptedChannel>, store: &CacheStore) -> PushSubscriptionManager {
        let config = PushConfig {
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(1),
            degraded_after_failures: 2,
        };
        PushSubscriptionManager::new(Arc::clone(channel) as Arc<dyn PushChannel>, store.clone(), config)
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
        rx.wait_for(|state| *state == wanted).await.expect("state channel open");
    }

    #[tokio::test]
    async fn subscribers_share_one_connection_per_topic() {
        let store = CacheStore::new();
        let channel = Arc::new(ScriptedChannel::default());
        let manager = manager(&channel, &store);

        let first = manager.subscribe(JOBS_TOPIC, EventHandlers::jobs());
        let second = manager.subscribe(JOBS_TOPIC, EventHandlers::jobs());
        wait_for(&mut first.state_changes(), ConnectionState::Open).await;

        assert_eq!(channel.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.topic_count(), 1);
        assert_eq!(manager.subscriber_count(JOBS_TOPIC), 2);

        drop(first);
        assert_eq!(manager.connection_state(JOBS_TOPIC), ConnectionState::Open);
        let mut state = second.state_changes();
        drop(second);
        wait_for(&mut state, ConnectionState::Closed).await;
        assert_eq!(manager.topic_count(), 0);
    }

    #[tokio::test]
    async fn job_updates_patch_the_cache() {
        let store = CacheStore::new();
        store.update(&QueryKey::jobs(), |entry| {
            entry.succeeded(
                json!([{"identifier": "job-1", "state": "waiting"}]),
                datetime!(2024-10-24 10:00:00 UTC),
            )
        });
        let channel = Arc::new(ScriptedChannel::default());
        let manager = manager(&channel, &store);
        let subscription = manager.subscribe(JOBS_TOPIC, EventHandlers::jobs());
        wait_for(&mut subscription.state_changes(), ConnectionState::Open).await;

        let (applied_tx, mut applied) = mpsc::unbounded_channel();
        let _listener = store.subscribe(&QueryKey::jobs(), move |entry| {
            let _ = applied_tx.send(entry.data.clone());
        });

        let feed = channel.feed().expect("open feed");
        feed.unbounded_send(Ok(PushMessage::new("train_update", "{}"))).expect("send");
        feed.unbounded_send(Ok(PushMessage::new(JOB_UPDATE, "not json"))).expect("send");
        feed.unbounded_send(Ok(PushMessage::new(
            JOB_UPDATE,
            r#"{"identifier":"job-1","state":"running"}"#,
        )))
        .expect("send");

        let data = applied.recv().await.flatten().expect("patched list");
        assert_eq!(*data, json!([{"identifier": "job-1", "state": "running"}]));
        assert_eq!(subscription.state(), ConnectionState::Open);
        assert_eq!(channel.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_degrade_then_recover() {
        let store = CacheStore::new();
        let channel = Arc::new(ScriptedChannel::failing(3));
        let manager = manager(&channel, &store);
        let subscription = manager.subscribe(JOBS_TOPIC, EventHandlers::jobs());

        let mut live = subscription.live_changes();
        live.wait_for(|status| *status == LiveStatus::Degraded)
            .await
            .expect("live channel open");
        live.wait_for(|status| *status == LiveStatus::Live)
            .await
            .expect("live channel open");

        assert_eq!(subscription.state(), ConnectionState::Open);
        assert_eq!(channel.connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_stream_reconnects() {
        let store = CacheStore::new();
        let channel = Arc::new(ScriptedChannel::default());
        let manager = manager(&channel, &store);
        let subscription = manager.subscribe(JOBS_TOPIC, EventHandlers::jobs());
        let mut state = subscription.state_changes();
        wait_for(&mut state, ConnectionState::Open).await;

        let feed = channel.feed().expect("open feed");
        feed.unbounded_send(Err(ChannelError::Stream {
            topic: JOBS_TOPIC.into(),
            message: "reset by peer".into(),
            retry: None,
        }))
        .expect("send");

        wait_for(&mut state, ConnectionState::Reconnecting { attempt: 1 }).await;
        wait_for(&mut state, ConnectionState::Open).await;
        assert_eq!(channel.connects.load(Ordering::SeqCst), 2);
        assert_eq!(subscription.live_status(), LiveStatus::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn server_retry_hint_delays_reconnection() {
        let store = CacheStore::new();
        let channel = Arc::new(ScriptedChannel::default());
        let manager = manager(&channel, &store);
        let subscription = manager.subscribe(JOBS_TOPIC, EventHandlers::jobs());
        let mut state = subscription.state_changes();
        wait_for(&mut state, ConnectionState::Open).await;

        let feed = channel.feed().expect("open feed");
        feed.unbounded_send(Err(ChannelError::Closed {
            topic: JOBS_TOPIC.into(),
            retry: Some(Duration::from_millis(900)),
        }))
        .expect("send");
        wait_for(&mut state, ConnectionState::Reconnecting { attempt: 1 }).await;

        // Without the hint the first delay is at most 100ms.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(channel.connects.load(Ordering::SeqCst), 1);

        wait_for(&mut state, ConnectionState::Open).await;
        assert_eq!(channel.connects.load(Ordering::SeqCst), 2);
    }
}
