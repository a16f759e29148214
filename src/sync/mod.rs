//! Live data synchronisation
//!
//! Keeps list, detail and metric-series views consistent while they are fed
//! by two sources:
//!
//! - **Pull**: the [`QueryCoordinator`] fetches keys on observation and
//!   writes results to the [`CacheStore`], one in-flight fetch per key
//! - **Push**: the [`PushSubscriptionManager`] holds one connection per
//!   topic and applies incoming events as targeted cache patches
//!
//! Every write carries a version from a single store-wide counter. A fetch
//! captures its version when it starts, so a push patch applied while the
//! fetch is in flight wins over the fetch result.

mod config;
mod coordinator;
mod entry;
mod error;
mod handlers;
mod keys;
mod lock;
mod push;
pub mod reconcile;
mod retry;
mod store;

pub use config::{PushConfig, QueryConfig};
pub use coordinator::{QueryCoordinator, QueryFn, QueryObserver, QueryOptions, QueryState, query_fn};
pub use entry::{QueryEntry, QueryStatus, Version};
pub use error::{ChannelError, ErrorKind, FetchError, PushError};
pub use handlers::{
    EventHandlers, JOB_UPDATE, JOBS_TOPIC, JobUpdateHandler, METRIC_UPDATE, MetricUpdateHandler,
    PushHandler, job_metrics_topic,
};
pub use keys::{
    COUNT_PARAM, JOBS, METRIC_PARAM, METRICS_SUB, QueryKey, STATE_PARAM, STATIONS, SUMMARY_PARAM,
    TRAINS,
};
pub use push::{
    ConnectionState, EventStream, LiveStatus, PushChannel, PushMessage, PushSubscription,
    PushSubscriptionManager,
};
pub use retry::{Backoff, RetryPolicy};
pub use store::{CacheStore, ListenerHandle, WriteOutcome};
