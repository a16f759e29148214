use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the sync layer records.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "trainboard_cache_writes_total",
            Unit::Count,
            "Cache entry writes applied, labelled by resulting status."
        );
        describe_counter!(
            "trainboard_cache_stale_writes_discarded_total",
            Unit::Count,
            "Writes discarded because a newer version was already cached."
        );
        describe_counter!(
            "trainboard_query_fetches_total",
            Unit::Count,
            "Completed query fetches, labelled by outcome."
        );
        describe_counter!(
            "trainboard_query_retries_total",
            Unit::Count,
            "Fetch attempts retried after a transient failure."
        );
        describe_counter!(
            "trainboard_push_events_total",
            Unit::Count,
            "Push events received, labelled by event type."
        );
        describe_counter!(
            "trainboard_push_parse_errors_total",
            Unit::Count,
            "Push events dropped because their payload could not be applied."
        );
        describe_counter!(
            "trainboard_push_reconnects_total",
            Unit::Count,
            "Push channel reconnection attempts scheduled."
        );
        describe_gauge!(
            "trainboard_push_connections",
            Unit::Count,
            "Currently open push channel connections."
        );
    });
}
