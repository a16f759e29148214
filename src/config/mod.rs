//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "trainboard";
const ENV_PREFIX: &str = "TRAINBOARD";
const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STALE_TIME_SECS: u64 = 30;
const DEFAULT_RETRY_MAX_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_METRIC_WINDOW: usize = 120;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_DEGRADED_AFTER_FAILURES: u64 = 3;

/// Command-line arguments for the trainboard binary.
#[derive(Debug, Parser)]
#[command(name = "trainboard", version, about = "Live train, station and job monitor")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TRAINBOARD_CONFIG_FILE", value_name = "PATH", global = true)]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Follow the jobs list and log job state changes as they arrive.
    Watch,
    /// Follow one job's detail and its cpu, memory and network series.
    Job(JobArgs),
    /// Print train, station and job counts once.
    Summary,
}

#[derive(Debug, Args, Clone)]
pub struct JobArgs {
    /// Job identifier.
    #[arg(value_name = "ID")]
    pub id: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the backend base URL.
    #[arg(long = "api-url", env = "TRAINBOARD_API_URL", value_name = "URL", global = true)]
    pub api_url: Option<String>,

    /// Override the per-request timeout.
    #[arg(long = "api-request-timeout-seconds", value_name = "SECONDS", global = true)]
    pub api_request_timeout_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the age after which cached data is refetched.
    #[arg(long = "query-stale-time-seconds", value_name = "SECONDS", global = true)]
    pub query_stale_time_seconds: Option<u64>,

    /// Override the number of samples kept per metric series.
    #[arg(long = "query-metric-window", value_name = "COUNT", global = true)]
    pub query_metric_window: Option<usize>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api: ApiSettings,
    pub logging: LoggingSettings,
    pub query: QuerySettings,
    pub push: PushSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: Url,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct QuerySettings {
    /// `None` when age-based refetching is disabled.
    pub stale_time: Option<Duration>,
    pub retry_max_attempts: NonZeroU32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub metric_window: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub degraded_after_failures: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse command-line arguments and load settings from them.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    api: RawApiSettings,
    logging: RawLoggingSettings,
    query: RawQuerySettings,
    push: RawPushSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawApiSettings {
    base_url: Option<String>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQuerySettings {
    stale_time_seconds: Option<u64>,
    stale_time_enabled: Option<bool>,
    retry_max_attempts: Option<u64>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    metric_window: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPushSettings {
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    degraded_after_failures: Option<u64>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(url) = overrides.api_url.as_ref() {
            self.api.base_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.api_request_timeout_seconds {
            self.api.request_timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(seconds) = overrides.query_stale_time_seconds {
            self.query.stale_time_seconds = Some(seconds);
        }
        if let Some(window) = overrides.query_metric_window {
            self.query.metric_window = Some(window);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            api,
            logging,
            query,
            push,
        } = raw;

        Ok(Self {
            api: build_api_settings(api)?,
            logging: build_logging_settings(logging)?,
            query: build_query_settings(query)?,
            push: build_push_settings(push)?,
        })
    }
}

fn build_api_settings(api: RawApiSettings) -> Result<ApiSettings, LoadError> {
    let raw_url = api
        .base_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let base_url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("api.base_url", format!("`{raw_url}`: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "api.base_url",
            format!("unsupported scheme `{}`", base_url.scheme()),
        ));
    }

    let timeout_secs = api
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "api.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ApiSettings {
        base_url,
        request_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_query_settings(query: RawQuerySettings) -> Result<QuerySettings, LoadError> {
    let stale_time = query.stale_time_enabled.unwrap_or(true).then(|| {
        Duration::from_secs(query.stale_time_seconds.unwrap_or(DEFAULT_STALE_TIME_SECS))
    });

    let retry_max_attempts = non_zero_u32(
        query.retry_max_attempts.unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
        "query.retry_max_attempts",
    )?;
    let retry_base_delay =
        Duration::from_millis(query.retry_base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS));
    let retry_max_delay =
        Duration::from_millis(query.retry_max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS));
    if retry_max_delay < retry_base_delay {
        return Err(LoadError::invalid(
            "query.retry_max_delay_ms",
            "must not be lower than query.retry_base_delay_ms",
        ));
    }

    let metric_window = NonZeroUsize::new(query.metric_window.unwrap_or(DEFAULT_METRIC_WINDOW))
        .ok_or_else(|| LoadError::invalid("query.metric_window", "must be greater than zero"))?;

    Ok(QuerySettings {
        stale_time,
        retry_max_attempts,
        retry_base_delay,
        retry_max_delay,
        metric_window,
    })
}

fn build_push_settings(push: RawPushSettings) -> Result<PushSettings, LoadError> {
    let base_ms = push
        .reconnect_base_delay_ms
        .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS);
    if base_ms == 0 {
        return Err(LoadError::invalid(
            "push.reconnect_base_delay_ms",
            "must be greater than zero",
        ));
    }
    let max_ms = push
        .reconnect_max_delay_ms
        .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS);
    if max_ms < base_ms {
        return Err(LoadError::invalid(
            "push.reconnect_max_delay_ms",
            "must not be lower than push.reconnect_base_delay_ms",
        ));
    }

    Ok(PushSettings {
        reconnect_base_delay: Duration::from_millis(base_ms),
        reconnect_max_delay: Duration::from_millis(max_ms),
        degraded_after_failures: non_zero_u32(
            push.degraded_after_failures
                .unwrap_or(DEFAULT_DEGRADED_AFTER_FAILURES),
            "push.degraded_after_failures",
        )?,
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
