use std::time::Duration;

use thiserror::Error;

/// Failure of a fetcher call.
///
/// `Clone` so one in-flight result can be handed to every deduplicated waiter
/// and retained in the cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// No response was received.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered with a non-2xx status.
    #[error("http error {status}: {detail}")]
    Http { status: u16, detail: String },
    /// The request was cancelled before completion.
    #[error("request aborted")]
    Aborted,
    /// The response body was not the expected JSON.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Error taxonomy used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable: no response, 5xx, request timeout or throttling.
    Transport,
    /// 4xx: surfaced immediately.
    Client,
    /// Malformed payload.
    Parse,
    /// Cancellation requested by the coordinator.
    Aborted,
}

impl FetchError {
    pub fn http(status: u16, detail: impl Into<String>) -> Self {
        Self::Http {
            status,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network(_) => ErrorKind::Transport,
            FetchError::Http { status, .. } => match status {
                408 | 429 => ErrorKind::Transport,
                400..=499 => ErrorKind::Client,
                _ => ErrorKind::Transport,
            },
            FetchError::Aborted => ErrorKind::Aborted,
            FetchError::Decode(_) => ErrorKind::Parse,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

/// Failure of a push-channel connection.
///
/// Errors that end an open stream carry the reconnection delay the server
/// last advertised on it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("failed to connect to `{topic}`: {message}")]
    Connect { topic: String, message: String },
    #[error("push topic `{topic}` answered with status {status}")]
    Status { topic: String, status: u16 },
    #[error("push stream for `{topic}` failed: {message}")]
    Stream {
        topic: String,
        message: String,
        retry: Option<Duration>,
    },
    #[error("push stream for `{topic}` closed by the server")]
    Closed { topic: String, retry: Option<Duration> },
}

impl ChannelError {
    /// Server-advertised minimum delay before reconnecting.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            ChannelError::Stream { retry, .. } | ChannelError::Closed { retry, .. } => *retry,
            ChannelError::Connect { .. } | ChannelError::Status { .. } => None,
        }
    }
}

/// Failure while applying one push message.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("malformed `{event_type}` payload: {source}")]
    Parse {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PushError {
    pub fn parse(event_type: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Parse {
            event_type: event_type.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PushError::Parse { .. } => ErrorKind::Parse,
        }
    }
}
