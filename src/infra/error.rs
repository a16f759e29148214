use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("invalid api url `{url}`: {message}")]
    Url { url: String, message: String },
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Url {
            url: url.into(),
            message: message.into(),
        }
    }
}
