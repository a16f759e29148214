//! reqwest-backed [`Fetcher`].

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url, header};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::ApiSettings;
use crate::resources::{FetchRequest, Fetcher};
use crate::sync::FetchError;

use super::error::InfraError;

#[derive(Clone, Debug)]
pub struct ReqwestFetcher {
    client: Client,
    base: Url,
}

impl ReqwestFetcher {
    pub fn new(settings: &ApiSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.request_timeout)
            .build()?;
        Self::with_client(client, settings.base_url.clone())
    }

    /// Use a preconfigured client; `base` must be able to carry path segments.
    pub fn with_client(client: Client, base: Url) -> Result<Self, InfraError> {
        if base.cannot_be_a_base() {
            return Err(InfraError::url(base.as_str(), "cannot be used as a base URL"));
        }
        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("trainboard/", env!("CARGO_PKG_VERSION"))
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn url(&self, request: &FetchRequest) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(&request.segments);
        }
        if !request.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.params);
        }
        url
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    #[instrument(skip_all, fields(request = %request))]
    async fn fetch(&self, request: &FetchRequest, token: CancellationToken) -> Result<Value, FetchError> {
        let send = self
            .client
            .get(self.url(request))
            .header(header::ACCEPT, "application/json")
            .send();
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Aborted),
            response = send => response.map_err(transport_error)?,
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Aborted),
            body = response.bytes() => body.map_err(transport_error)?,
        };
        debug!(status = status.as_u16(), bytes = body.len(), "Response received");

        if !status.is_success() {
            return Err(FetchError::http(status.as_u16(), error_detail(status, &body)));
        }
        serde_json::from_slice(&body).map_err(|err| FetchError::Decode(err.to_string()))
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Network("request timed out".to_string())
    } else if err.is_decode() {
        FetchError::Decode(err.to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

/// The `detail` field of a JSON error body, else the body text.
fn error_detail(status: StatusCode, body: &[u8]) -> String {
    if let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(body)
        && let Some(detail) = fields.get("detail")
    {
        return match detail {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("no details")
            .to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(base: &str) -> ReqwestFetcher {
        ReqwestFetcher::with_client(Client::new(), Url::parse(base).expect("url")).expect("base url")
    }

    #[test]
    fn urls_join_segments_and_params() {
        let request = FetchRequest::new(["jobs", "job 1", "metrics"]).param("metric", "cpu");

        let url = fetcher("http://localhost:8000").url(&request);
        assert_eq!(url.as_str(), "http://localhost:8000/jobs/job%201/metrics?metric=cpu");

        let url = fetcher("https://example.com/api/").url(&FetchRequest::new(["trains", "count"]));
        assert_eq!(url.as_str(), "https://example.com/api/trains/count");
    }

    #[test]
    fn error_detail_prefers_json_detail() {
        assert_eq!(
            error_detail(StatusCode::NOT_FOUND, br#"{"detail":"Job not found"}"#),
            "Job not found"
        );
        assert_eq!(
            error_detail(StatusCode::UNPROCESSABLE_ENTITY, br#"{"detail":[{"loc":["query"]}]}"#),
            r#"[{"loc":["query"]}]"#
        );
        assert_eq!(error_detail(StatusCode::BAD_GATEWAY, b"upstream down\n"), "upstream down");
        assert_eq!(error_detail(StatusCode::SERVICE_UNAVAILABLE, b""), "Service Unavailable");
    }

    #[test]
    fn opaque_urls_are_rejected() {
        let err = ReqwestFetcher::with_client(Client::new(), Url::parse("mailto:ops@example.com").expect("url"))
            .expect_err("not a base");
        assert!(matches!(err, InfraError::Url { .. }));
    }
}
