use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use httpmock::MockServer;
use reqwest::{Client, Url};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use trainboard::application::monitor::Monitor;
use trainboard::config::ApiSettings;
use trainboard::infra::http::ReqwestFetcher;
use trainboard::infra::sse::SseChannel;
use trainboard::resources::{FetchRequest, Fetcher, Resources};
use trainboard::sync::{
    CacheStore, FetchError, PushConfig, PushSubscriptionManager, QueryConfig, QueryCoordinator,
    QueryKey,
};
use trainboard_api_types::MetricSource;

fn fetcher(server: &MockServer) -> ReqwestFetcher {
    let base = Url::parse(&server.base_url()).expect("mock server url");
    ReqwestFetcher::with_client(Client::new(), base).expect("fetcher")
}

fn api_settings(server: &MockServer) -> ApiSettings {
    ApiSettings {
        base_url: Url::parse(&server.base_url()).expect("mock server url"),
        request_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn fetch_sends_query_and_decodes_json() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET")
                .path("/jobs")
                .query_param("response_type", "default")
                .query_param("offset", "0")
                .query_param("limit", "10")
                .header("accept", "application/json");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"[{"identifier":"a","state":"running"}]"#);
        })
        .await;

    let request = FetchRequest::new(["jobs"])
        .param("response_type", "default")
        .param("offset", "0")
        .param("limit", "10");
    let body = fetcher(&server)
        .fetch(&request, CancellationToken::new())
        .await
        .expect("jobs list");

    mock.assert_async().await;
    assert_eq!(body, json!([{"identifier": "a", "state": "running"}]));
}

#[tokio::test]
async fn non_success_status_carries_detail() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/jobs/missing");
            then.status(404)
                .header("content-type", "application/json")
                .body(r#"{"detail":"Job not found"}"#);
        })
        .await;

    let err = fetcher(&server)
        .fetch(&FetchRequest::new(["jobs", "missing"]), CancellationToken::new())
        .await
        .expect_err("404");

    assert_eq!(err, FetchError::http(404, "Job not found"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/trains/count");
            then.status(503).body("maintenance");
        })
        .await;

    let err = fetcher(&server)
        .fetch(&FetchRequest::new(["trains", "count"]), CancellationToken::new())
        .await
        .expect_err("503");

    assert_eq!(err, FetchError::http(503, "maintenance"));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn invalid_json_is_a_decode_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/stations");
            then.status(200).body("<html>");
        })
        .await;

    let err = fetcher(&server)
        .fetch(&FetchRequest::new(["stations"]), CancellationToken::new())
        .await
        .expect_err("not json");

    assert!(matches!(err, FetchError::Decode(_)));
}

#[tokio::test]
async fn cancelled_token_aborts_the_request() {
    let server = MockServer::start_async().await;
    let token = CancellationToken::new();
    token.cancel();

    let err = fetcher(&server)
        .fetch(&FetchRequest::new(["jobs"]), token)
        .await
        .expect_err("cancelled");

    assert_eq!(err, FetchError::Aborted);
}

#[tokio::test]
async fn unreachable_backend_is_a_network_error() {
    let base = Url::parse("http://127.0.0.1:1/").expect("url");
    let fetcher = ReqwestFetcher::with_client(Client::new(), base).expect("fetcher");

    let err = fetcher
        .fetch(&FetchRequest::new(["jobs"]), CancellationToken::new())
        .await
        .expect_err("connection refused");

    assert!(matches!(err, FetchError::Network(_)));
}

#[tokio::test]
async fn metric_series_are_fetched_and_bounded() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method("GET")
                .path("/jobs/j1/metrics")
                .query_param("metric", "network");
            then.status(200).header("content-type", "application/json").body(
                r#"{"source":"network","metrics":[
                    {"timestamp":"2024-10-24T10:00:03Z","value":"3"},
                    {"timestamp":"2024-10-24T10:00:01Z","value":"1"},
                    {"timestamp":"2024-10-24T10:00:02Z","value":"2"}
                ]}"#,
            );
        })
        .await;

    let window = NonZeroUsize::new(2).expect("window");
    let resources = Resources::new(Arc::new(fetcher(&server)), window);
    let fetch = resources
        .query_fn(&QueryKey::job_metrics("j1", MetricSource::Network))
        .expect("mapped");

    let series = fetch(CancellationToken::new()).await.expect("series");
    mock.assert_async().await;
    let timestamps: Vec<_> = series["metrics"]
        .as_array()
        .expect("samples")
        .iter()
        .map(|sample| sample["timestamp"].as_str().expect("timestamp").to_owned())
        .collect();
    assert_eq!(timestamps, vec!["2024-10-24T10:00:02Z", "2024-10-24T10:00:03Z"]);
}

#[tokio::test]
async fn summary_collects_every_count() {
    let server = MockServer::start_async().await;
    for (path, count) in [("/trains/count", 7), ("/stations/count", 3), ("/jobs/count", 2)] {
        server
            .mock_async(|when, then| {
                when.method("GET").path(path);
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({"count": count}).to_string());
            })
            .await;
    }
    server
        .mock_async(|when, then| {
            when.method("GET").path("/jobs/summary");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"[{"state":"running","count":2}]"#);
        })
        .await;

    let settings = api_settings(&server);
    let store = CacheStore::new();
    let resources = Resources::new(
        Arc::new(ReqwestFetcher::new(&settings).expect("fetcher")),
        NonZeroUsize::new(10).expect("window"),
    );
    let coordinator = QueryCoordinator::new(store.clone(), QueryConfig::default());
    let channel = SseChannel::new(&settings).expect("channel");
    let push = PushSubscriptionManager::new(Arc::new(channel), store, PushConfig::default());
    let monitor = Monitor::new(coordinator, push, resources);

    let summary = monitor.summary().await.expect("summary");

    assert_eq!(summary.trains, 7);
    assert_eq!(summary.stations, 3);
    assert_eq!(summary.jobs.len(), 7);
    assert!(summary.jobs.values().all(|count| *count == 2));
    assert_eq!(summary.job_summary, json!([{"state": "running", "count": 2}]));
    assert_eq!(monitor.push().topic_count(), 0);
}
