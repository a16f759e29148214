use std::time::Duration;

use futures::StreamExt;
use httpmock::MockServer;
use reqwest::{Client, Url};
use serde_json::json;
use time::OffsetDateTime;
use trainboard::infra::sse::SseChannel;
use trainboard::sync::{
    CacheStore, ChannelError, EventHandlers, JOBS_TOPIC, PushChannel, PushConfig, PushMessage,
    PushSubscriptionManager, QueryKey,
};

const JOB_EVENTS: &str = concat!(
    ": connected\n",
    "retry: 2500\n\n",
    "event: job_update\n",
    "id: 1\n",
    "data: {\"identifier\":\"a\",\"state\":\"running\"}\n\n",
    "event: job_update\r\n",
    "data: {\"identifier\":\"b\",\r\n",
    "data: \"state\":\"failed\"}\r\n\r\n",
);

fn channel(server: &MockServer) -> SseChannel {
    let base = Url::parse(&server.base_url()).expect("mock server url");
    SseChannel::with_client(Client::new(), base).expect("channel")
}

async fn serve_job_events(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method("GET")
                .path("/jobs/sse")
                .header("accept", "text/event-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(JOB_EVENTS);
        })
        .await
}

#[tokio::test]
async fn stream_yields_events_then_reports_close_with_retry_hint() {
    let server = MockServer::start_async().await;
    let mock = serve_job_events(&server).await;

    let items: Vec<_> = channel(&server)
        .connect(JOBS_TOPIC)
        .await
        .expect("connected")
        .collect()
        .await;
    mock.assert_async().await;

    assert_eq!(items.len(), 3);
    let first = items[0].as_ref().expect("first event");
    assert_eq!(first.event_type, "job_update");
    assert_eq!(first.id.as_deref(), Some("1"));
    assert_eq!(
        items[1].as_ref().expect("second event"),
        &PushMessage {
            event_type: "job_update".to_owned(),
            data: "{\"identifier\":\"b\",\n\"state\":\"failed\"}".to_owned(),
            id: Some("1".to_owned()),
        }
    );
    let closed = items[2].as_ref().expect_err("stream end");
    assert!(matches!(closed, ChannelError::Closed { topic, .. } if topic == JOBS_TOPIC));
    assert_eq!(closed.retry_hint(), Some(Duration::from_millis(2500)));
}

#[tokio::test]
async fn error_status_fails_the_connection() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/jobs/j1/metrics/sse");
            then.status(503);
        })
        .await;

    let err = match channel(&server).connect("jobs/j1/metrics/sse").await {
        Ok(_) => panic!("503 must not open a stream"),
        Err(err) => err,
    };

    assert!(matches!(err, ChannelError::Status { status: 503, .. }));
}

#[tokio::test]
async fn manager_applies_streamed_updates_to_the_cache() {
    let server = MockServer::start_async().await;
    serve_job_events(&server).await;

    let store = CacheStore::new();
    let at = OffsetDateTime::now_utc();
    store.update(&QueryKey::jobs(), move |entry| {
        entry.succeeded(json!([{"identifier": "a", "state": "waiting"}]), at)
    });

    let config = PushConfig {
        reconnect_base_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(50),
        degraded_after_failures: 10,
    };
    let manager = PushSubscriptionManager::new(std::sync::Arc::new(channel(&server)), store.clone(), config);
    let subscription = manager.subscribe(JOBS_TOPIC, EventHandlers::jobs());

    let patched = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let entry = store.get(&QueryKey::jobs()).expect("jobs list");
            if entry.data.as_deref() == Some(&json!([{"identifier": "a", "state": "running"}])) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(patched.is_ok(), "job update never reached the cache");
    drop(subscription);
    assert_eq!(manager.topic_count(), 0);
}
