//! Server-sent events transport for push topics.

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Url, header};
use tracing::{debug, instrument};

use crate::config::ApiSettings;
use crate::sync::{ChannelError, EventStream, PushChannel, PushMessage};

use super::error::InfraError;
use super::http::ReqwestFetcher;

const DEFAULT_EVENT_TYPE: &str = "message";

/// Incremental `text/event-stream` decoder.
///
/// Bytes may arrive split at any point, including inside a UTF-8 sequence
/// or between the `\r` and `\n` of a line ending. An event is dispatched on
/// the blank line that terminates it; a trailing event without one is
/// dropped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    skip_lf: bool,
    event_type: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    retry: Option<Duration>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconnection delay most recently advertised by the server.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<PushMessage> {
        let mut messages = Vec::new();
        for &byte in chunk {
            if std::mem::take(&mut self.skip_lf) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\n' => self.end_line(&mut messages),
                b'\r' => {
                    self.end_line(&mut messages);
                    self.skip_lf = true;
                }
                _ => self.line.push(byte),
            }
        }
        messages
    }

    fn end_line(&mut self, messages: &mut Vec<PushMessage>) {
        let raw = std::mem::take(&mut self.line);
        let line = String::from_utf8_lossy(&raw);

        if line.is_empty() {
            messages.extend(self.dispatch());
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (&*line, ""),
        };
        match field {
            "event" => self.event_type = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_owned()),
            "retry" => {
                if let Ok(millis) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(millis));
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<PushMessage> {
        let event_type = self.event_type.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(PushMessage {
            event_type: event_type
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_owned()),
            data,
            id: self.last_id.clone(),
        })
    }
}

/// [`PushChannel`] over HTTP server-sent events. Topics are paths below the
/// API base URL.
#[derive(Clone, Debug)]
pub struct SseChannel {
    client: Client,
    base: Url,
}

impl SseChannel {
    /// The request timeout bounds connection setup only; streams stay open.
    pub fn new(settings: &ApiSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(ReqwestFetcher::user_agent())
            .connect_timeout(settings.request_timeout)
            .build()?;
        Self::with_client(client, settings.base_url.clone())
    }

    pub fn with_client(client: Client, base: Url) -> Result<Self, InfraError> {
        if base.cannot_be_a_base() {
            return Err(InfraError::url(base.as_str(), "cannot be used as a base URL"));
        }
        Ok(Self { client, base })
    }

    pub fn url(&self, topic: &str) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(topic.split('/').filter(|segment| !segment.is_empty()));
        }
        url
    }
}

#[async_trait]
impl PushChannel for SseChannel {
    #[instrument(skip(self))]
    async fn connect(&self, topic: &str) -> Result<EventStream, ChannelError> {
        let response = self
            .client
            .get(self.url(topic))
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|err| ChannelError::Connect {
                topic: topic.to_owned(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Status {
                topic: topic.to_owned(),
                status: status.as_u16(),
            });
        }
        debug!(status = status.as_u16(), "Event stream opened");

        let topic = topic.to_owned();
        let mut body = response.bytes_stream();
        let events = stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => {
                        for message in decoder.feed(&chunk) {
                            yield Ok(message);
                        }
                    }
                    Err(err) => {
                        yield Err(ChannelError::Stream {
                            topic: topic.clone(),
                            message: err.to_string(),
                            retry: decoder.retry(),
                        });
                        return;
                    }
                }
            }
            yield Err(ChannelError::Closed { topic, retry: decoder.retry() });
        };
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Vec<PushMessage> {
        let mut decoder = SseDecoder::new();
        chunks.iter().flat_map(|chunk| decoder.feed(chunk)).collect()
    }

    #[test]
    fn named_events_dispatch_on_blank_line() {
        let messages = decode_all(&[b"event: job_update\ndata: {\"id\":\"1\"}\n\n"]);
        assert_eq!(messages, vec![PushMessage::new("job_update", r#"{"id":"1"}"#)]);
    }

    #[test]
    fn multi_line_data_is_joined_with_newlines() {
        let messages = decode_all(&[b"data: first\ndata:second\ndata\n\n"]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event_type, "message");
        assert_eq!(messages[0].data, "first\nsecond\n");
    }

    #[test]
    fn split_chunks_and_crlf_are_reassembled() {
        let messages = decode_all(&[b"event: metric_upd", b"ate\r", b"\ndata: 4", b"2\r\n\r", b"\n"]);
        assert_eq!(messages, vec![PushMessage::new("metric_update", "42")]);
    }

    #[test]
    fn comments_and_events_without_data_are_skipped() {
        let messages = decode_all(&[b": keep-alive\n\nevent: job_update\n\ndata: x\n\n"]);
        assert_eq!(messages, vec![PushMessage::new("message", "x")]);
    }

    #[test]
    fn ids_persist_and_retry_is_recorded() {
        let mut decoder = SseDecoder::new();
        let messages = decoder.feed(b"id: 7\nretry: 2500\ndata: a\n\ndata: b\n\n");
        let ids: Vec<_> = messages.iter().map(|message| message.id.as_deref()).collect();
        assert_eq!(ids, vec![Some("7"), Some("7")]);
        assert_eq!(decoder.retry(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn unterminated_event_is_not_dispatched() {
        assert!(decode_all(&[b"event: job_update\ndata: {}\n"]).is_empty());
    }

    #[test]
    fn topic_urls_are_joined_below_the_base() {
        let channel = SseChannel::with_client(Client::new(), Url::parse("http://localhost:8000/api/").expect("url"))
            .expect("base url");
        assert_eq!(
            channel.url("jobs/42/metrics/sse").as_str(),
            "http://localhost:8000/api/jobs/42/metrics/sse"
        );
    }
}
