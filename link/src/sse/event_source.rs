//! EventSource abstraction and its HTTP implementation.

use super::decoder::{SseDecoder, SseEvent};
use crate::{
    error::{EdenLinkError, Result},
    fetch::{HttpBody, HttpRequest},
    links::http::HttpLinkOptions,
    models::HttpMethod,
};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Default reconnect delay of an event source, before the server sends a
/// `retry:` field.
pub const DEFAULT_RETRY_MS: u64 = 3000;

/// What an event source reports.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// The stream is open.
    Open,
    /// A complete event.
    Message(SseEvent),
    /// The stream failed. With `closed` the source gave up; otherwise it
    /// reconnects on its own.
    Error {
        /// Whether the source is now closed for good
        closed: bool,
        /// What went wrong
        error: EdenLinkError,
    },
}

/// Pull-based event source.
#[async_trait::async_trait]
pub trait EventSourceLike: Send {
    /// Next event. `None` once the source is closed.
    async fn next_event(&mut self) -> Option<SourceEvent>;

    /// Close the source. Further calls to `next_event` return `None`.
    fn close(&mut self);

    /// Reconnect delay the server asked for with `retry:`.
    fn retry_delay(&self) -> Option<Duration> {
        None
    }
}

/// Creates event sources; one per (re)connect of a consumer.
pub trait EventSourceFactory: Send + Sync + 'static {
    /// Source for `url`.
    fn create(&self, url: String) -> Box<dyn EventSourceLike>;
}

enum SourceState {
    Connecting { wait: bool },
    Open(BoxStream<'static, Result<Bytes>>),
    Closed,
}

/// [`EventSourceLike`] over a streaming HTTP GET.
///
/// Used on its own, network failures reconnect to the same URL after the
/// `retry:` delay, sending `Last-Event-ID`. [`SseStreamConsumer`] instead
/// closes the source on the first failure and creates a new one from a
/// rebuilt URL. A non-2xx answer or a body that is not `text/event-stream`
/// closes the source.
///
/// [`SseStreamConsumer`]: super::SseStreamConsumer
pub struct HttpEventSource {
    options: HttpLinkOptions,
    url: String,
    state: SourceState,
    decoder: SseDecoder,
    queue: VecDeque<SourceEvent>,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl fmt::Debug for HttpEventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            SourceState::Connecting { .. } => "connecting",
            SourceState::Open(_) => "open",
            SourceState::Closed => "closed",
        };
        f.debug_struct("HttpEventSource")
            .field("url", &self.url)
            .field("state", &state)
            .field("last_event_id", &self.last_event_id)
            .finish()
    }
}

impl HttpEventSource {
    /// Source for `url` using the transport and credentials of `options`.
    pub fn new(options: HttpLinkOptions, url: impl Into<String>) -> Self {
        Self {
            options,
            url: url.into(),
            state: SourceState::Connecting { wait: false },
            decoder: SseDecoder::new(),
            queue: VecDeque::new(),
            last_event_id: None,
            retry: None,
        }
    }

    async fn connect(&mut self) -> SourceEvent {
        let mut headers = match self.options.resolved_headers().await {
            Ok(headers) => headers,
            Err(error) => {
                self.state = SourceState::Closed;
                return SourceEvent::Error { closed: true, error };
            },
        };
        headers.insert("accept".to_string(), "text/event-stream".to_string());
        headers.insert("cache-control".to_string(), "no-cache".to_string());
        if let Some(id) = &self.last_event_id {
            headers.insert("last-event-id".to_string(), id.clone());
        }
        log::debug!("[EDEN_SSE] Connecting to {}", self.url);
        let request = HttpRequest {
            method: HttpMethod::Get,
            url: self.url.clone(),
            headers,
            body: HttpBody::Empty,
            signal: None,
        };
        match self.options.send(request).await {
            Ok(response) if !response.is_success() => {
                let status = response.status;
                let value = response.json_or_text().await.unwrap_or_default();
                self.state = SourceState::Closed;
                SourceEvent::Error {
                    closed: true,
                    error: EdenLinkError::FetchStatusError { status, value },
                }
            },
            Ok(response) if response.mime_type().as_deref() != Some("text/event-stream") => {
                self.state = SourceState::Closed;
                SourceEvent::Error {
                    closed: true,
                    error: EdenLinkError::ConfigurationError(format!(
                        "Expected text/event-stream, got {}",
                        response.mime_type().unwrap_or_else(|| "no content type".to_string())
                    )),
                }
            },
            Ok(response) => {
                self.decoder = SseDecoder::new();
                self.state = SourceState::Open(response.into_stream());
                SourceEvent::Open
            },
            Err(error) => {
                log::warn!("[EDEN_SSE] Connection to {} failed: {}", self.url, error);
                self.state = SourceState::Connecting { wait: true };
                SourceEvent::Error {
                    closed: false,
                    error,
                }
            },
        }
    }
}

#[async_trait::async_trait]
impl EventSourceLike for HttpEventSource {
    async fn next_event(&mut self) -> Option<SourceEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            match &mut self.state {
                SourceState::Closed => return None,
                SourceState::Connecting { wait } => {
                    if *wait {
                        let delay = self.retry.unwrap_or(Duration::from_millis(DEFAULT_RETRY_MS));
                        tokio::time::sleep(delay).await;
                    }
                    return Some(self.connect().await);
                },
                SourceState::Open(body) => match body.next().await {
                    Some(Ok(chunk)) => {
                        for event in self.decoder.push(&chunk) {
                            if let Some(id) = self.decoder.last_event_id() {
                                self.last_event_id = Some(id.to_string());
                            }
                            self.queue.push_back(SourceEvent::Message(event));
                        }
                        if let Some(ms) = self.decoder.reconnect_ms() {
                            self.retry = Some(Duration::from_millis(ms));
                        }
                    },
                    Some(Err(error)) => {
                        self.state = SourceState::Connecting { wait: true };
                        return Some(SourceEvent::Error {
                            closed: false,
                            error,
                        });
                    },
                    None => {
                        self.state = SourceState::Connecting { wait: true };
                        return Some(SourceEvent::Error {
                            closed: false,
                            error: EdenLinkError::TransportError("Event stream ended".to_string()),
                        });
                    },
                },
            }
        }
    }

    fn close(&mut self) {
        self.state = SourceState::Closed;
        self.queue.clear();
    }

    fn retry_delay(&self) -> Option<Duration> {
        self.retry
    }
}

/// Creates [`HttpEventSource`]s sharing one transport.
#[derive(Debug, Clone)]
pub struct HttpEventSourceFactory {
    options: HttpLinkOptions,
}

impl HttpEventSourceFactory {
    /// Factory over `options`.
    pub fn new(options: HttpLinkOptions) -> Self {
        Self { options }
    }
}

impl EventSourceFactory for HttpEventSourceFactory {
    fn create(&self, url: String) -> Box<dyn EventSourceLike> {
        Box::new(HttpEventSource::new(self.options.clone(), url))
    }
}
