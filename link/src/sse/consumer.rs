//! Resumable server-sent-events consumer.
//!
//! [`SseStreamConsumer`] owns one event source at a time and turns its raw
//! events into [`ConsumerEvent`]s. A dropped stream closes the source; after
//! the `retry:` delay a new one is created from a URL rebuilt with the last
//! tracked event id, so every reconnect resumes where the previous stream
//! stopped.

use super::event_source::{EventSourceFactory, EventSourceLike, SourceEvent, DEFAULT_RETRY_MS};
use crate::error::{EdenLinkError, Result};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Classified event yielded by [`SseStreamConsumer::next`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    /// A source was created, or recreated after `error`.
    Connecting {
        /// Why the previous connection failed
        error: Option<EdenLinkError>,
    },
    /// The server accepted the stream and sent its client options.
    Connected {
        /// `connected` payload
        options: JsonValue,
    },
    /// A data event. With `id` it is tracked and moves the resume cursor.
    Data {
        /// Event id
        id: Option<String>,
        /// Parsed payload
        data: JsonValue,
    },
    /// Keep-alive.
    Ping,
    /// The server pushed a structured error.
    SerializedError(EdenLinkError),
    /// Nothing arrived for `ms`; the source was recreated.
    Timeout {
        /// Inactivity window that elapsed
        ms: u64,
    },
}

/// Consumer settings.
#[derive(Debug, Clone, Default)]
pub struct SseOptions {
    reconnect_after_inactivity: Option<Duration>,
}

impl SseOptions {
    /// No inactivity timeout until the server announces one.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recreate the source when nothing arrives for `timeout`. A
    /// `reconnectAfterInactivityMs` in the `connected` payload overrides it.
    pub fn reconnect_after_inactivity(mut self, timeout: Duration) -> Self {
        self.reconnect_after_inactivity = Some(timeout);
        self
    }
}

type UrlFn = dyn Fn(Option<&str>) -> Result<String> + Send + Sync;

enum Step {
    Cancelled,
    Timeout(Duration),
    Event(Option<SourceEvent>),
}

/// Pull-based SSE consumer. Call [`next`](Self::next) until it yields
/// `Ok(None)` (cancelled) or `Err` (the source closed for good).
pub struct SseStreamConsumer {
    url: Arc<UrlFn>,
    factory: Arc<dyn EventSourceFactory>,
    source: Option<Box<dyn EventSourceLike>>,
    last_event_id: Option<String>,
    signal: CancellationToken,
    inactivity: Option<Duration>,
    retry: Duration,
    done: bool,
}

impl fmt::Debug for SseStreamConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseStreamConsumer")
            .field("last_event_id", &self.last_event_id)
            .field("inactivity", &self.inactivity)
            .field("retry", &self.retry)
            .field("has_source", &self.source.is_some())
            .field("done", &self.done)
            .finish()
    }
}

impl SseStreamConsumer {
    /// Consumer building its URL with `url(last_event_id)` and its sources
    /// with `factory`.
    pub fn new(
        url: impl Fn(Option<&str>) -> Result<String> + Send + Sync + 'static,
        factory: Arc<dyn EventSourceFactory>,
    ) -> Self {
        Self {
            url: Arc::new(url),
            factory,
            source: None,
            last_event_id: None,
            signal: CancellationToken::new(),
            inactivity: None,
            retry: Duration::from_millis(DEFAULT_RETRY_MS),
            done: false,
        }
    }

    /// Resume from `id`.
    pub fn last_event_id(mut self, id: Option<String>) -> Self {
        self.last_event_id = id;
        self
    }

    /// Stop when `signal` is cancelled.
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    /// Apply `options`.
    pub fn options(mut self, options: SseOptions) -> Self {
        self.inactivity = options.reconnect_after_inactivity;
        self
    }

    /// Cursor of the last tracked event.
    pub fn current_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Next classified event.
    pub async fn next(&mut self) -> Result<Option<ConsumerEvent>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.signal.is_cancelled() {
                self.shutdown();
                return Ok(None);
            }
            if self.source.is_none() {
                self.open_source()?;
                return Ok(Some(ConsumerEvent::Connecting { error: None }));
            }

            let step = {
                let Some(source) = self.source.as_mut() else {
                    continue;
                };
                let inactivity = self.inactivity;
                let idle = async move {
                    match inactivity {
                        Some(timeout) => tokio::time::sleep(timeout).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = self.signal.cancelled() => Step::Cancelled,
                    _ = idle => Step::Timeout(inactivity.unwrap_or_default()),
                    event = source.next_event() => Step::Event(event),
                }
            };

            match step {
                Step::Cancelled => {
                    self.shutdown();
                    return Ok(None);
                },
                Step::Timeout(timeout) => {
                    log::info!(
                        "[EDEN_SSE] No events for {:?}, recreating source (lastEventId={:?})",
                        timeout,
                        self.last_event_id
                    );
                    if let Some(mut source) = self.source.take() {
                        source.close();
                    }
                    return Ok(Some(ConsumerEvent::Timeout {
                        ms: timeout.as_millis() as u64,
                    }));
                },
                Step::Event(None) => {
                    self.shutdown();
                    return Err(EdenLinkError::TransportError("Event source closed".to_string()));
                },
                Step::Event(Some(SourceEvent::Open)) => continue,
                Step::Event(Some(SourceEvent::Error { closed: true, error })) => {
                    log::warn!("[EDEN_SSE] Event source closed: {}", error);
                    self.shutdown();
                    return Err(error);
                },
                Step::Event(Some(SourceEvent::Error { closed: false, error })) => {
                    if let Some(mut source) = self.source.take() {
                        if let Some(delay) = source.retry_delay() {
                            self.retry = delay;
                        }
                        source.close();
                    }
                    log::info!(
                        "[EDEN_SSE] Stream dropped ({}), reconnecting in {:?} (lastEventId={:?})",
                        error,
                        self.retry,
                        self.last_event_id
                    );
                    let cancelled = tokio::select! {
                        biased;
                        _ = self.signal.cancelled() => true,
                        _ = tokio::time::sleep(self.retry) => false,
                    };
                    if cancelled {
                        self.shutdown();
                        return Ok(None);
                    }
                    self.open_source()?;
                    return Ok(Some(ConsumerEvent::Connecting { error: Some(error) }));
                },
                Step::Event(Some(SourceEvent::Message(event))) => {
                    if let Some(ms) = event.retry {
                        self.retry = Duration::from_millis(ms);
                    }
                    match self.classify(event.event.as_str(), event.data, event.id) {
                        Ok(Some(event)) => return Ok(Some(event)),
                        Ok(None) => {},
                        Err(e) => {
                            log::warn!("[EDEN_SSE] Malformed event payload: {}", e);
                            self.shutdown();
                            return Err(e);
                        },
                    }
                },
            }
        }
    }

    fn open_source(&mut self) -> Result<()> {
        let url = match (self.url)(self.last_event_id.as_deref()) {
            Ok(url) => url,
            Err(e) => {
                self.done = true;
                return Err(e);
            },
        };
        log::debug!("[EDEN_SSE] Opening event source {}", url);
        self.source = Some(self.factory.create(url));
        Ok(())
    }

    fn classify(
        &mut self,
        name: &str,
        data: String,
        id: Option<String>,
    ) -> Result<Option<ConsumerEvent>> {
        let event = match name {
            "connected" => {
                let options: JsonValue = serde_json::from_str(&data).unwrap_or(JsonValue::Null);
                if let Some(ms) = options.get("reconnectAfterInactivityMs").and_then(|v| v.as_u64()) {
                    self.inactivity = Some(Duration::from_millis(ms));
                }
                ConsumerEvent::Connected { options }
            },
            "ping" => ConsumerEvent::Ping,
            "serialized-error" => {
                let payload: JsonValue = serde_json::from_str(&data)?;
                ConsumerEvent::SerializedError(EdenLinkError::from_server_payload(&payload))
            },
            "message" => {
                let data: JsonValue = serde_json::from_str(&data)?;
                if let Some(id) = &id {
                    self.last_event_id = Some(id.clone());
                }
                ConsumerEvent::Data { id, data }
            },
            other => {
                log::debug!("[EDEN_SSE] Ignoring event '{}'", other);
                return Ok(None);
            },
        };
        Ok(Some(event))
    }

    fn shutdown(&mut self) {
        self.done = true;
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }
}

impl Drop for SseStreamConsumer {
    fn drop(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::decoder::SseEvent;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted source; an exhausted script hangs until closed.
    struct ScriptedSource {
        events: VecDeque<SourceEvent>,
        closed: Arc<Mutex<usize>>,
    }

    #[async_trait::async_trait]
    impl EventSourceLike for ScriptedSource {
        async fn next_event(&mut self) -> Option<SourceEvent> {
            match self.events.pop_front() {
                Some(event) => Some(event),
                None => std::future::pending().await,
            }
        }

        fn close(&mut self) {
            *self.closed.lock() += 1;
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        scripts: Mutex<VecDeque<Vec<SourceEvent>>>,
        urls: Mutex<Vec<String>>,
        closed: Arc<Mutex<usize>>,
    }

    impl EventSourceFactory for ScriptedFactory {
        fn create(&self, url: String) -> Box<dyn EventSourceLike> {
            self.urls.lock().push(url);
            let events = self.scripts.lock().pop_front().unwrap_or_default();
            Box::new(ScriptedSource {
                events: events.into(),
                closed: self.closed.clone(),
            })
        }
    }

    fn message(name: &str, data: &str, id: Option<&str>) -> SourceEvent {
        SourceEvent::Message(SseEvent {
            event: name.to_string(),
            data: data.to_string(),
            id: id.map(str::to_string),
            retry: None,
        })
    }

    fn url_fn(id: Option<&str>) -> Result<String> {
        Ok(match id {
            Some(id) => format!("http://h/feed?lastEventId={}", id),
            None => "http://h/feed".to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_recreates_source_with_cursor() {
        let factory = Arc::new(ScriptedFactory::default());
        factory.scripts.lock().push_back(vec![
            SourceEvent::Open,
            message("connected", r#"{"reconnectAfterInactivityMs":500}"#, None),
            message("message", "0", Some("0")),
            message("ping", "", None),
            message("message", "1", Some("1")),
            message("message", "2", Some("2")),
        ]);
        factory.scripts.lock().push_back(vec![SourceEvent::Open, message("message", "3", Some("3"))]);

        let mut consumer = SseStreamConsumer::new(url_fn, factory.clone());
        assert_eq!(consumer.next().await.unwrap(), Some(ConsumerEvent::Connecting { error: None }));
        assert!(matches!(consumer.next().await.unwrap(), Some(ConsumerEvent::Connected { .. })));
        for expected in 0..3 {
            match consumer.next().await.unwrap() {
                Some(ConsumerEvent::Data { data, .. }) => assert_eq!(data, JsonValue::from(expected)),
                Some(ConsumerEvent::Ping) => match consumer.next().await.unwrap() {
                    Some(ConsumerEvent::Data { data, .. }) => assert_eq!(data, JsonValue::from(expected)),
                    other => panic!("unexpected {:?}", other),
                },
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(consumer.next().await.unwrap(), Some(ConsumerEvent::Timeout { ms: 500 }));
        assert_eq!(*factory.closed.lock(), 1);
        assert_eq!(consumer.next().await.unwrap(), Some(ConsumerEvent::Connecting { error: None }));
        assert_eq!(
            consumer.next().await.unwrap(),
            Some(ConsumerEvent::Data {
                id: Some("3".to_string()),
                data: JsonValue::from(3)
            })
        );
        assert_eq!(factory.urls.lock()[1], "http://h/feed?lastEventId=2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_reconnects_through_url() {
        let factory = Arc::new(ScriptedFactory::default());
        factory.scripts.lock().push_back(vec![
            SourceEvent::Open,
            SourceEvent::Message(SseEvent {
                event: "message".to_string(),
                data: "1".to_string(),
                id: Some("1".to_string()),
                retry: Some(250),
            }),
            message("message", "2", Some("2")),
            SourceEvent::Error {
                closed: false,
                error: EdenLinkError::TransportError("Event stream ended".into()),
            },
        ]);
        factory.scripts.lock().push_back(vec![SourceEvent::Open, message("message", "3", Some("3"))]);

        let mut consumer = SseStreamConsumer::new(url_fn, factory.clone());
        consumer.next().await.unwrap();
        consumer.next().await.unwrap();
        consumer.next().await.unwrap();

        let started = tokio::time::Instant::now();
        assert!(matches!(
            consumer.next().await.unwrap(),
            Some(ConsumerEvent::Connecting { error: Some(EdenLinkError::TransportError(_)) })
        ));
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(*factory.closed.lock(), 1);
        assert_eq!(
            *factory.urls.lock(),
            vec!["http://h/feed".to_string(), "http://h/feed?lastEventId=2".to_string()]
        );
        assert!(matches!(consumer.next().await.unwrap(), Some(ConsumerEvent::Data { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_error_ends_the_stream() {
        let factory = Arc::new(ScriptedFactory::default());
        factory.scripts.lock().push_back(vec![SourceEvent::Error {
            closed: false,
            error: EdenLinkError::TransportError("reset".into()),
        }]);
        factory.scripts.lock().push_back(vec![SourceEvent::Error {
            closed: true,
            error: EdenLinkError::FetchStatusError {
                status: 401,
                value: JsonValue::Null,
            },
        }]);
        let mut consumer = SseStreamConsumer::new(url_fn, factory.clone());
        consumer.next().await.unwrap();
        assert!(matches!(
            consumer.next().await.unwrap(),
            Some(ConsumerEvent::Connecting { error: Some(_) })
        ));
        assert_eq!(consumer.next().await.unwrap_err().status(), Some(401));
        assert_eq!(consumer.next().await.unwrap(), None);
        assert_eq!(*factory.closed.lock(), 2);
    }

    #[tokio::test]
    async fn test_malformed_payload_closes_source() {
        let factory = Arc::new(ScriptedFactory::default());
        factory
            .scripts
            .lock()
            .push_back(vec![SourceEvent::Open, message("message", "{not json", Some("1"))]);
        let mut consumer = SseStreamConsumer::new(url_fn, factory.clone());
        consumer.next().await.unwrap();
        assert!(matches!(
            consumer.next().await.unwrap_err(),
            EdenLinkError::SerializationError(_)
        ));
        assert_eq!(*factory.closed.lock(), 1);
        assert_eq!(consumer.current_event_id(), None);
        assert_eq!(consumer.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_closes_source() {
        let factory = Arc::new(ScriptedFactory::default());
        factory.scripts.lock().push_back(vec![
            SourceEvent::Open,
            message("serialized-error", r#"{"code":"BAD_GATEWAY","message":"upstream"}"#, None),
        ]);
        let signal = CancellationToken::new();
        let mut consumer = SseStreamConsumer::new(url_fn, factory.clone()).signal(signal.clone());
        consumer.next().await.unwrap();
        match consumer.next().await.unwrap() {
            Some(ConsumerEvent::SerializedError(e)) => assert!(e.is_retryable()),
            other => panic!("unexpected {:?}", other),
        }
        signal.cancel();
        assert_eq!(consumer.next().await.unwrap(), None);
        assert_eq!(*factory.closed.lock(), 1);
    }
}
