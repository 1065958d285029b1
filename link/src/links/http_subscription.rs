//! Terminal link running subscriptions over server-sent events.

use super::chain::{Link, LinkObservable, Next};
use super::http::{build_url, HttpLinkOptions};
use crate::{
    error::EdenLinkError,
    models::{ConnectionState, LinkResult, Operation, OperationType},
    observable::{Observable, Teardown},
    sse::{ConsumerEvent, EventSourceFactory, HttpEventSourceFactory, SseOptions, SseStreamConsumer},
};
use std::fmt;
use std::sync::Arc;

/// Context key carrying the event id a subscription resumes from.
pub const LAST_EVENT_ID_KEY: &str = "lastEventId";

/// Subscriptions over `text/event-stream`.
///
/// Emits [`LinkResult::State`] transitions alongside the data: `Connecting`
/// while the stream (re)connects, `Pending` once the server sent
/// `connected`. Retryable server errors only move the state back to
/// `Connecting`; anything else ends the subscription.
#[derive(Clone)]
pub struct HttpSubscriptionLink {
    options: HttpLinkOptions,
    factory: Arc<dyn EventSourceFactory>,
    sse: SseOptions,
}

impl fmt::Debug for HttpSubscriptionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSubscriptionLink")
            .field("options", &self.options)
            .field("sse", &self.sse)
            .finish_non_exhaustive()
    }
}

impl HttpSubscriptionLink {
    /// Link streaming from the server of `options`.
    pub fn new(options: HttpLinkOptions) -> Self {
        Self {
            factory: Arc::new(HttpEventSourceFactory::new(options.clone())),
            options,
            sse: SseOptions::default(),
        }
    }

    /// Replace how event sources are created.
    pub fn event_source_factory(mut self, factory: Arc<dyn EventSourceFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Consumer settings.
    pub fn sse_options(mut self, options: SseOptions) -> Self {
        self.sse = options;
        self
    }

    fn consumer(&self, op: &Operation) -> SseStreamConsumer {
        let base_url = self.options.base_url.clone();
        let path = op.path.clone();
        let query = op.params.query.clone();
        let initial = op
            .context
            .get(LAST_EVENT_ID_KEY)
            .and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        SseStreamConsumer::new(
            move |last_event_id| {
                let mut query = query.clone();
                if let Some(id) = last_event_id {
                    query.insert(LAST_EVENT_ID_KEY.to_string(), id.to_string());
                }
                build_url(&base_url, &path, &query)
            },
            self.factory.clone(),
        )
        .last_event_id(initial)
        .options(self.sse.clone())
    }
}

impl Link for HttpSubscriptionLink {
    fn run(&self, op: Operation, _next: Next) -> LinkObservable {
        if op.kind != OperationType::Subscription {
            return Observable::error(EdenLinkError::ConfigurationError(
                "HttpSubscriptionLink only handles subscriptions - use HttpLink or HttpBatchLink"
                    .to_string(),
            ));
        }
        let link = self.clone();
        Observable::new(move |subscriber| {
            let signal = op
                .signal
                .as_ref()
                .map(|s| s.child_token())
                .unwrap_or_default();
            let mut consumer = link.consumer(&op).signal(signal.clone());
            let path = op.path.clone();
            let task = tokio::spawn(async move {
                let mut started = false;
                loop {
                    match consumer.next().await {
                        Ok(Some(ConsumerEvent::Connecting { error })) => {
                            subscriber.next(LinkResult::State(ConnectionState::Connecting { error }));
                        },
                        Ok(Some(ConsumerEvent::Connected { .. })) => {
                            if !started {
                                started = true;
                                subscriber.next(LinkResult::Started);
                            }
                            subscriber.next(LinkResult::State(ConnectionState::Pending));
                        },
                        Ok(Some(ConsumerEvent::Data { id, data })) => {
                            subscriber.next(LinkResult::Data {
                                data,
                                id,
                                response: None,
                            });
                        },
                        Ok(Some(ConsumerEvent::Ping)) => {},
                        Ok(Some(ConsumerEvent::Timeout { ms })) => {
                            subscriber.next(LinkResult::State(ConnectionState::Connecting {
                                error: Some(EdenLinkError::TimeoutError(format!(
                                    "No events received for {}ms",
                                    ms
                                ))),
                            }));
                        },
                        Ok(Some(ConsumerEvent::SerializedError(error))) if error.is_retryable() => {
                            log::warn!("[EDEN_SSE] Retryable error on {}: {}", path, error);
                            subscriber.next(LinkResult::State(ConnectionState::Connecting {
                                error: Some(error),
                            }));
                        },
                        Ok(Some(ConsumerEvent::SerializedError(error))) => {
                            subscriber.error(error);
                            break;
                        },
                        Ok(None) => {
                            subscriber.next(LinkResult::Stopped);
                            subscriber.complete();
                            break;
                        },
                        Err(error) => {
                            subscriber.error(error);
                            break;
                        },
                    }
                }
            });
            Teardown::new(move || {
                signal.cancel();
                task.abort();
            })
        })
    }
}
