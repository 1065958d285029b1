//! Main eden-link client.
//!
//! The client owns a link chain and turns calls into [`Operation`]s that
//! flow through it.

use crate::{
    error::{EdenLinkError, Result},
    links::chain::{create_chain, Link, LinkObservable},
    models::{
        ConnectionState, EdenResponse, FormValue, HttpMethod, LinkResult, Operation,
        OperationContext, OperationType, Payload, RequestParams,
    },
    observable::{first_value, operators::forward_to, Observable, Observer, Subscription, Teardown},
};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-call context and cancellation.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Initial operation context
    pub context: OperationContext,
    /// Aborts the call when cancelled
    pub signal: Option<CancellationToken>,
}

impl CallOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context entry.
    pub fn context(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.context.insert(key, value);
        self
    }

    /// Abort signal.
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

type StartedFn = Arc<dyn Fn() + Send + Sync>;
type DataFn = Arc<dyn Fn(EdenResponse) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(EdenLinkError) + Send + Sync>;
type StateFn = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Callbacks of a subscription.
#[derive(Clone, Default)]
pub struct SubscriptionObserver {
    on_started: Option<StartedFn>,
    on_data: Option<DataFn>,
    on_error: Option<ErrorFn>,
    on_stopped: Option<StartedFn>,
    on_complete: Option<StartedFn>,
    on_connection_state_change: Option<StateFn>,
}

impl fmt::Debug for SubscriptionObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionObserver")
            .field("on_started", &self.on_started.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_stopped", &self.on_stopped.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_connection_state_change", &self.on_connection_state_change.is_some())
            .finish()
    }
}

impl SubscriptionObserver {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Server acknowledged the subscription.
    pub fn on_started(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_started = Some(Arc::new(f));
        self
    }

    /// Event received.
    pub fn on_data(mut self, f: impl Fn(EdenResponse) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    /// Error event or fatal failure.
    pub fn on_error(mut self, f: impl Fn(EdenLinkError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Server stopped the subscription.
    pub fn on_stopped(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stopped = Some(Arc::new(f));
        self
    }

    /// Stream finished.
    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    /// Transport connection state changed.
    pub fn on_connection_state_change(
        mut self,
        f: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection_state_change = Some(Arc::new(f));
        self
    }

    fn into_observer(self) -> Observer<LinkResult, EdenLinkError> {
        let this = Arc::new(self);
        let (n, e, c) = (this.clone(), this.clone(), this);
        Observer::new()
            .on_next(move |result: LinkResult| match result {
                LinkResult::Started => {
                    if let Some(f) = &n.on_started {
                        f();
                    }
                },
                LinkResult::Stopped => {
                    if let Some(f) = &n.on_stopped {
                        f();
                    }
                },
                LinkResult::State(state) => {
                    if let Some(f) = &n.on_connection_state_change {
                        f(state);
                    }
                },
                payload => match payload.into_response() {
                    Ok(data) => {
                        if let Some(f) = &n.on_data {
                            f(data);
                        }
                    },
                    Err(err) => {
                        if let Some(f) = &n.on_error {
                            f(err);
                        }
                    },
                },
            })
            .on_error(move |err| {
                if let Some(f) = &e.on_error {
                    f(err);
                }
            })
            .on_complete(move || {
                if let Some(f) = &c.on_complete {
                    f();
                }
            })
    }
}

/// Typed RPC client over a link chain.
///
/// # Examples
///
/// ```rust,no_run
/// use eden_link::{EdenClient, HttpLink, HttpLinkOptions, RequestParams, CallOptions};
///
/// # async fn example() -> eden_link::Result<()> {
/// let http = HttpLink::new(HttpLinkOptions::builder("http://localhost:3000").build()?);
/// let client = EdenClient::builder().link(http).build()?;
///
/// let user = client.query("/users/1", RequestParams::get(), CallOptions::new()).await?;
/// println!("{}", user.data);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EdenClient {
    links: Arc<[Arc<dyn Link>]>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for EdenClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdenClient")
            .field("links", &self.links.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl EdenClient {
    /// Create a new builder for configuring the client
    pub fn builder() -> EdenClientBuilder {
        EdenClientBuilder::new()
    }

    /// Client over `links` without validation; calls fail with a
    /// configuration error when the list is empty.
    pub fn new(links: Vec<Arc<dyn Link>>) -> Self {
        Self {
            links: links.into(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn operation(
        &self,
        kind: OperationType,
        path: &str,
        params: RequestParams,
        options: CallOptions,
    ) -> Operation {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut op = Operation::new(id, kind, path, params).with_context(options.context);
        op.signal = options.signal;
        log::debug!("[eden-link] {} #{} {}", op.kind, op.id, op.path);
        op
    }

    fn ensure_links(&self) -> Result<()> {
        if self.links.is_empty() {
            return Err(EdenLinkError::ConfigurationError(
                "EdenClient has no links configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Raw result stream of a fresh operation. Nothing is sent until it is
    /// subscribed.
    pub fn request(
        &self,
        kind: OperationType,
        path: &str,
        params: RequestParams,
        options: CallOptions,
    ) -> LinkObservable {
        let op = self.operation(kind, path, params, options);
        create_chain(self.links.clone(), op)
    }

    async fn call(
        &self,
        kind: OperationType,
        path: &str,
        params: RequestParams,
        options: CallOptions,
    ) -> Result<EdenResponse> {
        self.ensure_links()?;
        let signal = options.signal.clone();
        let results = self
            .request(kind, path, params, options)
            .filter(LinkResult::is_payload);
        first_value(results, signal).await?.into_response()
    }

    /// Run a query and wait for the first result.
    ///
    /// HTTP error statuses reject with [`EdenLinkError::FetchStatusError`];
    /// an aborted signal rejects with [`EdenLinkError::Cancelled`].
    pub async fn query(
        &self,
        path: &str,
        params: RequestParams,
        options: CallOptions,
    ) -> Result<EdenResponse> {
        self.call(OperationType::Query, path, params, options).await
    }

    /// Run a mutation and wait for the first result.
    pub async fn mutation(
        &self,
        path: &str,
        params: RequestParams,
        options: CallOptions,
    ) -> Result<EdenResponse> {
        self.call(OperationType::Mutation, path, params, options).await
    }

    /// Start a subscription.
    pub fn subscription(
        &self,
        path: &str,
        params: RequestParams,
        observer: SubscriptionObserver,
    ) -> Result<Subscription> {
        self.subscription_with(path, params, CallOptions::new(), observer)
    }

    /// Start a subscription with context and an abort signal. Cancelling
    /// the signal is equivalent to `unsubscribe`.
    pub fn subscription_with(
        &self,
        path: &str,
        params: RequestParams,
        options: CallOptions,
        observer: SubscriptionObserver,
    ) -> Result<Subscription> {
        self.ensure_links()?;
        let signal = options.signal.clone();
        let chain = self.request(OperationType::Subscription, path, params, options);

        let Some(signal) = signal else {
            return Ok(chain.subscribe(observer.into_observer()));
        };
        let done = CancellationToken::new();
        let guarded = {
            let done = done.clone();
            Observable::new(move |subscriber| {
                let inner = chain.subscribe(forward_to(&subscriber));
                let done = done.clone();
                Teardown::new(move || {
                    inner.unsubscribe();
                    done.cancel();
                })
            })
        };
        let subscription = guarded.subscribe(observer.into_observer());
        let handle = subscription.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.cancelled() => handle.unsubscribe(),
                _ = done.cancelled() => {},
            }
        });
        Ok(subscription)
    }

    fn builder_for(&self, method: HttpMethod, path: &str) -> RequestBuilder {
        RequestBuilder {
            client: self.clone(),
            path: path.to_string(),
            params: RequestParams::new(method),
            options: CallOptions::new(),
        }
    }

    /// `GET path`
    pub fn get(&self, path: &str) -> RequestBuilder {
        self.builder_for(HttpMethod::Get, path)
    }

    /// `POST path`
    pub fn post(&self, path: &str) -> RequestBuilder {
        self.builder_for(HttpMethod::Post, path)
    }

    /// `PUT path`
    pub fn put(&self, path: &str) -> RequestBuilder {
        self.builder_for(HttpMethod::Put, path)
    }

    /// `PATCH path`
    pub fn patch(&self, path: &str) -> RequestBuilder {
        self.builder_for(HttpMethod::Patch, path)
    }

    /// `DELETE path`
    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.builder_for(HttpMethod::Delete, path)
    }
}

/// Fluent request construction: `client.get("/users").query("page", 2).send()`.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    client: EdenClient,
    path: String,
    params: RequestParams,
    options: CallOptions,
}

impl RequestBuilder {
    /// Query string parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params = self.params.query(key, value);
        self
    }

    /// Request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params = self.params.header(name, value);
        self
    }

    /// JSON body.
    pub fn json(mut self, value: JsonValue) -> Self {
        self.params = self.params.json(value);
        self
    }

    /// JSON body that may contain files.
    pub fn payload(mut self, payload: Payload) -> Self {
        self.params = self.params.payload(payload);
        self
    }

    /// Multipart form body.
    pub fn form(mut self, fields: Vec<(String, FormValue)>) -> Self {
        self.params = self.params.form(fields);
        self
    }

    /// Context entry visible to every link.
    pub fn context(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.options = self.options.context(key, value);
        self
    }

    /// Abort signal.
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.options = self.options.signal(signal);
        self
    }

    /// Send as a query (GET/HEAD/OPTIONS) or mutation (anything else).
    pub async fn send(self) -> Result<EdenResponse> {
        let kind = match self.params.method {
            HttpMethod::Get | HttpMethod::Head | HttpMethod::Options => OperationType::Query,
            _ => OperationType::Mutation,
        };
        self.client.call(kind, &self.path, self.params, self.options).await
    }

    /// Open as a subscription.
    pub fn subscribe(self, observer: SubscriptionObserver) -> Result<Subscription> {
        self.client
            .subscription_with(&self.path, self.params, self.options, observer)
    }
}

/// Builder for configuring [`EdenClient`] instances.
#[derive(Default)]
pub struct EdenClientBuilder {
    links: Vec<Arc<dyn Link>>,
}

impl EdenClientBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Append a link to the chain.
    pub fn link(mut self, link: impl Link) -> Self {
        self.links.push(Arc::new(link));
        self
    }

    /// Append already shared links.
    pub fn links(mut self, links: impl IntoIterator<Item = Arc<dyn Link>>) -> Self {
        self.links.extend(links);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<EdenClient> {
        if self.links.is_empty() {
            return Err(EdenLinkError::ConfigurationError(
                "at least one link is required".into(),
            ));
        }
        Ok(EdenClient::new(self.links))
    }
}
