//! Multiplexing WebSocket client.
//!
//! Requests registered in the same scheduler tick are written as one frame.
//! When the socket drops, pending requests are kept and replayed verbatim
//! on the next socket; the reconnect loop backs off exponentially. In lazy
//! mode the socket is opened by the first request and closed again after
//! `lazy_close_timeout` without traffic.

use super::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionEventSender, ConnectionParams, UrlSource,
    WebSocketConnection,
};
use super::request_manager::{AbortHandle, RequestCallbacks, RequestManager};
use crate::{
    auth::{AuthProvider, DynamicAuthProvider, ResolvedAuth},
    error::{EdenLinkError, Result},
    event_handlers::{ConnectionError, DisconnectReason, EventHandlers},
    models::{
        decode_server_frame, encode_client_frame, ClientEnvelope, ConnectionOptions,
        ConnectionState, LinkResult, ServerEnvelope, ServerResult,
    },
    observable::{BehaviorSubject, Observable},
    timeouts::EdenLinkTimeouts,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type RetryDelayFn = Arc<dyn Fn(u32) -> u64 + Send + Sync>;

/// Configuration of a [`WebSocketClient`].
#[derive(Clone)]
pub struct WebSocketClientOptions {
    url: UrlSource,
    connection_params: Option<ConnectionParams>,
    auth: ResolvedAuth,
    timeouts: EdenLinkTimeouts,
    connection: ConnectionOptions,
    retry_delay: Option<RetryDelayFn>,
    event_handlers: EventHandlers,
}

impl fmt::Debug for WebSocketClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketClientOptions")
            .field("url", &self.url)
            .field("connection_params", &self.connection_params)
            .field("auth", &self.auth)
            .field("timeouts", &self.timeouts)
            .field("connection", &self.connection)
            .field("retry_delay", &self.retry_delay.is_some())
            .field("event_handlers", &self.event_handlers)
            .finish()
    }
}

impl WebSocketClientOptions {
    /// Options for `url` (fixed string or [`UrlSource::dynamic`]).
    pub fn new(url: impl Into<UrlSource>) -> Self {
        Self {
            url: url.into(),
            connection_params: None,
            auth: ResolvedAuth::None,
            timeouts: EdenLinkTimeouts::default(),
            connection: ConnectionOptions::default(),
            retry_delay: None,
            event_handlers: EventHandlers::default(),
        }
    }

    /// Payload of the `connection-params` message sent after every open.
    pub fn connection_params(mut self, params: ConnectionParams) -> Self {
        self.connection_params = Some(params);
        self
    }

    /// Static credentials sent on the handshake.
    pub fn auth(mut self, auth: AuthProvider) -> Self {
        self.auth = ResolvedAuth::Static(auth);
        self
    }

    /// Credentials resolved before every connect.
    pub fn dynamic_auth(mut self, provider: Arc<dyn DynamicAuthProvider>) -> Self {
        self.auth = ResolvedAuth::Dynamic(provider);
        self
    }

    /// Handshake, keep-alive and lazy-close timeouts.
    pub fn timeouts(mut self, timeouts: EdenLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Reconnect and lazy-mode settings.
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }

    /// Shorthand for `connection_options(..with_lazy(lazy))`.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.connection.lazy = lazy;
        self
    }

    /// Custom reconnect delay in ms for attempt `n` (0-based).
    pub fn retry_delay_ms(mut self, f: impl Fn(u32) -> u64 + Send + Sync + 'static) -> Self {
        self.retry_delay = Some(Arc::new(f));
        self
    }

    /// Lifecycle hooks.
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    fn delay_ms(&self, attempt: u32) -> u64 {
        match &self.retry_delay {
            Some(f) => f(attempt),
            None => self.connection.retry_delay_ms(attempt),
        }
    }
}

struct ClientInner {
    options: WebSocketClientOptions,
    requests: RequestManager,
    state: BehaviorSubject<ConnectionState, EdenLinkError>,
    active: Mutex<Option<WebSocketConnection>>,
    /// Connection for which `on_connect` already fired.
    announced: AtomicU64,
    next_connection_id: AtomicU64,
    events: ConnectionEventSender,
    reconnecting: Mutex<Option<JoinHandle<()>>>,
    flush_scheduled: AtomicBool,
    lazy_timer: Mutex<Option<JoinHandle<()>>>,
    /// Set by `close()`, cleared by the next request.
    closed: AtomicBool,
}

/// WebSocket client multiplexing requests and subscriptions over one
/// socket. Cheap to clone. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct WebSocketClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("state", &self.inner.state.get())
            .field("requests", &self.inner.requests)
            .finish()
    }
}

impl WebSocketClient {
    /// Create the client. Unless lazy, the socket starts opening right away.
    pub fn new(options: WebSocketClientOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let lazy = options.connection.lazy;
        let inner = Arc::new(ClientInner {
            options,
            requests: RequestManager::new(),
            state: BehaviorSubject::new(if lazy {
                ConnectionState::Idle
            } else {
                ConnectionState::connecting()
            }),
            active: Mutex::new(None),
            announced: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(0),
            events: tx,
            reconnecting: Mutex::new(None),
            flush_scheduled: AtomicBool::new(false),
            lazy_timer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(event_loop(Arc::downgrade(&inner), rx));
        if !lazy {
            let eager = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = eager.open_active().await {
                    log::warn!("[EDEN_WS] Initial connection failed: {}", e);
                }
            });
        }
        Self { inner }
    }

    /// Open the socket now (also in lazy mode).
    pub async fn open(&self) -> Result<()> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.open_active().await.map(|_| ())
    }

    /// Track `message` and flush it with everything else registered in the
    /// same tick.
    pub fn request(&self, message: ClientEnvelope, callbacks: RequestCallbacks) -> Result<AbortHandle> {
        let id = message.id.ok_or_else(|| {
            EdenLinkError::ConfigurationError("WebSocket requests need an id".to_string())
        })?;
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.cancel_lazy_close();
        let handle = self.inner.requests.register(id, message, callbacks);
        self.inner.schedule_flush();
        Ok(handle)
    }

    /// Give up on a request: unsent requests are dropped, subscriptions
    /// are stopped on the server, answers to sent requests are discarded.
    pub fn release(&self, handle: &AbortHandle) {
        let inner = &self.inner;
        if !handle.abort() {
            if let Some(request) = inner.requests.get_request(handle.id()) {
                if request.is_subscription() {
                    inner.requests.delete(handle.id());
                    inner.send_now(vec![ClientEnvelope::stop(handle.id())]);
                }
            }
        }
        inner.schedule_lazy_close();
    }

    /// Close the client.
    ///
    /// Unsent requests fail with [`EdenLinkError::WebSocketClosedError`],
    /// subscriptions complete, and in-flight queries are awaited before the
    /// socket closes. The next request reopens.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        inner.cancel_lazy_close();
        if let Some(reconnect) = inner.reconnecting.lock().take() {
            reconnect.abort();
        }

        let not_sent =
            EdenLinkError::WebSocketClosedError("Closed before connection was established".into());
        for request in inner.requests.take_outgoing() {
            request.callbacks.emit_error(not_sent.clone());
        }
        for request in inner.requests.take_pending_where(ClientEnvelope::is_subscription) {
            request.callbacks.emit_complete();
        }

        let open = inner.active.lock().as_ref().is_some_and(|c| c.is_open());
        if open {
            futures_util::future::join_all(inner.requests.pending_ends()).await;
        } else {
            inner.fail_pending(&EdenLinkError::WebSocketClosedError("Connection closed".into()));
        }

        let conn = inner.active.lock().take();
        if let Some(conn) = conn {
            conn.close().await;
            inner
                .options
                .event_handlers
                .emit_disconnect(DisconnectReason::with_code("Closed by client", 1000));
        }
        inner.state.next(ConnectionState::Idle);
    }

    /// Connection state stream (replays the current state).
    pub fn connection_state(&self) -> Observable<ConnectionState, EdenLinkError> {
        self.inner.state.observable()
    }

    /// Current connection state.
    pub fn get_connection_state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Active socket, if any.
    pub fn connection(&self) -> Option<WebSocketConnection> {
        self.inner.active.lock().clone()
    }

    /// Request bookkeeping (read-only use).
    pub fn requests(&self) -> &RequestManager {
        &self.inner.requests
    }
}

async fn event_loop(
    inner: Weak<ClientInner>,
    mut rx: mpsc::UnboundedReceiver<(u64, ConnectionEvent)>,
) {
    while let Some((connection_id, event)) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            ConnectionEvent::Message(text) => inner.handle_message(connection_id, &text),
            ConnectionEvent::Closed(reason) => inner.handle_closed(connection_id, reason),
        }
    }
}

impl ClientInner {
    fn is_active(&self, connection_id: u64) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|c| c.id() == connection_id)
    }

    /// Active connection, replacing a closed one.
    fn current_connection(&self) -> WebSocketConnection {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some(conn) if !conn.is_closed() => conn.clone(),
            _ => {
                let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
                let config = ConnectionConfig {
                    url: self.options.url.clone(),
                    connection_params: self.options.connection_params.clone(),
                    timeouts: self.options.timeouts.clone(),
                    auth: self.options.auth.clone(),
                    event_handlers: self.options.event_handlers.clone(),
                };
                let conn = WebSocketConnection::new(id, config, self.events.clone());
                *active = Some(conn.clone());
                conn
            },
        }
    }

    async fn open_active(self: &Arc<Self>) -> Result<WebSocketConnection> {
        let conn = self.current_connection();
        if conn.is_open() {
            return Ok(conn);
        }
        if self.state.get() == ConnectionState::Idle {
            self.state.next(ConnectionState::connecting());
        }
        match conn.open().await {
            Ok(()) => {
                self.on_open(&conn);
                Ok(conn)
            },
            Err(e) => {
                self.fail_outgoing(&e);
                self.reconnect(e.clone());
                Err(e)
            },
        }
    }

    fn on_open(&self, conn: &WebSocketConnection) {
        if self.announced.swap(conn.id(), Ordering::SeqCst) == conn.id() {
            return;
        }
        log::info!("[EDEN_WS] Connected (connection #{})", conn.id());
        self.state.next(ConnectionState::Pending);
        self.options.event_handlers.emit_connect();
    }

    fn schedule_flush(self: &Arc<Self>) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.clone();
        let window = self.options.timeouts.batch_window;
        tokio::spawn(async move {
            // Let every request of the current window register first.
            tokio::task::yield_now().await;
            if !window.is_zero() {
                tokio::time::sleep(window).await;
            }
            inner.batch_send().await;
        });
    }

    async fn batch_send(self: Arc<Self>) {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        if self.reconnecting.lock().is_some() {
            // The reconnect loop flushes once a socket is up.
            return;
        }
        if !self.requests.has_outgoing_requests() {
            self.schedule_lazy_close();
            return;
        }
        let Ok(conn) = self.open_active().await else {
            return;
        };
        self.send_messages(&conn, self.requests.flush());
        self.schedule_lazy_close();
    }

    fn send_messages(&self, conn: &WebSocketConnection, messages: Vec<ClientEnvelope>) {
        if messages.is_empty() {
            return;
        }
        match encode_client_frame(&messages) {
            Ok(frame) => {
                self.options.event_handlers.emit_send(&frame);
                log::debug!("[EDEN_WS] Sending {} message(s) on #{}", messages.len(), conn.id());
                if let Err(e) = conn.send(frame) {
                    log::warn!("[EDEN_WS] Send failed, messages will be replayed: {}", e);
                }
            },
            Err(e) => {
                for id in messages.iter().filter_map(|m| m.id) {
                    if let Some(request) = self.requests.delete(id) {
                        request.callbacks.emit_error(e.clone());
                    }
                }
            },
        }
    }

    /// Send on the active socket if it is open; dropped otherwise.
    fn send_now(&self, messages: Vec<ClientEnvelope>) {
        let conn = self.active.lock().clone();
        if let Some(conn) = conn.filter(WebSocketConnection::is_open) {
            self.send_messages(&conn, messages);
        }
    }

    fn fail_outgoing(&self, error: &EdenLinkError) {
        for request in self.requests.take_outgoing() {
            request.callbacks.emit_error(error.clone());
        }
    }

    fn fail_pending(&self, error: &EdenLinkError) {
        for request in self.requests.take_pending_where(|_| true) {
            request.callbacks.emit_error(error.clone());
        }
    }

    /// Start the reconnect loop unless it is already running.
    fn reconnect(self: &Arc<Self>, error: EdenLinkError) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.state.next(ConnectionState::Connecting { error: Some(error) });
        let mut slot = self.reconnecting.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(tokio::spawn(self.clone().reconnect_loop()));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let handlers = &self.options.event_handlers;
        let mut attempt: u32 = 0;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            if let Some(max) = self.options.connection.max_reconnect_attempts {
                if attempt >= max {
                    let error = EdenLinkError::WebSocketClosedError(format!(
                        "Giving up after {} reconnect attempts",
                        attempt
                    ));
                    log::warn!("[EDEN_WS] {}", error);
                    handlers.emit_error(ConnectionError::new(error.to_string(), false));
                    self.fail_outgoing(&error);
                    self.fail_pending(&error);
                    self.state.next(ConnectionState::Connecting { error: Some(error) });
                    break;
                }
            }

            let delay_ms = self.options.delay_ms(attempt);
            handlers.emit_reconnect_attempt(attempt, delay_ms);
            log::debug!("[EDEN_WS] Reconnect attempt {} in {}ms", attempt, delay_ms);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            if self.options.connection.lazy && self.requests.is_idle() {
                self.active.lock().take();
                self.state.next(ConnectionState::Idle);
                break;
            }

            let previous = self.active.lock().take();
            if let Some(previous) = previous {
                previous.close().await;
            }
            let conn = self.current_connection();
            match conn.open().await {
                Ok(()) => {
                    self.on_open(&conn);
                    let mut messages = self.requests.get_pending_requests();
                    let replayed = messages.len();
                    messages.extend(self.requests.flush());
                    log::info!(
                        "[EDEN_WS] Reconnected, replaying {} pending request(s)",
                        replayed
                    );
                    self.send_messages(&conn, messages);
                    break;
                },
                Err(e) => {
                    log::warn!("[EDEN_WS] Reconnect attempt {} failed: {}", attempt, e);
                    self.state.next(ConnectionState::Connecting { error: Some(e.clone()) });
                    self.fail_outgoing(&e);
                    attempt = attempt.saturating_add(1);
                },
            }
        }
        self.reconnecting.lock().take();
        if self.requests.has_outgoing_requests() {
            self.schedule_flush();
        }
    }

    fn handle_closed(self: &Arc<Self>, connection_id: u64, reason: DisconnectReason) {
        if !self.is_active(connection_id) {
            return;
        }
        log::debug!("[EDEN_WS] Connection #{} lost: {}", connection_id, reason);
        self.options.event_handlers.emit_disconnect(reason.clone());
        if self.closed.load(Ordering::SeqCst) {
            self.fail_pending(&EdenLinkError::WebSocketClosedError(reason.to_string()));
            return;
        }
        let error = EdenLinkError::WebSocketClosedError(reason.to_string());
        if !self.options.connection.auto_reconnect {
            self.active.lock().take();
            self.fail_outgoing(&error);
            self.fail_pending(&error);
            self.state.next(ConnectionState::Connecting { error: Some(error) });
            return;
        }
        if self.options.connection.lazy && self.requests.is_idle() {
            self.active.lock().take();
            self.state.next(ConnectionState::Idle);
            return;
        }
        self.reconnect(error);
    }

    fn handle_message(self: &Arc<Self>, connection_id: u64, text: &str) {
        if !self.is_active(connection_id) {
            return;
        }
        self.options.event_handlers.emit_receive(text);
        match decode_server_frame(text) {
            Ok(envelopes) => {
                for envelope in envelopes {
                    self.handle_envelope(envelope);
                }
            },
            Err(e) => log::warn!("[EDEN_WS] Failed to parse server message: {}", e),
        }
    }

    fn handle_envelope(self: &Arc<Self>, envelope: ServerEnvelope) {
        if envelope.is_reconnect() {
            log::info!("[EDEN_WS] Server requested reconnect");
            self.reconnect(EdenLinkError::WebSocketClosedError(
                "Server requested reconnect".to_string(),
            ));
            return;
        }
        let Some(id) = envelope.id else {
            log::debug!("[EDEN_WS] Ignoring message without id");
            return;
        };
        let Some(request) = self.requests.get_request(id) else {
            log::debug!("[EDEN_WS] Ignoring message for unknown request {}", id);
            return;
        };
        let callbacks = request.callbacks;

        if let Some(error) = envelope.error {
            self.requests.delete(id);
            callbacks.emit_error(EdenLinkError::from_server_payload(&error));
            self.schedule_lazy_close();
            return;
        }
        match envelope.result {
            Some(ServerResult::Started) => callbacks.emit_next(LinkResult::Started),
            Some(ServerResult::Stopped) => {
                self.requests.delete(id);
                callbacks.emit_next(LinkResult::Stopped);
                callbacks.emit_complete();
            },
            Some(ServerResult::Data { data, id: event_id }) => {
                if request.message.is_subscription() {
                    if let Some(event_id) = &event_id {
                        self.requests.set_last_event_id(id, event_id);
                    }
                    callbacks.emit_next(LinkResult::Data {
                        data,
                        id: event_id,
                        response: None,
                    });
                } else {
                    self.requests.delete(id);
                    callbacks.emit_next(LinkResult::Data {
                        data,
                        id: event_id,
                        response: None,
                    });
                    callbacks.emit_complete();
                }
            },
            Some(ServerResult::Reconnect) | None => {},
        }
        self.schedule_lazy_close();
    }

    fn cancel_lazy_close(&self) {
        if let Some(timer) = self.lazy_timer.lock().take() {
            timer.abort();
        }
    }

    /// In lazy mode, close the socket once nothing is in flight for
    /// `lazy_close_timeout`.
    fn schedule_lazy_close(self: &Arc<Self>) {
        if !self.options.connection.lazy {
            return;
        }
        let mut timer = self.lazy_timer.lock();
        if let Some(t) = timer.take() {
            t.abort();
        }
        if !self.requests.is_idle() || self.active.lock().is_none() {
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = self.options.timeouts.lazy_close_timeout;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.requests.is_idle() {
                return;
            }
            let conn = inner.active.lock().take();
            if let Some(conn) = conn {
                log::debug!("[EDEN_WS] Closing idle connection #{}", conn.id());
                conn.close().await;
                inner
                    .options
                    .event_handlers
                    .emit_disconnect(DisconnectReason::with_code("Closed after inactivity", 1000));
                inner.state.next(ConnectionState::Idle);
            }
        }));
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(conn) = self.active.get_mut().take() {
            conn.shutdown();
        }
        if let Some(timer) = self.lazy_timer.get_mut().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Operation, OperationType, RequestParams};
    use crate::observable::Observer;

    #[tokio::test]
    async fn test_lazy_client_starts_idle_without_socket() {
        let client = WebSocketClient::new(WebSocketClientOptions::new("ws://127.0.0.1:1/ws").lazy(true));
        tokio::task::yield_now().await;
        assert_eq!(client.get_connection_state(), ConnectionState::Idle);
        assert!(client.connection().is_none());
    }

    #[tokio::test]
    async fn test_request_without_id_is_rejected() {
        let client = WebSocketClient::new(WebSocketClientOptions::new("ws://127.0.0.1:1/ws").lazy(true));
        let err = client
            .request(ClientEnvelope::connection_params(serde_json::json!({})), Observer::new())
            .unwrap_err();
        assert!(matches!(err, EdenLinkError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_unsent_request_fails_when_open_fails() {
        let client = WebSocketClient::new(
            WebSocketClientOptions::new("ws://127.0.0.1:1/ws")
                .lazy(true)
                .retry_delay_ms(|_| 60_000),
        );
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let op = Operation::new(1, OperationType::Query, "/x", RequestParams::get());
        client
            .request(
                ClientEnvelope::request(&op).unwrap(),
                Observer::new().on_error(move |e| {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(e);
                    }
                }),
            )
            .unwrap();
        let err = rx.await.unwrap();
        assert!(matches!(err, EdenLinkError::WebSocketClosedError(_)));
        assert!(client.get_connection_state().is_connecting());
        client.close().await;
        assert_eq!(client.get_connection_state(), ConnectionState::Idle);
    }

    #[test]
    fn test_custom_retry_delay() {
        let options = WebSocketClientOptions::new("ws://h/ws").retry_delay_ms(|n| u64::from(n) * 10);
        assert_eq!(options.delay_ms(3), 30);
        let options = WebSocketClientOptions::new("ws://h/ws");
        assert_eq!(options.delay_ms(1), 2000);
    }
}
