//! One WebSocket connection.
//!
//! The socket is owned by a background task. [`WebSocketConnection::open`]
//! is single-flight: concurrent callers share one handshake. Inbound
//! messages and the final close are reported on the event channel given at
//! construction, tagged with the connection id so that a client can ignore
//! events from sockets it already replaced.

use super::{FAR_FUTURE, MAX_WS_TEXT_MESSAGE_BYTES};
use crate::{
    auth::{AuthProvider, ResolvedAuth},
    compression::decode_binary_frame,
    error::{EdenLinkError, Result},
    event_handlers::{ConnectionError, DisconnectReason, EventHandlers},
    models::{encode_client_frame, ClientEnvelope},
    timeouts::EdenLinkTimeouts,
};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream as TungsteniteStream};

pub(crate) type WebSocketStream = TungsteniteStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Text keep-alive probe.
pub const PING_MESSAGE: &str = "PING";
/// Answer to [`PING_MESSAGE`].
pub const PONG_MESSAGE: &str = "PONG";

type UrlFn = Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;
type ParamsFn = Arc<dyn Fn() -> BoxFuture<'static, Result<JsonValue>> + Send + Sync>;

/// Where the socket URL comes from. Dynamic URLs are resolved before every
/// connect.
#[derive(Clone)]
pub enum UrlSource {
    /// Fixed URL
    Fixed(String),
    /// Resolved per connect
    Dynamic(UrlFn),
}

impl UrlSource {
    /// URL computed by an async closure.
    pub fn dynamic<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        Self::Dynamic(Arc::new(move || f().boxed()))
    }

    async fn resolve(&self) -> Result<String> {
        match self {
            Self::Fixed(url) => Ok(url.clone()),
            Self::Dynamic(f) => f().await,
        }
    }
}

impl fmt::Debug for UrlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(url) => write!(f, "UrlSource::Fixed({})", url),
            Self::Dynamic(_) => write!(f, "UrlSource::Dynamic(<fn>)"),
        }
    }
}

impl From<&str> for UrlSource {
    fn from(url: &str) -> Self {
        Self::Fixed(url.to_string())
    }
}

impl From<String> for UrlSource {
    fn from(url: String) -> Self {
        Self::Fixed(url)
    }
}

/// Payload of the `connection-params` message sent right after open.
#[derive(Clone)]
pub enum ConnectionParams {
    /// Fixed payload
    Static(JsonValue),
    /// Resolved per connect
    Dynamic(ParamsFn),
}

impl ConnectionParams {
    /// Payload computed by an async closure.
    pub fn dynamic<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue>> + Send + 'static,
    {
        Self::Dynamic(Arc::new(move || f().boxed()))
    }

    async fn resolve(&self) -> Result<JsonValue> {
        match self {
            Self::Static(value) => Ok(value.clone()),
            Self::Dynamic(f) => f().await,
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(v) => write!(f, "ConnectionParams::Static({})", v),
            Self::Dynamic(_) => write!(f, "ConnectionParams::Dynamic(<fn>)"),
        }
    }
}

/// Settings of a single socket.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Socket URL (`http(s)` is rewritten to `ws(s)`)
    pub url: UrlSource,
    /// Sent as the first message after open
    pub connection_params: Option<ConnectionParams>,
    /// Handshake and keep-alive timeouts
    pub timeouts: EdenLinkTimeouts,
    /// Credentials sent as handshake headers
    pub auth: ResolvedAuth,
    /// Connection error hook
    pub event_handlers: EventHandlers,
}

impl ConnectionConfig {
    /// Config with default timeouts and no credentials.
    pub fn new(url: impl Into<UrlSource>) -> Self {
        Self {
            url: url.into(),
            connection_params: None,
            timeouts: EdenLinkTimeouts::default(),
            auth: ResolvedAuth::None,
            event_handlers: EventHandlers::default(),
        }
    }
}

/// Socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Never opened
    Idle,
    /// Handshake in progress
    Connecting,
    /// Ready to send
    Open,
    /// Close requested
    Closing,
    /// Closed or failed
    Closed,
}

/// Event reported by the socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Inbound text (binary frames are decoded first; keep-alive frames are
    /// not reported).
    Message(String),
    /// The socket is gone. Sent once per successful open.
    Closed(DisconnectReason),
}

/// `(connection id, event)`
pub type ConnectionEventSender = mpsc::UnboundedSender<(u64, ConnectionEvent)>;

enum Outbound {
    Text(String),
    Close(oneshot::Sender<()>),
}

type OpenFuture = Shared<BoxFuture<'static, Result<()>>>;

struct ConnectionInner {
    id: u64,
    config: ConnectionConfig,
    events: ConnectionEventSender,
    state: Mutex<SocketState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    opening: Mutex<Option<OpenFuture>>,
}

/// Handle to one WebSocket. Cheap to clone.
#[derive(Clone)]
pub struct WebSocketConnection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl WebSocketConnection {
    /// Unopened connection reporting to `events`.
    pub fn new(id: u64, config: ConnectionConfig, events: ConnectionEventSender) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                config,
                events,
                state: Mutex::new(SocketState::Idle),
                outbound: Mutex::new(None),
                opening: Mutex::new(None),
            }),
        }
    }

    /// Id used to tag events.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        *self.inner.state.lock()
    }

    /// Whether frames can be sent.
    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Whether the socket is closing or closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SocketState::Closing | SocketState::Closed)
    }

    /// Open the socket. Concurrent calls share one attempt; calling it on
    /// an open socket is a no-op.
    pub async fn open(&self) -> Result<()> {
        let attempt = {
            let mut opening = self.inner.opening.lock();
            match opening.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    if self.is_open() {
                        return Ok(());
                    }
                    let attempt = self.inner.clone().connect().boxed().shared();
                    *opening = Some(attempt.clone());
                    attempt
                },
            }
        };
        attempt.await
    }

    /// Queue a text frame.
    pub fn send(&self, text: String) -> Result<()> {
        let outbound = self.inner.outbound.lock();
        match outbound.as_ref() {
            Some(tx) if self.is_open() => tx
                .send(Outbound::Text(text))
                .map_err(|_| EdenLinkError::WebSocketClosedError("Socket task has stopped".into())),
            _ => Err(EdenLinkError::WebSocketClosedError("Socket is not open".into())),
        }
    }

    /// Close the socket. An in-flight open is awaited first.
    pub async fn close(&self) {
        let pending = self.inner.opening.lock().clone();
        if let Some(attempt) = pending {
            let _ = attempt.await;
        }
        let outbound = self.inner.outbound.lock().take();
        if let Some(tx) = outbound {
            *self.inner.state.lock() = SocketState::Closing;
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(Outbound::Close(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
        *self.inner.state.lock() = SocketState::Closed;
    }

    /// Drop the outbound queue without waiting; the socket task closes
    /// the socket on its own.
    pub(crate) fn shutdown(&self) {
        if self.inner.outbound.lock().take().is_some() {
            *self.inner.state.lock() = SocketState::Closing;
        }
    }
}

impl ConnectionInner {
    async fn connect(self: Arc<Self>) -> Result<()> {
        *self.state.lock() = SocketState::Connecting;
        let result = self.establish().await;
        match result {
            Ok(ws) => {
                let (tx, rx) = mpsc::unbounded_channel();
                *self.outbound.lock() = Some(tx);
                *self.state.lock() = SocketState::Open;
                tokio::spawn(socket_task(self.clone(), ws, rx));
                self.opening.lock().take();
                Ok(())
            },
            Err(e) => {
                *self.state.lock() = SocketState::Closed;
                self.opening.lock().take();
                Err(e)
            },
        }
    }

    async fn establish(&self) -> Result<WebSocketStream> {
        let handlers = &self.config.event_handlers;
        let url = resolve_ws_url(&self.config.url.resolve().await?)?;
        log::debug!("[EDEN_WS] Establishing WebSocket connection #{} to {}", self.id, url);
        let auth = self.config.auth.resolve().await?;

        let mut request = url.as_str().into_client_request().map_err(|e| {
            EdenLinkError::ConfigurationError(format!("Failed to build WebSocket request: {}", e))
        })?;
        apply_ws_auth_headers(&mut request, &auth)?;

        let timeout = self.config.timeouts.connection_timeout;
        let connect_result = if !EdenLinkTimeouts::is_no_timeout(timeout) {
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await
        } else {
            Ok(tokio_tungstenite::connect_async(request).await)
        };

        let mut ws = match connect_result {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response))) => {
                let message = match response.status().as_u16() {
                    401 => "Unauthorized: WebSocket requires valid credentials".to_string(),
                    403 => "Forbidden: Access to WebSocket denied".to_string(),
                    code => format!("WebSocket HTTP error: {}", code),
                };
                handlers.emit_error(ConnectionError::new(&message, true));
                return Err(EdenLinkError::WebSocketClosedError(message));
            },
            Ok(Err(e)) => {
                let message = format!("Connection failed: {}", e);
                handlers.emit_error(ConnectionError::new(&message, true));
                return Err(EdenLinkError::WebSocketClosedError(message));
            },
            Err(_) => {
                let message = format!("Connection timeout ({:?})", timeout);
                handlers.emit_error(ConnectionError::new(&message, true));
                return Err(EdenLinkError::TimeoutError(message));
            },
        };

        if let Some(params) = &self.config.connection_params {
            let frame = encode_client_frame(&[ClientEnvelope::connection_params(
                params.resolve().await?,
            )])?;
            ws.send(Message::Text(frame.into())).await?;
        }
        log::info!("[EDEN_WS] WebSocket connection #{} open", self.id);
        Ok(ws)
    }

    fn report(&self, event: ConnectionEvent) {
        let _ = self.events.send((self.id, event));
    }
}

/// Rewrite `http(s)` to `ws(s)`; other schemes are rejected.
pub fn resolve_ws_url(url: &str) -> Result<String> {
    let mut parsed = reqwest::Url::parse(url)
        .map_err(|e| EdenLinkError::ConfigurationError(format!("Invalid WebSocket URL '{}': {}", url, e)))?;
    let scheme = match parsed.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(EdenLinkError::ConfigurationError(format!(
                "Unsupported WebSocket URL scheme '{}'",
                other
            )))
        },
    };
    parsed
        .set_scheme(scheme)
        .map_err(|_| EdenLinkError::ConfigurationError(format!("Cannot use scheme {} for {}", scheme, url)))?;
    Ok(parsed.to_string())
}

fn apply_ws_auth_headers(
    request: &mut tokio_tungstenite::tungstenite::handshake::client::Request,
    auth: &AuthProvider,
) -> Result<()> {
    if let Some((name, value)) = auth.header_pair() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| EdenLinkError::ConfigurationError(format!("Invalid auth header name: {}", e)))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| EdenLinkError::ConfigurationError(format!("Invalid auth header value: {}", e)))?;
        request.headers_mut().insert(name, value);
    }
    Ok(())
}

async fn socket_task(
    inner: Arc<ConnectionInner>,
    mut ws: WebSocketStream,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let timeouts = &inner.config.timeouts;
    let handlers = &inner.config.event_handlers;

    let has_keepalive = !timeouts.keepalive_interval.is_zero();
    let keepalive_dur = if has_keepalive {
        timeouts.keepalive_interval
    } else {
        FAR_FUTURE
    };
    let mut idle_deadline = TokioInstant::now() + keepalive_dur;

    let pong_timeout_dur = timeouts.pong_timeout;
    let has_pong_timeout = has_keepalive && !pong_timeout_dur.is_zero();
    let mut awaiting_pong = false;
    let mut pong_deadline = TokioInstant::now() + FAR_FUTURE;

    let mut close_ack: Option<oneshot::Sender<()>> = None;

    let reason = loop {
        let idle_sleep = tokio::time::sleep_until(idle_deadline);
        tokio::pin!(idle_sleep);
        let pong_sleep = tokio::time::sleep_until(pong_deadline);
        tokio::pin!(pong_sleep);

        tokio::select! {
            biased;

            _ = &mut pong_sleep, if has_pong_timeout && awaiting_pong => {
                log::warn!(
                    "[EDEN_WS] Pong timeout ({:?}) on connection #{}, server unresponsive",
                    pong_timeout_dur,
                    inner.id,
                );
                break DisconnectReason::with_code(
                    format!("Pong timeout ({:?})", pong_timeout_dur),
                    1006,
                );
            }

            cmd = rx.recv() => match cmd {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = ws.send(Message::Text(text.into())).await {
                        handlers.emit_error(ConnectionError::new(e.to_string(), true));
                        break DisconnectReason::with_code(format!("Send failed: {}", e), 1006);
                    }
                },
                Some(Outbound::Close(ack)) => {
                    let _ = ws.close(None).await;
                    close_ack = Some(ack);
                    break DisconnectReason::with_code("Closed by client", 1000);
                },
                None => {
                    let _ = ws.close(None).await;
                    break DisconnectReason::with_code("Connection dropped", 1000);
                },
            },

            _ = &mut idle_sleep, if has_keepalive && !awaiting_pong => {
                if let Err(e) = ws.send(Message::Text(PING_MESSAGE.to_string().into())).await {
                    log::warn!("[EDEN_WS] Keepalive ping failed: {}", e);
                    break DisconnectReason::with_code(format!("Keepalive ping failed: {}", e), 1006);
                }
                if has_pong_timeout {
                    awaiting_pong = true;
                    pong_deadline = TokioInstant::now() + pong_timeout_dur;
                }
                idle_deadline = TokioInstant::now() + keepalive_dur;
            }

            frame = ws.next() => {
                idle_deadline = TokioInstant::now() + keepalive_dur;
                if awaiting_pong {
                    awaiting_pong = false;
                    pong_deadline = TokioInstant::now() + FAR_FUTURE;
                }

                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.as_str();
                        if text == PONG_MESSAGE {
                            continue;
                        }
                        if text == PING_MESSAGE {
                            let _ = ws.send(Message::Text(PONG_MESSAGE.to_string().into())).await;
                            continue;
                        }
                        if text.len() > MAX_WS_TEXT_MESSAGE_BYTES {
                            log::warn!("[EDEN_WS] Text message too large ({} bytes)", text.len());
                            continue;
                        }
                        inner.report(ConnectionEvent::Message(text.to_string()));
                    },
                    Some(Ok(Message::Binary(data))) => match decode_binary_frame(&data) {
                        Ok(text) => inner.report(ConnectionEvent::Message(text)),
                        Err(e) => handlers.emit_error(ConnectionError::new(e.to_string(), true)),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) => DisconnectReason::with_code(f.reason.as_str().to_string(), f.code.into()),
                            None => DisconnectReason::new("Server closed connection"),
                        };
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    },
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {},
                    Some(Err(e)) => {
                        handlers.emit_error(ConnectionError::new(e.to_string(), true));
                        break DisconnectReason::with_code(format!("WebSocket error: {}", e), 1006);
                    },
                    None => break DisconnectReason::with_code("WebSocket stream ended", 1006),
                }
            }
        }
    };

    log::debug!("[EDEN_WS] Connection #{} closed: {}", inner.id, reason);
    inner.outbound.lock().take();
    *inner.state.lock() = SocketState::Closed;
    inner.report(ConnectionEvent::Closed(reason));
    if let Some(ack) = close_ack {
        let _ = ack.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ws_url() {
        assert_eq!(resolve_ws_url("http://h:3000/ws").unwrap(), "ws://h:3000/ws");
        assert_eq!(resolve_ws_url("https://h/ws?x=1").unwrap(), "wss://h/ws?x=1");
        assert_eq!(resolve_ws_url("wss://h/ws").unwrap(), "wss://h/ws");
        assert!(matches!(
            resolve_ws_url("ftp://h/ws"),
            Err(EdenLinkError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = WebSocketConnection::new(1, ConnectionConfig::new("ws://127.0.0.1:1/ws"), tx);
        assert_eq!(conn.state(), SocketState::Idle);
        assert!(matches!(
            conn.send("[]".into()),
            Err(EdenLinkError::WebSocketClosedError(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_open_can_be_retried() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = WebSocketConnection::new(1, ConnectionConfig::new("ws://127.0.0.1:1/ws"), tx);
        assert!(conn.open().await.is_err());
        assert_eq!(conn.state(), SocketState::Closed);
        assert!(conn.inner.opening.lock().is_none());
        assert!(conn.open().await.is_err());
    }
}
