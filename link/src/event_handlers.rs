//! Lifecycle hooks of the WebSocket client.
//!
//! ```rust
//! use eden_link::{EventHandlers, WebSocketClientOptions};
//!
//! let handlers = EventHandlers::new()
//!     .on_connect(|| log::info!("socket up"))
//!     .on_disconnect(|reason| log::warn!("socket down: {}", reason))
//!     .on_reconnect_attempt(|attempt, delay_ms| {
//!         log::info!("reconnect #{} in {}ms", attempt, delay_ms)
//!     });
//!
//! let options = WebSocketClientOptions::new("ws://localhost:3000/ws")
//!     .event_handlers(handlers);
//! ```

use std::fmt;
use std::sync::Arc;

/// Why a socket closed.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectReason {
    /// Description of the close.
    pub message: String,
    /// WebSocket close code, when the peer sent one (1000 normal, 1006 abnormal).
    pub code: Option<u16>,
}

impl DisconnectReason {
    /// Reason without a close code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Reason with a close code.
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Whether the close was requested by this side or ended cleanly.
    pub fn is_normal(&self) -> bool {
        self.code == Some(1000)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Error passed to `on_error`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionError {
    /// Error description.
    pub message: String,
    /// Whether the client will keep reconnecting.
    pub recoverable: bool,
}

impl ConnectionError {
    /// New connection error.
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

type ConnectFn = Arc<dyn Fn() + Send + Sync>;
type DisconnectFn = Arc<dyn Fn(DisconnectReason) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(ConnectionError) + Send + Sync>;
type ReconnectFn = Arc<dyn Fn(u32, u64) + Send + Sync>;
type RawFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional callbacks fired by the WebSocket client.
///
/// Handlers run on the client's background task and must not block.
#[derive(Clone, Default)]
pub struct EventHandlers {
    on_connect: Option<ConnectFn>,
    on_disconnect: Option<DisconnectFn>,
    on_error: Option<ErrorFn>,
    on_reconnect_attempt: Option<ReconnectFn>,
    on_receive: Option<RawFn>,
    on_send: Option<RawFn>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_reconnect_attempt", &self.on_reconnect_attempt.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_send", &self.on_send.is_some())
            .finish()
    }
}

impl EventHandlers {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket opened (first open and every successful reconnect).
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Socket closed, for any reason.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Open failed or the socket errored.
    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// A reconnect attempt is scheduled: `(attempt, delay_ms)`.
    pub fn on_reconnect_attempt(mut self, f: impl Fn(u32, u64) + Send + Sync + 'static) -> Self {
        self.on_reconnect_attempt = Some(Arc::new(f));
        self
    }

    /// Every raw inbound text frame (debug hook).
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Every raw outbound text frame (debug hook).
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    pub(crate) fn emit_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    pub(crate) fn emit_reconnect_attempt(&self, attempt: u32, delay_ms: u64) {
        if let Some(cb) = &self.on_reconnect_attempt {
            cb(attempt, delay_ms);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(cb) = &self.on_receive {
            cb(raw);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(cb) = &self.on_send {
            cb(raw);
        }
    }
}
