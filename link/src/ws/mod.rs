//! WebSocket transport.
//!
//! - [`connection`]: a single socket with keep-alive, owned by a background task
//! - [`request_manager`]: outgoing / pending request bookkeeping
//! - [`client`]: multiplexing client with lazy mode and reconnect

pub mod client;
pub mod connection;
pub mod request_manager;

pub use client::{WebSocketClient, WebSocketClientOptions};
pub use connection::{
    resolve_ws_url, ConnectionConfig, ConnectionEvent, ConnectionParams, SocketState, UrlSource,
    WebSocketConnection, PING_MESSAGE, PONG_MESSAGE,
};
pub use request_manager::{AbortHandle, RequestManager, RequestSnapshot, RequestStatus};

/// Maximum text message size (64 MiB).
pub(crate) const MAX_WS_TEXT_MESSAGE_BYTES: usize = 64 << 20;

/// A duration far enough in the future (~100 years) to act as "never" for
/// deadline calculations without overflowing `Instant::now() + dur`.
pub(crate) const FAR_FUTURE: std::time::Duration =
    std::time::Duration::from_secs(100 * 365 * 24 * 3600);
