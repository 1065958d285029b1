//! Timeout configuration for eden-link transports.
//!
//! Centralizes the timers used by the HTTP fetcher, the WebSocket
//! keep-alive and send coalescing, lazy WebSocket mode and the SSE
//! inactivity watchdog.

use std::time::Duration;

/// Timeout configuration for eden-link transports.
///
/// # Examples
///
/// ```rust
/// use eden_link::EdenLinkTimeouts;
/// use std::time::Duration;
///
/// // Defaults
/// let timeouts = EdenLinkTimeouts::default();
///
/// // Custom keep-alive for a flaky network
/// let timeouts = EdenLinkTimeouts::builder()
///     .keepalive_interval(Duration::from_secs(20))
///     .pong_timeout_secs(5)
///     .build();
///
/// // Short timers for a local server
/// let timeouts = EdenLinkTimeouts::fast();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EdenLinkTimeouts {
    /// Timeout for establishing connections (TCP + TLS + WebSocket handshake).
    /// Default: 10 seconds
    pub connection_timeout: Duration,

    /// Total timeout of a single HTTP request. Set to 0 to disable.
    /// Default: 30 seconds
    pub request_timeout: Duration,

    /// Idle time after which the WebSocket sends a `PING` text frame.
    /// Any inbound message resets the timer. Set to 0 to disable keep-alive.
    /// Default: 5 seconds
    pub keepalive_interval: Duration,

    /// Maximum wait for `PONG` after a `PING`. Missing it closes the socket
    /// abnormally so the client reconnects.
    /// Default: 1 second
    pub pong_timeout: Duration,

    /// Lazy WebSocket mode: close the socket after this long without
    /// outgoing or pending requests.
    /// Default: 0 (close as soon as the client goes idle)
    pub lazy_close_timeout: Duration,

    /// SSE: recreate the event source when no traffic arrives within this
    /// window. A server `connected` event may override it. Set to 0 to disable.
    /// Default: 0 (disabled)
    pub reconnect_after_inactivity: Duration,

    /// How long the WebSocket client keeps collecting requests into one
    /// frame after the first one is queued. Zero means one scheduler tick,
    /// which only coalesces reliably on a current-thread runtime.
    /// Default: 1 millisecond
    pub batch_window: Duration,
}

impl Default for EdenLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(1),
            lazy_close_timeout: Duration::ZERO,
            reconnect_after_inactivity: Duration::ZERO,
            batch_window: Duration::from_millis(1),
        }
    }
}

impl EdenLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> EdenLinkTimeoutsBuilder {
        EdenLinkTimeoutsBuilder::new()
    }

    /// Timeouts for localhost development.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(2),
            pong_timeout: Duration::from_millis(500),
            lazy_close_timeout: Duration::ZERO,
            reconnect_after_inactivity: Duration::from_secs(10),
            batch_window: Duration::from_millis(1),
        }
    }

    /// Timeouts for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            lazy_close_timeout: Duration::from_secs(30),
            reconnect_after_inactivity: Duration::ZERO,
            batch_window: Duration::from_millis(5),
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }
}

/// Builder for [`EdenLinkTimeouts`].
#[derive(Debug, Clone)]
pub struct EdenLinkTimeoutsBuilder {
    timeouts: EdenLinkTimeouts,
}

impl EdenLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: EdenLinkTimeouts::default(),
        }
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the connection timeout in seconds.
    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    /// Set the HTTP request timeout. Set to 0 to disable.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request_timeout = timeout;
        self
    }

    /// Set the keep-alive ping interval. Set to 0 to disable.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keepalive_interval = interval;
        self
    }

    /// Set the pong timeout.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.pong_timeout = timeout;
        self
    }

    /// Set the pong timeout in seconds.
    pub fn pong_timeout_secs(self, secs: u64) -> Self {
        self.pong_timeout(Duration::from_secs(secs))
    }

    /// Set the lazy-mode close delay.
    pub fn lazy_close_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.lazy_close_timeout = timeout;
        self
    }

    /// Set the SSE inactivity window. Set to 0 to disable.
    pub fn reconnect_after_inactivity(mut self, timeout: Duration) -> Self {
        self.timeouts.reconnect_after_inactivity = timeout;
        self
    }

    /// Set the WebSocket send coalescing window.
    pub fn batch_window(mut self, window: Duration) -> Self {
        self.timeouts.batch_window = window;
        self
    }

    /// Build the timeout configuration.
    pub fn build(self) -> EdenLinkTimeouts {
        self.timeouts
    }
}
