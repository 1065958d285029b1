use serde::{Deserialize, Serialize};

/// Reconnect and laziness policy of the WebSocket client.
///
/// # Example
///
/// ```rust
/// use eden_link::ConnectionOptions;
///
/// let options = ConnectionOptions::default()
///     .with_lazy(true)
///     .with_reconnect_delay_ms(500)
///     .with_max_reconnect_attempts(Some(10));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Reconnect when the socket drops.
    /// Default: true
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Base delay of the exponential backoff, in milliseconds.
    /// The first attempt is immediate, attempt `n` waits
    /// `min(reconnect_delay_ms * 2^n, max_reconnect_delay_ms)`.
    /// Default: 1000
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Upper bound of the backoff, in milliseconds.
    /// Default: 30000
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Give up after this many failed attempts.
    /// Default: None (retry until the client is closed)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// Open the socket on first request and close it when idle.
    /// Default: false
    #[serde(default)]
    pub lazy: bool,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30000,
            max_reconnect_attempts: None,
            lazy: false,
        }
    }
}

impl ConnectionOptions {
    /// Create new connection options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to automatically reconnect on connection loss
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the base backoff delay (in milliseconds)
    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Set the maximum backoff delay (in milliseconds)
    pub fn with_max_reconnect_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_reconnect_delay_ms = max_delay_ms;
        self
    }

    /// Set the maximum number of reconnection attempts
    /// Pass None for infinite retries, Some(0) to disable reconnection
    pub fn with_max_reconnect_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Enable lazy mode
    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Backoff before reconnect attempt `attempt` (0-based).
    pub fn retry_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        self.reconnect_delay_ms
            .saturating_mul(factor)
            .min(self.max_reconnect_delay_ms)
    }
}
