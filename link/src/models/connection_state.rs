use std::fmt;

use crate::error::EdenLinkError;

/// State of a transport connection (WebSocket or SSE).
///
/// `Idle` only before the first open or after an explicit close; once
/// opened the state moves between `Connecting` and `Pending`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionState {
    /// Not opened, or closed by the owner.
    #[default]
    Idle,
    /// (Re)connecting. `error` holds the failure that caused a reconnect.
    Connecting {
        /// Failure that triggered this attempt, if any.
        error: Option<EdenLinkError>,
    },
    /// Connected, waiting for traffic.
    Pending,
}

impl ConnectionState {
    /// `connecting` without an error.
    pub fn connecting() -> Self {
        ConnectionState::Connecting { error: None }
    }

    /// Wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Pending => "pending",
        }
    }

    /// Whether the state is `Connecting`.
    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting { error: Some(e) } => write!(f, "connecting ({})", e),
            other => f.write_str(other.as_str()),
        }
    }
}
