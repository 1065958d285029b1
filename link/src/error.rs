//! Error types for eden-link.
//!
//! Every failure that can reach a caller (a rejected `query`, an
//! `on_error` callback, a fatal SSE event) is an [`EdenLinkError`].
//! Payloads are kept as plain strings / JSON values so the error is
//! `Clone`: the same failure is routinely handed to several observers
//! (multicast observables, every member of a failed batch).

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Result type used throughout eden-link.
pub type Result<T> = std::result::Result<T, EdenLinkError>;

/// Errors produced by the client runtime.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EdenLinkError {
    /// Network-level failure (DNS, connect, reset, broken body stream).
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The server answered with an HTTP status >= 400.
    #[error("HTTP {status}: {value}")]
    FetchStatusError {
        /// HTTP status code.
        status: u16,
        /// Decoded response body (JSON when possible, otherwise a string).
        value: JsonValue,
    },

    /// The WebSocket closed while the request was outgoing or pending.
    #[error("WebSocket closed: {0}")]
    WebSocketClosedError(String),

    /// A single operation does not fit into the configured batch budget.
    #[error("Batch input too large: {0}")]
    BatchInputTooLargeError(String),

    /// Invalid client setup (missing terminal link, bad URL, server
    /// without batching support, ...).
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Encoding or decoding of a wire payload failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An operation did not finish in time.
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Structured error reported by the server (WebSocket `error` envelope
    /// or SSE `serialized-error` event).
    #[error("Server error [{code}]: {message}")]
    ServerError {
        /// Symbolic error code (e.g. `INTERNAL_SERVER_ERROR`).
        code: String,
        /// Human-readable message.
        message: String,
        /// Extra payload attached by the server.
        data: Option<JsonValue>,
    },

    /// The caller aborted the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Server error codes that are worth retrying: the request may succeed on
/// a fresh connection.
const RETRYABLE_SERVER_CODES: &[&str] = &[
    "INTERNAL_SERVER_ERROR",
    "BAD_GATEWAY",
    "SERVICE_UNAVAILABLE",
    "GATEWAY_TIMEOUT",
];

impl EdenLinkError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::FetchStatusError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response body carried by the error, if any.
    pub fn value(&self) -> Option<&JsonValue> {
        match self {
            Self::FetchStatusError { value, .. } => Some(value),
            Self::ServerError { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    /// Build a [`EdenLinkError::ServerError`] from a `{code, message, data}`
    /// JSON object. Missing fields fall back to `INTERNAL_SERVER_ERROR`
    /// and the raw payload.
    pub fn from_server_payload(payload: &JsonValue) -> Self {
        let code = payload
            .get("code")
            .and_then(|c| c.as_str())
            .unwrap_or("INTERNAL_SERVER_ERROR")
            .to_string();
        let message = payload
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());
        Self::ServerError {
            code,
            message,
            data: payload.get("data").cloned(),
        }
    }

    /// Whether a retry on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransportError(_) | Self::TimeoutError(_) | Self::WebSocketClosedError(_) => true,
            Self::FetchStatusError { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            Self::ServerError { code, .. } => RETRYABLE_SERVER_CODES.contains(&code.as_str()),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for EdenLinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::TimeoutError(err.to_string())
        } else if err.is_decode() {
            Self::SerializationError(err.to_string())
        } else {
            Self::TransportError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EdenLinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EdenLinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocketClosedError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fetch_status_accessors() {
        let err = EdenLinkError::FetchStatusError {
            status: 418,
            value: json!({"message": "teapot"}),
        };
        assert_eq!(err.status(), Some(418));
        assert_eq!(err.value(), Some(&json!({"message": "teapot"})));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_server_payload_parsing() {
        let err = EdenLinkError::from_server_payload(&json!({
            "code": "BAD_GATEWAY",
            "message": "upstream down",
        }));
        assert_eq!(
            err,
            EdenLinkError::ServerError {
                code: "BAD_GATEWAY".into(),
                message: "upstream down".into(),
                data: None,
            }
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_non_retryable_server_code() {
        let err = EdenLinkError::from_server_payload(&json!({"code": "UNAUTHORIZED"}));
        assert!(!err.is_retryable());
    }
}
