use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::connection_state::ConnectionState;
use crate::error::EdenLinkError;

/// Transport-level details of the response that produced a result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMeta {
    /// HTTP status (200 for WebSocket/SSE data).
    pub status: u16,
    /// Response headers, lower-cased names.
    pub headers: BTreeMap<String, String>,
}

impl ResponseMeta {
    /// Metadata with only a status.
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
        }
    }
}

/// Item produced by a terminal link and observed by every upstream link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkResult {
    /// Successful payload. `id` is set for tracked subscription events.
    Data {
        /// Decoded payload.
        data: JsonValue,
        /// Resumption id of a tracked event.
        id: Option<String>,
        /// Response metadata, when the result came from HTTP.
        response: Option<ResponseMeta>,
    },
    /// Error answer (HTTP status >= 400, or per-item batch error).
    Error {
        /// HTTP status.
        status: u16,
        /// Decoded error body.
        value: JsonValue,
        /// Response metadata, when the result came from HTTP.
        response: Option<ResponseMeta>,
    },
    /// Subscription acknowledged by the server.
    Started,
    /// Subscription ended by the server.
    Stopped,
    /// Transport connection state changed.
    State(ConnectionState),
}

impl LinkResult {
    /// Untracked data result without response metadata.
    pub fn data(data: JsonValue) -> Self {
        LinkResult::Data {
            data,
            id: None,
            response: None,
        }
    }

    /// Whether this is a `Data` or `Error` payload (as opposed to lifecycle
    /// or state notifications).
    pub fn is_payload(&self) -> bool {
        matches!(self, LinkResult::Data { .. } | LinkResult::Error { .. })
    }

    /// Convert a payload result into the caller-facing outcome.
    pub fn into_response(self) -> Result<EdenResponse, EdenLinkError> {
        match self {
            LinkResult::Data { data, id, response } => Ok(EdenResponse { data, id, response }),
            LinkResult::Error { status, value, .. } => {
                Err(EdenLinkError::FetchStatusError { status, value })
            },
            other => Err(EdenLinkError::SerializationError(format!(
                "Expected a data or error result, got {:?}",
                other
            ))),
        }
    }
}

/// Successful answer of `query` / `mutation`.
#[derive(Debug, Clone, PartialEq)]
pub struct EdenResponse {
    /// Decoded payload.
    pub data: JsonValue,
    /// Resumption id, for tracked events.
    pub id: Option<String>,
    /// Response metadata, when the result came from HTTP.
    pub response: Option<ResponseMeta>,
}

impl EdenResponse {
    /// Deserialize the payload into `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, EdenLinkError> {
        serde_json::from_value(self.data.clone()).map_err(EdenLinkError::from)
    }
}

/// Error member of a batch response element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// HTTP status of the sub-request.
    pub status: u16,
    /// Error body.
    #[serde(default)]
    pub value: JsonValue,
}

/// One element of a batch response: `{type:'data', data, error:null}` or
/// `{data:null, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdenResult {
    /// `data` for successful elements.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Payload (null on error).
    #[serde(default)]
    pub data: JsonValue,
    /// Error (null on success).
    #[serde(default)]
    pub error: Option<WireError>,
    /// Status of the sub-request, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl EdenResult {
    /// Successful element.
    pub fn ok(data: JsonValue) -> Self {
        Self {
            kind: Some("data".to_string()),
            data,
            error: None,
            status: Some(200),
        }
    }

    /// Failed element.
    pub fn err(status: u16, value: JsonValue) -> Self {
        Self {
            kind: None,
            data: JsonValue::Null,
            error: Some(WireError { status, value }),
            status: Some(status),
        }
    }

    /// Convert into a [`LinkResult`].
    pub fn into_link_result(self) -> LinkResult {
        match self.error {
            Some(err) => LinkResult::Error {
                status: err.status,
                value: err.value,
                response: Some(ResponseMeta::with_status(err.status)),
            },
            None => LinkResult::Data {
                data: self.data,
                id: None,
                response: Some(ResponseMeta::with_status(self.status.unwrap_or(200))),
            },
        }
    }
}
