use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::operation::{Operation, OperationType};
use super::request_params::{FormValue, HttpMethod, RequestBody};
use crate::error::{EdenLinkError, Result};

/// Method of a client-to-server WebSocket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WsMethod {
    /// One-shot read
    #[serde(rename = "query")]
    Query,
    /// One-shot write
    #[serde(rename = "mutation")]
    Mutation,
    /// Start a stream
    #[serde(rename = "subscription")]
    Subscription,
    /// Stop a stream started with the same id
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
    /// Connection parameters, sent right after the socket opens
    #[serde(rename = "connection-params")]
    ConnectionParams,
}

impl From<OperationType> for WsMethod {
    fn from(kind: OperationType) -> Self {
        match kind {
            OperationType::Query => WsMethod::Query,
            OperationType::Mutation => WsMethod::Mutation,
            OperationType::Subscription => WsMethod::Subscription,
        }
    }
}

/// Parameters of a `query` / `mutation` / `subscription` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsRequestParams {
    /// Route path
    pub path: String,
    /// HTTP method the server should route with
    pub method: HttpMethod,
    /// Query-string parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    /// Request headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// JSON body (files are not supported over the socket)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
    /// Resume a subscription after this event id
    #[serde(rename = "lastEventId", default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
}

impl WsRequestParams {
    /// Build from an operation.
    ///
    /// Form bodies are flattened to a JSON object of text fields; file parts
    /// cannot travel over the socket and are rejected.
    pub fn from_operation(op: &Operation) -> Result<Self> {
        let body = match &op.params.body {
            None => None,
            Some(RequestBody::Json(payload)) => {
                if payload.has_files() {
                    return Err(EdenLinkError::ConfigurationError(
                        "File uploads are not supported over WebSocket".to_string(),
                    ));
                }
                Some(payload.extract_files().0)
            },
            Some(RequestBody::FormData(fields)) => {
                let mut map = serde_json::Map::new();
                for (key, value) in fields {
                    match value {
                        FormValue::Text(text) => {
                            map.insert(key.clone(), JsonValue::String(text.clone()));
                        },
                        FormValue::File(_) => {
                            return Err(EdenLinkError::ConfigurationError(
                                "File uploads are not supported over WebSocket".to_string(),
                            ));
                        },
                    }
                }
                Some(JsonValue::Object(map))
            },
        };
        Ok(Self {
            path: op.path.clone(),
            method: op.params.method,
            query: op.params.query.clone(),
            headers: op.params.headers.clone(),
            body,
            last_event_id: op
                .context
                .get("lastEventId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}

/// Client-to-server WebSocket message.
///
/// Outgoing frames always carry a JSON array of envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Correlation id (absent for `connection-params`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Message method
    pub method: WsMethod,
    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl ClientEnvelope {
    /// Request envelope for an operation.
    pub fn request(op: &Operation) -> Result<Self> {
        let params = WsRequestParams::from_operation(op)?;
        Ok(Self {
            id: Some(op.id),
            method: op.kind.into(),
            params: Some(serde_json::to_value(params)?),
        })
    }

    /// `subscription.stop` for the subscription started with `id`.
    pub fn stop(id: u64) -> Self {
        Self {
            id: Some(id),
            method: WsMethod::SubscriptionStop,
            params: None,
        }
    }

    /// `connection-params` message.
    pub fn connection_params(data: JsonValue) -> Self {
        Self {
            id: None,
            method: WsMethod::ConnectionParams,
            params: Some(data),
        }
    }

    /// Whether this envelope starts a subscription.
    pub fn is_subscription(&self) -> bool {
        self.method == WsMethod::Subscription
    }
}

/// Serialize a flush as one text frame.
pub fn encode_client_frame(envelopes: &[ClientEnvelope]) -> Result<String> {
    serde_json::to_string(envelopes).map_err(EdenLinkError::from)
}

/// `result` member of a server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerResult {
    /// Subscription acknowledged
    Started,
    /// Subscription finished
    Stopped,
    /// Server asks every client to reconnect (no originating request)
    Reconnect,
    /// Payload
    Data {
        /// Decoded payload
        #[serde(default)]
        data: JsonValue,
        /// Tracked event id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

/// Server-to-client WebSocket message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    /// Correlation id of the originating request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Success result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ServerResult>,
    /// Structured error (`{code, message, data}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonValue>,
}

impl ServerEnvelope {
    /// Whether this is an unsolicited reconnect push.
    pub fn is_reconnect(&self) -> bool {
        matches!(self.result, Some(ServerResult::Reconnect))
    }
}

/// Parse an inbound text frame: a single envelope or an array.
///
/// Elements of an array are decoded one by one; a malformed element is
/// logged and skipped so the rest of the frame still settles. A frame that
/// is not JSON, or a lone malformed envelope, is an error.
pub fn decode_server_frame(text: &str) -> Result<Vec<ServerEnvelope>> {
    match serde_json::from_str::<JsonValue>(text)? {
        JsonValue::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<ServerEnvelope>(item) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    log::warn!("[EDEN_WS] Skipping malformed envelope in frame: {}", e);
                    None
                },
            })
            .collect()),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}
