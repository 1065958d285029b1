//! Data models for the eden-link client runtime.
//!
//! Operations flowing through the link chain, their results, connection
//! state and the WebSocket wire envelopes.

pub mod connection_options;
pub mod connection_state;
pub mod link_result;
pub mod operation;
pub mod request_params;
pub mod ws_envelope;

#[cfg(test)]
mod tests;

pub use connection_options::ConnectionOptions;
pub use connection_state::ConnectionState;
pub use link_result::{EdenResponse, EdenResult, LinkResult, ResponseMeta, WireError};
pub use operation::{Operation, OperationContext, OperationType};
pub use request_params::{FilePart, FormValue, HttpMethod, Payload, RequestBody, RequestParams};
pub use ws_envelope::{
    decode_server_frame, encode_client_frame, ClientEnvelope, ServerEnvelope, ServerResult,
    WsMethod, WsRequestParams,
};
