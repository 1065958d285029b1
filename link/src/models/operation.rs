use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

use super::request_params::RequestParams;

/// Kind of a client call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Read-only request resolving to a single result.
    Query,
    /// Side-effecting request resolving to a single result.
    Mutation,
    /// Long-lived stream of results.
    Subscription,
}

impl OperationType {
    /// Wire name (`query`, `mutation`, `subscription`).
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Query => "query",
            OperationType::Mutation => "mutation",
            OperationType::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable bag of annotations links attach to an operation.
///
/// Links may read and write it before calling `next`; downstream links see
/// the changes. Values are plain JSON so the bag stays `Clone + Send`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationContext(HashMap<String, JsonValue>);

impl OperationContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an annotation.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Set an annotation, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.0.insert(key.into(), value)
    }

    /// Remove an annotation.
    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        self.0.remove(key)
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` into `self`, overwriting duplicate keys.
    pub fn extend(&mut self, other: OperationContext) {
        self.0.extend(other.0);
    }
}

/// One logical client request flowing through the link chain.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Per-client monotonic id.
    pub id: u64,
    /// Query, mutation or subscription.
    pub kind: OperationType,
    /// Route path, e.g. `/users/42`.
    pub path: String,
    /// Annotations shared by the links handling this operation.
    pub context: OperationContext,
    /// HTTP-shaped request parameters.
    pub params: RequestParams,
    /// Cancellation for this operation only.
    pub signal: Option<CancellationToken>,
}

impl Operation {
    /// Create an operation with an empty context and no signal.
    pub fn new(id: u64, kind: OperationType, path: impl Into<String>, params: RequestParams) -> Self {
        Self {
            id,
            kind,
            path: path.into(),
            context: OperationContext::new(),
            params,
            signal: None,
        }
    }

    /// Attach a cancellation token.
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Replace the context.
    pub fn with_context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }

    /// Whether the operation's signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.signal.as_ref().is_some_and(|s| s.is_cancelled())
    }
}
