//! Credentials attached to every outgoing request.
//!
//! Static credentials cover the common case; [`DynamicAuthProvider`] is
//! called again before each request and each WebSocket (re)connect, so
//! expiring tokens can be refreshed.
//!
//! ```rust,no_run
//! use eden_link::{AuthProvider, DynamicAuthProvider};
//!
//! struct TokenStore;
//!
//! #[async_trait::async_trait]
//! impl DynamicAuthProvider for TokenStore {
//!     async fn get_auth(&self) -> eden_link::Result<AuthProvider> {
//!         Ok(AuthProvider::bearer("fresh-token"))
//!     }
//! }
//! ```

use crate::error::Result;
use base64::{engine::general_purpose, Engine as _};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Static credentials.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AuthProvider {
    /// `Authorization: Basic base64(user:password)`
    BasicAuth(String, String),
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// Arbitrary header, e.g. an API key.
    Header(String, String),
    /// No credentials.
    #[default]
    None,
}

impl AuthProvider {
    /// HTTP Basic credentials (RFC 7617).
    pub fn basic_auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::BasicAuth(username.into(), password.into())
    }

    /// Bearer token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(token.into())
    }

    /// Custom header.
    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Header(name.into(), value.into())
    }

    /// No credentials.
    pub fn none() -> Self {
        Self::None
    }

    /// Header name and value carrying the credentials.
    pub fn header_pair(&self) -> Option<(String, String)> {
        match self {
            Self::BasicAuth(username, password) => {
                let encoded =
                    general_purpose::STANDARD.encode(format!("{}:{}", username, password).as_bytes());
                Some(("authorization".to_string(), format!("Basic {}", encoded)))
            },
            Self::Bearer(token) => Some(("authorization".to_string(), format!("Bearer {}", token))),
            Self::Header(name, value) => Some((name.to_ascii_lowercase(), value.clone())),
            Self::None => None,
        }
    }

    /// Add the credentials to a header map unless the caller already set
    /// that header.
    pub fn apply_to_headers(&self, headers: &mut BTreeMap<String, String>) {
        if let Some((name, value)) = self.header_pair() {
            let present = headers.keys().any(|k| k.eq_ignore_ascii_case(&name));
            if !present {
                headers.insert(name, value);
            }
        }
    }

    /// Whether credentials are configured.
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Credentials resolved lazily before each request or connect.
#[async_trait::async_trait]
pub trait DynamicAuthProvider: Send + Sync + 'static {
    /// Current (possibly refreshed) credentials.
    async fn get_auth(&self) -> Result<AuthProvider>;
}

/// Static or dynamic credentials.
#[derive(Clone, Default)]
pub enum ResolvedAuth {
    /// No credentials.
    #[default]
    None,
    /// Fixed at construction time.
    Static(AuthProvider),
    /// Called on every resolve.
    Dynamic(Arc<dyn DynamicAuthProvider>),
}

impl ResolvedAuth {
    /// Effective credentials.
    pub async fn resolve(&self) -> Result<AuthProvider> {
        match self {
            Self::None => Ok(AuthProvider::None),
            Self::Static(p) => Ok(p.clone()),
            Self::Dynamic(provider) => provider.get_auth().await,
        }
    }
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "ResolvedAuth::None"),
            Self::Static(p) => write!(f, "ResolvedAuth::Static({:?})", p),
            Self::Dynamic(_) => write!(f, "ResolvedAuth::Dynamic(<fn>)"),
        }
    }
}

impl From<AuthProvider> for ResolvedAuth {
    fn from(p: AuthProvider) -> Self {
        Self::Static(p)
    }
}

impl From<Arc<dyn DynamicAuthProvider>> for ResolvedAuth {
    fn from(p: Arc<dyn DynamicAuthProvider>) -> Self {
        Self::Dynamic(p)
    }
}
