//! eden-link: typed RPC client runtime.
//!
//! Calls made through [`EdenClient`] become [`Operation`]s that flow through a
//! chain of [`Link`]s and come back as an [`Observable`] of [`LinkResult`]s.
//! Terminal links talk to the server:
//!
//! - [`HttpLink`]: one HTTP request per operation
//! - [`HttpBatchLink`]: operations issued together share one request
//! - [`WsLink`]: everything over one multiplexed WebSocket ([`WebSocketClient`])
//! - [`HttpSubscriptionLink`]: resumable subscriptions over server-sent events
//!
//! # Example
//!
//! ```rust,no_run
//! use eden_link::{EdenClient, HttpLink, HttpLinkOptions};
//!
//! # async fn run() -> eden_link::Result<()> {
//! let http = HttpLinkOptions::builder("http://localhost:3000/api").build()?;
//! let client = EdenClient::builder().link(HttpLink::new(http)).build()?;
//! let users = client.get("/users").query("limit", 10).send().await?;
//! println!("{}", users.data);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod batch;
pub mod client;
pub mod compression;
pub mod error;
pub mod event_handlers;
pub mod fetch;
pub mod links;
pub mod models;
pub mod observable;
pub mod sse;
pub mod timeouts;
pub mod ws;

pub use auth::{AuthProvider, DynamicAuthProvider};
pub use client::{CallOptions, EdenClient, EdenClientBuilder, RequestBuilder, SubscriptionObserver};
pub use error::{EdenLinkError, Result};
pub use event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
pub use fetch::{Fetcher, HttpBody, HttpRequest, HttpResponse, ReqwestFetcher};
pub use links::{
    create_chain, link, HttpBatchLink, HttpBatchLinkOptions, HttpLink, HttpLinkOptions,
    HttpSubscriptionLink, Link, LinkObservable, LoggerLink, Next, RetryLink, RetryLinkOptions,
    SplitLink, WsLink,
};
pub use models::{
    ConnectionOptions, ConnectionState, EdenResponse, FilePart, FormValue, HttpMethod, LinkResult,
    Operation, OperationContext, OperationType, Payload, RequestBody, RequestParams,
};
pub use observable::{first_value, BehaviorSubject, Observable, Observer, Subscription};
pub use sse::{SseOptions, SseStreamConsumer};
pub use timeouts::EdenLinkTimeouts;
pub use ws::{WebSocketClient, WebSocketClientOptions};
