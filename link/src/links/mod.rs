//! Links: composable middleware and terminal transports.
//!
//! Terminal links: [`HttpLink`], [`HttpBatchLink`], [`HttpSubscriptionLink`],
//! [`WsLink`]. Middleware: [`RetryLink`], [`LoggerLink`], [`SplitLink`].

pub mod chain;
pub mod http;
pub mod http_batch;
pub mod http_subscription;
pub mod logger;
pub mod retry;
pub mod split;
pub mod ws;

pub use chain::{create_chain, link, Link, LinkObservable, Next};
pub use http::{build_url, encode_body, HttpLink, HttpLinkOptions, HttpLinkOptionsBuilder};
pub use http_batch::{HttpBatchLink, HttpBatchLinkOptions, HttpBatchLoader};
pub use http_subscription::{HttpSubscriptionLink, LAST_EVENT_ID_KEY};
pub use logger::{LogDirection, LogEntry, LoggerLink};
pub use retry::{RetryAttempt, RetryLink, RetryLinkOptions};
pub use split::SplitLink;
pub use ws::WsLink;
