//! Link composition.
//!
//! A chain is an ordered list of [`Link`]s. Each link receives the
//! operation and a [`Next`] handle that runs the rest of the chain; the
//! last link (HTTP, batch, WebSocket, SSE) answers without calling `next`.

use crate::{
    error::EdenLinkError,
    models::{LinkResult, Operation},
    observable::{operators::forward_to, Observable},
};
use std::sync::Arc;

/// Stream of results produced for one operation.
pub type LinkObservable = Observable<LinkResult, EdenLinkError>;

/// Middleware or terminal transport in a chain.
pub trait Link: Send + Sync + 'static {
    /// Handle `op`. Non-terminal links delegate through `next`.
    fn run(&self, op: Operation, next: Next) -> LinkObservable;
}

impl<F> Link for F
where
    F: Fn(Operation, Next) -> LinkObservable + Send + Sync + 'static,
{
    fn run(&self, op: Operation, next: Next) -> LinkObservable {
        self(op, next)
    }
}

/// Remaining links after the current one.
#[derive(Clone)]
pub struct Next {
    links: Arc<[Arc<dyn Link>]>,
    index: usize,
}

impl Next {
    /// Run the next link. Running off the end of the chain is a
    /// configuration error surfaced on the observable.
    pub fn run(&self, op: Operation) -> LinkObservable {
        match self.links.get(self.index) {
            Some(link) => link.run(
                op,
                Next {
                    links: self.links.clone(),
                    index: self.index + 1,
                },
            ),
            None => Observable::error(EdenLinkError::ConfigurationError(
                "No more links to execute - did you forget a terminal link?".to_string(),
            )),
        }
    }
}

/// Compose `links` for `op`. Nothing runs until the result is subscribed.
pub fn create_chain(links: Arc<[Arc<dyn Link>]>, op: Operation) -> LinkObservable {
    Observable::new(move |subscriber| {
        let next = Next {
            links: links.clone(),
            index: 0,
        };
        next.run(op.clone())
            .subscribe(forward_to(&subscriber))
            .into()
    })
}

/// Turn a link into the shared form used by chains.
pub fn link(l: impl Link) -> Arc<dyn Link> {
    Arc::new(l)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OperationType, RequestParams};
    use crate::observable::{first_value, Observer};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn op(path: &str) -> Operation {
        Operation::new(1, OperationType::Query, path, RequestParams::get())
    }

    fn terminal() -> Arc<dyn Link> {
        link(|op: Operation, _next: Next| LinkObservable::of(vec![LinkResult::data(json!(op.path))]))
    }

    #[tokio::test]
    async fn test_links_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        let links: Arc<[Arc<dyn Link>]> = vec![
            link(move |op: Operation, next: Next| {
                a.lock().push("a");
                next.run(op)
            }),
            link(move |mut op: Operation, next: Next| {
                b.lock().push("b");
                op.path = format!("{}/rewritten", op.path);
                next.run(op)
            }),
            terminal(),
        ]
        .into();

        let result = first_value(create_chain(links, op("/x")), None).await.unwrap();
        assert_eq!(result, LinkResult::data(json!("/x/rewritten")));
        assert_eq!(*order.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_missing_terminal_link_errors() {
        let links: Arc<[Arc<dyn Link>]> =
            vec![link(|op: Operation, next: Next| next.run(op))].into();
        let err = first_value(create_chain(links, op("/x")), None).await.unwrap_err();
        assert!(matches!(err, EdenLinkError::ConfigurationError(m) if m.contains("terminal link")));
    }

    #[test]
    fn test_chain_is_lazy() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let links: Arc<[Arc<dyn Link>]> = vec![link(move |_op: Operation, _next: Next| {
            r.store(true, Ordering::SeqCst);
            LinkObservable::of(vec![])
        })]
        .into();
        let chain = create_chain(links, op("/x"));
        assert!(!ran.load(Ordering::SeqCst));
        chain.subscribe(Observer::new());
        assert!(ran.load(Ordering::SeqCst));
    }
}
