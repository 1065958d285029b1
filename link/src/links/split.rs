//! Link routing operations to one of two sub-chains.

use super::chain::{create_chain, Link, LinkObservable, Next};
use crate::models::Operation;
use std::fmt;
use std::sync::Arc;

type ConditionFn = dyn Fn(&Operation) -> bool + Send + Sync;

/// Runs `true_links` when the condition holds, `false_links` otherwise.
/// Both branches must end with a terminal link; the outer `next` is not
/// used.
#[derive(Clone)]
pub struct SplitLink {
    condition: Arc<ConditionFn>,
    true_links: Arc<[Arc<dyn Link>]>,
    false_links: Arc<[Arc<dyn Link>]>,
}

impl fmt::Debug for SplitLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitLink")
            .field("true_links", &self.true_links.len())
            .field("false_links", &self.false_links.len())
            .finish_non_exhaustive()
    }
}

impl SplitLink {
    /// Split on `condition`.
    pub fn new(
        condition: impl Fn(&Operation) -> bool + Send + Sync + 'static,
        true_links: Vec<Arc<dyn Link>>,
        false_links: Vec<Arc<dyn Link>>,
    ) -> Self {
        Self {
            condition: Arc::new(condition),
            true_links: true_links.into(),
            false_links: false_links.into(),
        }
    }
}

impl Link for SplitLink {
    fn run(&self, op: Operation, _next: Next) -> LinkObservable {
        let links = if (self.condition)(&op) {
            self.true_links.clone()
        } else {
            self.false_links.clone()
        };
        create_chain(links, op)
    }
}
