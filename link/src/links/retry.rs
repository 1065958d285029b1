//! Link re-running failed operations.

use super::chain::{Link, LinkObservable, Next};
use super::http_subscription::LAST_EVENT_ID_KEY;
use crate::{
    error::EdenLinkError,
    models::{LinkResult, Operation, OperationType},
    observable::{Observable, Observer, Subscriber, Subscription, Teardown},
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A failed attempt, handed to the retry predicate.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// Operation as it was sent
    pub op: Operation,
    /// Why it failed
    pub error: EdenLinkError,
    /// Attempts made so far, starting at 1
    pub attempts: u32,
}

type RetryFn = dyn Fn(&RetryAttempt) -> bool + Send + Sync;
type DelayFn = dyn Fn(u32) -> u64 + Send + Sync;

/// Settings of [`RetryLink`].
#[derive(Clone)]
pub struct RetryLinkOptions {
    retry: Arc<RetryFn>,
    retry_delay_ms: Arc<DelayFn>,
}

impl fmt::Debug for RetryLinkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLinkOptions").finish_non_exhaustive()
    }
}

impl RetryLinkOptions {
    /// Retry while `retry` returns true, immediately.
    pub fn new(retry: impl Fn(&RetryAttempt) -> bool + Send + Sync + 'static) -> Self {
        Self {
            retry: Arc::new(retry),
            retry_delay_ms: Arc::new(|_| 0),
        }
    }

    /// Wait `f(attempts)` ms before the next attempt.
    pub fn retry_delay_ms(mut self, f: impl Fn(u32) -> u64 + Send + Sync + 'static) -> Self {
        self.retry_delay_ms = Arc::new(f);
        self
    }
}

/// Re-runs the rest of the chain when it errors and the predicate agrees.
///
/// Subscriptions resume: the id of the last tracked data result is put
/// into the operation context under `lastEventId` for the next attempt.
#[derive(Debug, Clone)]
pub struct RetryLink {
    options: RetryLinkOptions,
}

impl RetryLink {
    /// Link with `options`.
    pub fn new(options: RetryLinkOptions) -> Self {
        Self { options }
    }
}

struct RetryRun {
    op: Operation,
    next: Next,
    options: RetryLinkOptions,
    subscriber: Subscriber<LinkResult, EdenLinkError>,
    current: Mutex<Option<Subscription>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    last_event_id: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl RetryRun {
    fn attempt(self: &Arc<Self>, attempts: u32) {
        let mut op = self.op.clone();
        if op.kind == OperationType::Subscription {
            if let Some(id) = self.last_event_id.lock().clone() {
                op.context.insert(LAST_EVENT_ID_KEY, serde_json::Value::String(id));
            }
        }

        let on_next = self.clone();
        let on_error = self.clone();
        let on_complete = self.clone();
        let sent = op.clone();
        let subscription = self.next.run(op).subscribe(
            Observer::new()
                .on_next(move |result: LinkResult| {
                    if let LinkResult::Data { id: Some(id), .. } = &result {
                        *on_next.last_event_id.lock() = Some(id.clone());
                    }
                    on_next.subscriber.next(result);
                })
                .on_error(move |error| on_error.failed(&sent, error, attempts))
                .on_complete(move || on_complete.subscriber.complete()),
        );
        if !subscription.is_closed() {
            *self.current.lock() = Some(subscription);
        }
        if self.closed.load(Ordering::SeqCst) {
            self.stop();
        }
    }

    fn failed(self: &Arc<Self>, op: &Operation, error: EdenLinkError, attempts: u32) {
        let attempt = RetryAttempt {
            op: op.clone(),
            error,
            attempts,
        };
        if self.closed.load(Ordering::SeqCst) || !(self.options.retry)(&attempt) {
            self.subscriber.error(attempt.error);
            return;
        }
        let delay = (self.options.retry_delay_ms)(attempts);
        log::debug!(
            "[eden-link] Retrying {} #{} {} in {}ms (attempt {}): {}",
            op.kind,
            op.id,
            op.path,
            delay,
            attempts + 1,
            attempt.error
        );
        let run = self.clone();
        let timer = tokio::spawn(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if !run.closed.load(Ordering::SeqCst) {
                run.attempt(attempts + 1);
            }
        });
        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.abort();
        }
    }

    fn stop(&self) {
        if let Some(subscription) = self.current.lock().take() {
            subscription.unsubscribe();
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

impl Link for RetryLink {
    fn run(&self, op: Operation, next: Next) -> LinkObservable {
        let options = self.options.clone();
        Observable::new(move |subscriber| {
            let run = Arc::new(RetryRun {
                op: op.clone(),
                next: next.clone(),
                options: options.clone(),
                subscriber,
                current: Mutex::new(None),
                timer: Mutex::new(None),
                last_event_id: Mutex::new(None),
                closed: AtomicBool::new(false),
            });
            run.attempt(1);
            Teardown::new(move || {
                run.closed.store(true, Ordering::SeqCst);
                run.stop();
            })
        })
    }
}
