//! Minimal push-based reactive primitive.
//!
//! Every request in eden-link is represented as an [`Observable`]: the
//! link chain composes them, terminal links produce them, and the client
//! consumes them. The implementation is intentionally small:
//!
//! - [`Observable::subscribe`] runs the producer synchronously and returns
//!   a [`Subscription`]. Nothing happens before `subscribe`.
//! - Producers receive a [`Subscriber`] that silently drops emissions once
//!   it has errored, completed or been unsubscribed.
//! - The [`Teardown`] returned by the producer runs exactly once, whichever
//!   of `error`, `complete` or `unsubscribe` happens first.
//!
//! Operators live in [`operators`]; [`BehaviorSubject`] holds a current
//! value (used for connection state).

pub mod behavior_subject;
pub mod operators;

pub use behavior_subject::BehaviorSubject;
pub use operators::{first_value, Tap};

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type NextCallback<T> = Arc<dyn Fn(T) + Send + Sync>;
type ErrorCallback<E> = Arc<dyn Fn(E) + Send + Sync>;
type CompleteCallback = Arc<dyn Fn() + Send + Sync>;
type Producer<T, E> = Arc<dyn Fn(Subscriber<T, E>) -> Teardown + Send + Sync>;

/// Set of optional callbacks receiving the values of an [`Observable`].
pub struct Observer<T, E> {
    next: Option<NextCallback<T>>,
    error: Option<ErrorCallback<E>>,
    complete: Option<CompleteCallback>,
}

impl<T, E> Clone for Observer<T, E> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            error: self.error.clone(),
            complete: self.complete.clone(),
        }
    }
}

impl<T, E> Default for Observer<T, E> {
    fn default() -> Self {
        Self {
            next: None,
            error: None,
            complete: None,
        }
    }
}

impl<T, E> fmt::Debug for Observer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("next", &self.next.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .finish()
    }
}

impl<T, E> Observer<T, E> {
    /// Create an observer with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the value callback.
    pub fn on_next(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.next = Some(Arc::new(f));
        self
    }

    /// Register the error callback.
    pub fn on_error(mut self, f: impl Fn(E) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    /// Register the completion callback.
    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_next(&self, value: T) {
        if let Some(cb) = &self.next {
            cb(value);
        }
    }

    pub(crate) fn emit_error(&self, error: E) {
        if let Some(cb) = &self.error {
            cb(error);
        }
    }

    pub(crate) fn emit_complete(&self) {
        if let Some(cb) = &self.complete {
            cb();
        }
    }
}

/// Cleanup logic returned by a producer.
pub struct Teardown(Option<Box<dyn FnOnce() + Send>>);

impl Teardown {
    /// Teardown running `f`.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// Teardown that does nothing.
    pub fn noop() -> Self {
        Self(None)
    }

    fn run(self) {
        if let Some(f) = self.0 {
            f();
        }
    }
}

impl From<Subscription> for Teardown {
    fn from(subscription: Subscription) -> Self {
        Teardown::new(move || subscription.unsubscribe())
    }
}

enum TeardownSlot {
    /// Producer is still running.
    Waiting,
    Registered(Teardown),
    /// Finalized; a late teardown must run immediately.
    Done,
}

struct SubscriberInner<T, E> {
    observer: Observer<T, E>,
    closed: AtomicBool,
    teardown: Mutex<TeardownSlot>,
}

impl<T, E> SubscriberInner<T, E> {
    fn finalize(&self) {
        let slot = std::mem::replace(&mut *self.teardown.lock(), TeardownSlot::Done);
        if let TeardownSlot::Registered(teardown) = slot {
            teardown.run();
        }
    }

    fn set_teardown(&self, teardown: Teardown) {
        let mut slot = self.teardown.lock();
        match *slot {
            TeardownSlot::Done => {
                drop(slot);
                teardown.run();
            },
            _ => *slot = TeardownSlot::Registered(teardown),
        }
    }
}

trait Closable: Send + Sync {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

impl<T, E> Closable for SubscriberInner<T, E> {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.finalize();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Sink handed to a producer. Emissions after a terminal event are ignored.
pub struct Subscriber<T, E> {
    inner: Arc<SubscriberInner<T, E>>,
}

impl<T, E> Clone for Subscriber<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Subscriber<T, E> {
    /// Push a value.
    pub fn next(&self, value: T) {
        if !self.inner.closed.load(Ordering::SeqCst) {
            self.inner.observer.emit_next(value);
        }
    }

    /// Terminate with an error and run the teardown.
    pub fn error(&self, error: E) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.observer.emit_error(error);
            self.inner.finalize();
        }
    }

    /// Terminate successfully and run the teardown.
    pub fn complete(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.observer.emit_complete();
            self.inner.finalize();
        }
    }

    /// Whether the subscriber has terminated or been unsubscribed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Handle returned by [`Observable::subscribe`].
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<dyn Closable>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Subscription {
    /// Stop receiving values. Idempotent: the producer's teardown runs once.
    pub fn unsubscribe(&self) {
        self.inner.close();
    }

    /// Whether the subscription has ended (terminal event or unsubscribe).
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Lazy, push-based stream of `T` values that may fail with `E`.
pub struct Observable<T, E> {
    producer: Producer<T, E>,
}

impl<T, E> Clone for Observable<T, E> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
        }
    }
}

impl<T: Send + 'static, E: Send + 'static> Observable<T, E> {
    /// Wrap a producer. It runs once per `subscribe` call.
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn(Subscriber<T, E>) -> Teardown + Send + Sync + 'static,
    {
        Self {
            producer: Arc::new(producer),
        }
    }

    /// Observable that fails immediately on subscribe.
    pub fn error(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::new(move |subscriber| {
            subscriber.error(error.clone());
            Teardown::noop()
        })
    }

    /// Observable emitting `values` and completing.
    pub fn of(values: Vec<T>) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(move |subscriber| {
            for value in &values {
                subscriber.next(value.clone());
            }
            subscriber.complete();
            Teardown::noop()
        })
    }

    /// Observable running a fresh future per subscription.
    ///
    /// The future is driven on a tokio task and aborted on unsubscribe.
    pub fn from_future<F, Fut>(make: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        Self::new(move |subscriber| {
            let fut = make();
            let handle = tokio::spawn(async move {
                match fut.await {
                    Ok(value) => {
                        subscriber.next(value);
                        subscriber.complete();
                    },
                    Err(error) => subscriber.error(error),
                }
            });
            Teardown::new(move || handle.abort())
        })
    }

    /// Start the producer and deliver its values to `observer`.
    ///
    /// A panic inside the producer propagates to the caller.
    pub fn subscribe(&self, observer: Observer<T, E>) -> Subscription {
        let inner = Arc::new(SubscriberInner {
            observer,
            closed: AtomicBool::new(false),
            teardown: Mutex::new(TeardownSlot::Waiting),
        });
        let subscriber = Subscriber {
            inner: inner.clone(),
        };
        let teardown = (self.producer)(subscriber);
        inner.set_teardown(teardown);
        Subscription { inner }
    }

    /// Apply an operator: `obs.pipe(|o| o.map(f))`.
    pub fn pipe<R>(self, operator: impl FnOnce(Self) -> R) -> R {
        operator(self)
    }
}
