//! Collect-then-dispatch batching.
//!
//! Every [`DataLoader::load`] issued before the loader's dispatch point
//! lands in the same window. The window closes one scheduler tick plus the
//! configured delay after its first load; the delay lets loads issued from
//! other worker threads of a multi-thread runtime join it. The window is cut into
//! groups that [`BatchLoader::validate`] accepts, and each group is handed
//! to [`BatchLoader::fetch`] as one call.

use crate::error::{EdenLinkError, Result};
use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Default delay between the first load of a window and its dispatch.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(1);

/// Executes one group of keys.
#[async_trait::async_trait]
pub trait BatchLoader: Send + Sync + 'static {
    /// Item identifying one load.
    type Key: Send + Sync + 'static;
    /// Result of one load.
    type Value: Send + 'static;

    /// Whether `keys` may travel together. Called with a growing group; a
    /// `false` closes the current group. A single key that fails validation
    /// is rejected with [`EdenLinkError::BatchInputTooLargeError`].
    fn validate(&self, _keys: &[&Self::Key]) -> bool {
        true
    }

    /// Fetch a group, settling slot `i` for `keys[i]`. An `Err` rejects
    /// every slot not settled yet.
    async fn fetch(&self, keys: Vec<Self::Key>, resolver: &BatchResolver<Self::Value>) -> Result<()>;
}

type Slot<V> = Option<oneshot::Sender<Result<V>>>;

/// Settles the slots of one dispatched group. Slots may be settled in any
/// order; each one at most once.
pub struct BatchResolver<V> {
    slots: Arc<Mutex<Vec<Slot<V>>>>,
}

impl<V> Clone for BatchResolver<V> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<V> fmt::Debug for BatchResolver<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("BatchResolver")
            .field("len", &slots.len())
            .field("open", &slots.iter().filter(|s| s.is_some()).count())
            .finish()
    }
}

impl<V> BatchResolver<V> {
    pub(crate) fn new(senders: Vec<oneshot::Sender<Result<V>>>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(senders.into_iter().map(Some).collect())),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the group is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Settle slot `index`. Returns `false` if it is out of range or was
    /// already settled.
    pub fn resolve(&self, index: usize, result: Result<V>) -> bool {
        let sender = self.slots.lock().get_mut(index).and_then(Option::take);
        match sender {
            Some(tx) => {
                // A caller that gave up dropped its receiver.
                let _ = tx.send(result);
                true
            },
            None => false,
        }
    }

    /// Reject every slot still open.
    pub fn reject_remaining(&self, error: &EdenLinkError) {
        let open: Vec<_> = self.slots.lock().iter_mut().filter_map(Option::take).collect();
        for tx in open {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Whether every slot is settled.
    pub fn is_settled(&self) -> bool {
        self.slots.lock().iter().all(Option::is_none)
    }
}

struct QueuedLoad<K, V> {
    key: K,
    signal: Option<CancellationToken>,
    tx: oneshot::Sender<Result<V>>,
}

struct LoaderInner<L: BatchLoader> {
    loader: L,
    queue: Mutex<Vec<QueuedLoad<L::Key, L::Value>>>,
    scheduled: AtomicBool,
    window: Duration,
}

/// Batching front of a [`BatchLoader`]. Cheap to clone.
pub struct DataLoader<L: BatchLoader> {
    inner: Arc<LoaderInner<L>>,
}

impl<L: BatchLoader> Clone for DataLoader<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: BatchLoader> fmt::Debug for DataLoader<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoader")
            .field("queued", &self.inner.queue.lock().len())
            .field("window", &self.inner.window)
            .finish()
    }
}

impl<L: BatchLoader> DataLoader<L> {
    /// Wrap `loader` with the [`DEFAULT_BATCH_WINDOW`].
    pub fn new(loader: L) -> Self {
        Self::with_window(loader, DEFAULT_BATCH_WINDOW)
    }

    /// Wrap `loader`, dispatching `window` after the first load of a
    /// window. [`Duration::ZERO`] dispatches after one scheduler tick.
    pub fn with_window(loader: L, window: Duration) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                loader,
                queue: Mutex::new(Vec::new()),
                scheduled: AtomicBool::new(false),
                window,
            }),
        }
    }

    /// The wrapped loader.
    pub fn loader(&self) -> &L {
        &self.inner.loader
    }

    /// Queue `key` for the current window.
    ///
    /// The key is registered immediately; the returned future only waits
    /// for its slot. A load whose `signal` is cancelled, or whose future is
    /// dropped, before dispatch is removed from the window. Once dispatched,
    /// the group's request is only aborted when every member's signal is
    /// cancelled.
    pub fn load(
        &self,
        key: L::Key,
        signal: Option<CancellationToken>,
    ) -> impl Future<Output = Result<L::Value>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.inner.queue.lock().push(QueuedLoad { key, signal, tx });
        self.inner.schedule();
        rx.map(|settled| settled.unwrap_or(Err(EdenLinkError::Cancelled)))
    }
}

impl<L: BatchLoader> LoaderInner<L> {
    fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            // Every load of the current tick joins the window first.
            tokio::task::yield_now().await;
            if !inner.window.is_zero() {
                tokio::time::sleep(inner.window).await;
            }
            inner.dispatch();
        });
    }

    fn dispatch(self: Arc<Self>) {
        self.scheduled.store(false, Ordering::SeqCst);
        let queued = std::mem::take(&mut *self.queue.lock());

        let mut groups: Vec<Vec<QueuedLoad<L::Key, L::Value>>> = Vec::new();
        let mut current: Vec<QueuedLoad<L::Key, L::Value>> = Vec::new();
        for item in queued {
            if item.tx.is_closed() || item.signal.as_ref().is_some_and(|s| s.is_cancelled()) {
                let _ = item.tx.send(Err(EdenLinkError::Cancelled));
                continue;
            }
            let fits = {
                let keys: Vec<&L::Key> =
                    current.iter().map(|q| &q.key).chain(std::iter::once(&item.key)).collect();
                self.loader.validate(&keys)
            };
            if fits {
                current.push(item);
                continue;
            }
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                if self.loader.validate(&[&item.key]) {
                    current.push(item);
                    continue;
                }
            }
            let _ = item.tx.send(Err(EdenLinkError::BatchInputTooLargeError(
                "Input is too big for a single dispatch".to_string(),
            )));
        }
        if !current.is_empty() {
            groups.push(current);
        }

        for group in groups {
            tokio::spawn(self.clone().run_group(group));
        }
    }

    async fn run_group(self: Arc<Self>, group: Vec<QueuedLoad<L::Key, L::Value>>) {
        let mut keys = Vec::with_capacity(group.len());
        let mut senders = Vec::with_capacity(group.len());
        let mut signals = Vec::with_capacity(group.len());
        for item in group {
            keys.push(item.key);
            senders.push(item.tx);
            signals.push(item.signal);
        }
        log::debug!("[EDEN_BATCH] Dispatching group of {}", keys.len());
        let resolver = BatchResolver::new(senders);

        let outcome = tokio::select! {
            res = self.loader.fetch(keys, &resolver) => res,
            _ = all_abort_signals(signals) => Err(EdenLinkError::Cancelled),
        };
        match outcome {
            Ok(()) if !resolver.is_settled() => {
                resolver.reject_remaining(&EdenLinkError::SerializationError(
                    "Batch response is missing results".to_string(),
                ));
            },
            Ok(()) => {},
            Err(e) => {
                log::debug!("[EDEN_BATCH] Group failed: {}", e);
                resolver.reject_remaining(&e);
            },
        }
    }
}

/// Future resolving once every signal is cancelled. Never resolves when a
/// member has no signal or the list is empty.
pub fn all_abort_signals(signals: Vec<Option<CancellationToken>>) -> BoxFuture<'static, ()> {
    let tokens: Option<Vec<CancellationToken>> = signals.into_iter().collect();
    match tokens {
        Some(tokens) if !tokens.is_empty() => {
            future::join_all(tokens.into_iter().map(|t| t.cancelled_owned()))
                .map(|_| ())
                .boxed()
        },
        _ => future::pending().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Doubles every key; groups hold at most `max` keys.
    struct Doubler {
        max: usize,
        calls: Mutex<Vec<Vec<u32>>>,
        fail: bool,
    }

    impl Doubler {
        fn new(max: usize) -> Self {
            Self {
                max,
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl BatchLoader for Doubler {
        type Key = u32;
        type Value = u32;

        fn validate(&self, keys: &[&u32]) -> bool {
            keys.len() <= self.max && keys.iter().all(|k| **k < 1000)
        }

        async fn fetch(&self, keys: Vec<u32>, resolver: &BatchResolver<u32>) -> Result<()> {
            self.calls.lock().push(keys.clone());
            if self.fail {
                return Err(EdenLinkError::TransportError("down".into()));
            }
            // Settle in reverse to show order does not matter.
            for (i, key) in keys.iter().enumerate().rev() {
                resolver.resolve(i, Ok(key * 2));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_same_tick_loads_share_one_fetch() {
        let loader = DataLoader::new(Doubler::new(10));
        let a = loader.load(1, None);
        let b = loader.load(2, None);
        let c = loader.load(3, None);
        let (a, b, c) = tokio::join!(a, b, c);
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (2, 4, 6));
        assert_eq!(*loader.loader().calls.lock(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_zero_window_dispatches_after_one_tick() {
        let loader = DataLoader::with_window(Doubler::new(10), Duration::ZERO);
        let (a, b) = tokio::join!(loader.load(1, None), loader.load(2, None));
        assert_eq!((a.unwrap(), b.unwrap()), (2, 4));
        assert_eq!(*loader.loader().calls.lock(), vec![vec![1, 2]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_window_coalesces_on_multi_thread_runtime() {
        let loader = DataLoader::new(Doubler::new(100));
        for round in 0..20u32 {
            let loads: Vec<_> = (0..50).map(|k| loader.load(round * 50 + k, None)).collect();
            let results = future::join_all(loads).await;
            assert!(results.iter().all(|r| r.is_ok()));
        }
        assert_eq!(loader.loader().calls.lock().len(), 20);
    }

    #[tokio::test]
    async fn test_validation_splits_window() {
        let loader = DataLoader::new(Doubler::new(2));
        let loads: Vec<_> = (1..=5).map(|k| loader.load(k, None)).collect();
        let results: Vec<u32> = future::join_all(loads)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(results, vec![2, 4, 6, 8, 10]);
        let mut calls = loader.loader().calls.lock().clone();
        calls.sort();
        assert_eq!(calls, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn test_oversized_single_key_is_rejected() {
        let loader = DataLoader::new(Doubler::new(10));
        let big = loader.load(5000, None);
        let small = loader.load(7, None);
        assert!(matches!(big.await, Err(EdenLinkError::BatchInputTooLargeError(_))));
        assert_eq!(small.await.unwrap(), 14);
    }

    #[tokio::test]
    async fn test_failure_rejects_every_member() {
        let mut doubler = Doubler::new(10);
        doubler.fail = true;
        let loader = DataLoader::new(doubler);
        let (a, b) = tokio::join!(loader.load(1, None), loader.load(2, None));
        assert_eq!(a.unwrap_err(), EdenLinkError::TransportError("down".into()));
        assert_eq!(b.unwrap_err(), EdenLinkError::TransportError("down".into()));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_leaves_window() {
        let loader = DataLoader::new(Doubler::new(10));
        let token = CancellationToken::new();
        let aborted = loader.load(1, Some(token.clone()));
        let kept = loader.load(2, None);
        token.cancel();
        assert_eq!(aborted.await.unwrap_err(), EdenLinkError::Cancelled);
        assert_eq!(kept.await.unwrap(), 4);
        assert_eq!(*loader.loader().calls.lock(), vec![vec![2]]);
    }

    #[tokio::test]
    async fn test_all_abort_signals() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let waiter = tokio::spawn(all_abort_signals(vec![Some(a.clone()), Some(b.clone())]).map(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));
        a.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        b.cancel();
        waiter.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let never = all_abort_signals(vec![Some(CancellationToken::new()), None]);
        assert!(tokio::time::timeout(Duration::from_millis(10), never).await.is_err());
    }
}
