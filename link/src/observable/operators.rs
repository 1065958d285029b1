//! Operators over [`Observable`].

use super::{Observable, Observer, Subscriber, Subscription, Teardown};
use crate::error::{EdenLinkError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

type TapNext<T> = Arc<dyn Fn(&T) + Send + Sync>;
type TapError<E> = Arc<dyn Fn(&E) + Send + Sync>;
type TapComplete = Arc<dyn Fn() + Send + Sync>;

/// Side effects for [`Observable::tap`]. Values pass through unchanged.
pub struct Tap<T, E> {
    next: Option<TapNext<T>>,
    error: Option<TapError<E>>,
    complete: Option<TapComplete>,
}

impl<T, E> Default for Tap<T, E> {
    fn default() -> Self {
        Self {
            next: None,
            error: None,
            complete: None,
        }
    }
}

impl<T, E> Tap<T, E> {
    /// Empty tap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect each value.
    pub fn next(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.next = Some(Arc::new(f));
        self
    }

    /// Inspect the error.
    pub fn error(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    /// Observe completion.
    pub fn complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Arc::new(f));
        self
    }
}

/// Observer forwarding every event of a source into `subscriber`.
pub(crate) fn forward_to<T, E>(subscriber: &Subscriber<T, E>) -> Observer<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let on_next = subscriber.clone();
    let on_error = subscriber.clone();
    let on_complete = subscriber.clone();
    Observer::new()
        .on_next(move |v| on_next.next(v))
        .on_error(move |e| on_error.error(e))
        .on_complete(move || on_complete.complete())
}

impl<T: Send + 'static, E: Send + 'static> Observable<T, E> {
    /// Transform each value.
    pub fn map<U, F>(self, f: F) -> Observable<U, E>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Observable::new(move |subscriber: Subscriber<U, E>| {
            let f = f.clone();
            let on_next = subscriber.clone();
            let on_error = subscriber.clone();
            let on_complete = subscriber;
            self.subscribe(
                Observer::new()
                    .on_next(move |v| on_next.next(f(v)))
                    .on_error(move |e| on_error.error(e))
                    .on_complete(move || on_complete.complete()),
            )
            .into()
        })
    }

    /// Drop values not matching `predicate`.
    pub fn filter<F>(self, predicate: F) -> Observable<T, E>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Observable::new(move |subscriber: Subscriber<T, E>| {
            let predicate = predicate.clone();
            let on_next = subscriber.clone();
            let on_error = subscriber.clone();
            let on_complete = subscriber;
            self.subscribe(
                Observer::new()
                    .on_next(move |v| {
                        if predicate(&v) {
                            on_next.next(v);
                        }
                    })
                    .on_error(move |e| on_error.error(e))
                    .on_complete(move || on_complete.complete()),
            )
            .into()
        })
    }

    /// Run side effects, forwarding every value and error unchanged.
    pub fn tap(self, tap: Tap<T, E>) -> Observable<T, E> {
        let tap = Arc::new(tap);
        Observable::new(move |subscriber: Subscriber<T, E>| {
            let (t1, t2, t3) = (tap.clone(), tap.clone(), tap.clone());
            let on_next = subscriber.clone();
            let on_error = subscriber.clone();
            let on_complete = subscriber;
            self.subscribe(
                Observer::new()
                    .on_next(move |v| {
                        if let Some(f) = &t1.next {
                            f(&v);
                        }
                        on_next.next(v);
                    })
                    .on_error(move |e| {
                        if let Some(f) = &t2.error {
                            f(&e);
                        }
                        on_error.error(e);
                    })
                    .on_complete(move || {
                        if let Some(f) = &t3.complete {
                            f();
                        }
                        on_complete.complete();
                    }),
            )
            .into()
        })
    }

    /// Multicast the source with ref-counting.
    ///
    /// The first subscriber starts the source, the last unsubscribe tears it
    /// down. Late subscribers only see new emissions. After the source
    /// terminates the next subscriber starts it again.
    pub fn share(self) -> Observable<T, E>
    where
        T: Clone,
        E: Clone,
    {
        let state = Arc::new(Mutex::new(ShareState::<T, E> {
            observers: Vec::new(),
            source: None,
            next_id: 0,
            epoch: 0,
        }));

        Observable::new(move |subscriber: Subscriber<T, E>| {
            let (id, connect_epoch) = {
                let mut st = state.lock();
                let id = st.next_id;
                st.next_id += 1;
                st.observers.push((id, subscriber.clone()));
                let connect = if st.source.is_none() && st.observers.len() == 1 {
                    st.epoch += 1;
                    Some(st.epoch)
                } else {
                    None
                };
                (id, connect)
            };

            if let Some(epoch) = connect_epoch {
                let subscription = self.subscribe(share_fanout(state.clone(), epoch));
                let mut st = state.lock();
                if st.epoch == epoch && !subscription.is_closed() && !st.observers.is_empty() {
                    st.source = Some(subscription);
                } else {
                    drop(st);
                    subscription.unsubscribe();
                }
            }

            let state = state.clone();
            Teardown::new(move || {
                let source = {
                    let mut st = state.lock();
                    st.observers.retain(|(oid, _)| *oid != id);
                    if st.observers.is_empty() {
                        st.epoch += 1;
                        st.source.take()
                    } else {
                        None
                    }
                };
                if let Some(source) = source {
                    source.unsubscribe();
                }
            })
        })
    }
}

struct ShareState<T, E> {
    observers: Vec<(u64, Subscriber<T, E>)>,
    source: Option<Subscription>,
    next_id: u64,
    /// Bumped on each (re)connect and teardown so stale source events are ignored.
    epoch: u64,
}

fn share_fanout<T, E>(state: Arc<Mutex<ShareState<T, E>>>, epoch: u64) -> Observer<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let s_next = state.clone();
    let s_error = state.clone();
    let s_complete = state;

    // Terminal events detach every current observer and reset the source so
    // the next subscriber reconnects.
    fn take_all<T, E>(
        state: &Mutex<ShareState<T, E>>,
        epoch: u64,
    ) -> Vec<(u64, Subscriber<T, E>)> {
        let mut st = state.lock();
        if st.epoch != epoch {
            return Vec::new();
        }
        st.epoch += 1;
        st.source = None;
        std::mem::take(&mut st.observers)
    }

    Observer::new()
        .on_next(move |value: T| {
            let observers = {
                let st = s_next.lock();
                if st.epoch != epoch {
                    return;
                }
                st.observers.clone()
            };
            for (_, observer) in observers {
                observer.next(value.clone());
            }
        })
        .on_error(move |error: E| {
            for (_, observer) in take_all(&s_error, epoch) {
                observer.error(error.clone());
            }
        })
        .on_complete(move || {
            for (_, observer) in take_all(&s_complete, epoch) {
                observer.complete();
            }
        })
}

/// Subscribe, resolve with the first value and unsubscribe.
///
/// Rejects with the observable's error, or with
/// [`EdenLinkError::Cancelled`] when the source completes without a value
/// or `signal` fires first.
pub async fn first_value<T>(
    observable: Observable<T, EdenLinkError>,
    signal: Option<CancellationToken>,
) -> Result<T>
where
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel::<Result<T>>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let (tx_next, tx_error, tx_complete) = (tx.clone(), tx.clone(), tx);

    let subscription = observable.subscribe(
        Observer::new()
            .on_next(move |v| {
                if let Some(tx) = tx_next.lock().take() {
                    let _ = tx.send(Ok(v));
                }
            })
            .on_error(move |e| {
                if let Some(tx) = tx_error.lock().take() {
                    let _ = tx.send(Err(e));
                }
            })
            .on_complete(move || {
                if let Some(tx) = tx_complete.lock().take() {
                    let _ = tx.send(Err(EdenLinkError::Cancelled));
                }
            }),
    );

    let outcome = match signal {
        Some(signal) => tokio::select! {
            res = rx => res.unwrap_or(Err(EdenLinkError::Cancelled)),
            _ = signal.cancelled() => Err(EdenLinkError::Cancelled),
        },
        None => rx.await.unwrap_or(Err(EdenLinkError::Cancelled)),
    };
    subscription.unsubscribe();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hot-ish source: stores its subscriber so the test can push values.
    fn manual_source() -> (
        Observable<i32, String>,
        Arc<Mutex<Option<Subscriber<i32, String>>>>,
        Arc<AtomicUsize>,
        Arc<AtomicUsize>,
    ) {
        let slot = Arc::new(Mutex::new(None));
        let starts = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));
        let (s, st, td) = (slot.clone(), starts.clone(), teardowns.clone());
        let obs = Observable::new(move |subscriber| {
            st.fetch_add(1, Ordering::SeqCst);
            *s.lock() = Some(subscriber);
            let td = td.clone();
            Teardown::new(move || {
                td.fetch_add(1, Ordering::SeqCst);
            })
        });
        (obs, slot, starts, teardowns)
    }

    #[test]
    fn test_map_and_filter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        Observable::<i32, String>::of(vec![1, 2, 3, 4])
            .filter(|v| v % 2 == 0)
            .map(|v| v * 10)
            .subscribe(Observer::new().on_next(move |v| s.lock().push(v)));
        assert_eq!(*seen.lock(), vec![20, 40]);
    }

    #[test]
    fn test_tap_forwards_unchanged() {
        let tapped = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let (t, e) = (tapped.clone(), errors.clone());
        let received = Arc::new(Mutex::new(None));
        let r = received.clone();
        Observable::<i32, String>::error("bad".into())
            .tap(Tap::new().error(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            }))
            .subscribe(Observer::new().on_error(move |err| *r.lock() = Some(err)));
        Observable::<i32, String>::of(vec![5])
            .tap(Tap::new().next(move |v| {
                t.fetch_add(*v as usize, Ordering::SeqCst);
            }))
            .subscribe(Observer::new());
        assert_eq!(tapped.load(Ordering::SeqCst), 5);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(received.lock().as_deref(), Some("bad"));
    }

    #[test]
    fn test_share_ref_counts_source() {
        let (source, slot, starts, teardowns) = manual_source();
        let shared = source.share();

        let a_seen = Arc::new(Mutex::new(Vec::new()));
        let b_seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (a_seen.clone(), b_seen.clone());

        let sub_a = shared.subscribe(Observer::new().on_next(move |v| a.lock().push(v)));
        slot.lock().as_ref().unwrap().next(1);
        let sub_b = shared.subscribe(Observer::new().on_next(move |v| b.lock().push(v)));
        slot.lock().as_ref().unwrap().next(2);

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(*a_seen.lock(), vec![1, 2]);
        assert_eq!(*b_seen.lock(), vec![2], "late subscriber gets no replay");

        sub_a.unsubscribe();
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        sub_b.unsubscribe();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);

        // A new subscriber restarts the producer.
        let _sub_c = shared.subscribe(Observer::new());
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_share_propagates_error_to_all() {
        let (source, slot, _starts, _teardowns) = manual_source();
        let shared = source.share();
        let errors = Arc::new(AtomicUsize::new(0));
        let (e1, e2) = (errors.clone(), errors.clone());
        shared.subscribe(Observer::new().on_error(move |_| {
            e1.fetch_add(1, Ordering::SeqCst);
        }));
        shared.subscribe(Observer::new().on_error(move |_| {
            e2.fetch_add(1, Ordering::SeqCst);
        }));
        slot.lock().as_ref().unwrap().error("down".into());
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_first_value_unsubscribes() {
        let (source, slot, _starts, teardowns) = manual_source();
        let source = source.map_err_into();
        let fut = tokio::spawn(first_value(source, None));
        tokio::task::yield_now().await;
        slot.lock().as_ref().unwrap().next(7);
        assert_eq!(fut.await.unwrap().unwrap(), 7);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_value_empty_completion_is_cancelled() {
        let obs = Observable::<i32, EdenLinkError>::of(vec![]);
        let err = first_value(obs, None).await.unwrap_err();
        assert_eq!(err, EdenLinkError::Cancelled);
    }

    #[tokio::test]
    async fn test_first_value_respects_signal() {
        let obs: Observable<i32, EdenLinkError> = Observable::new(|_| Teardown::noop());
        let signal = CancellationToken::new();
        signal.cancel();
        let err = first_value(obs, Some(signal)).await.unwrap_err();
        assert_eq!(err, EdenLinkError::Cancelled);
    }

    impl Observable<i32, String> {
        fn map_err_into(self) -> Observable<i32, EdenLinkError> {
            Observable::new(move |subscriber: Subscriber<i32, EdenLinkError>| {
                let (n, e) = (subscriber.clone(), subscriber.clone());
                self.subscribe(
                    Observer::new()
                        .on_next(move |v| n.next(v))
                        .on_error(move |msg| e.error(EdenLinkError::TransportError(msg))),
                )
                .into()
            })
        }
    }
}
