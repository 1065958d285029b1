//! Subject holding a current value.

use super::{Observable, Observer, Subscriber, Subscription, Teardown};
use parking_lot::Mutex;
use std::sync::Arc;

struct SubjectState<T, E> {
    value: T,
    observers: Vec<(u64, Subscriber<T, E>)>,
    next_id: u64,
    completed: bool,
}

/// Multicast subject that remembers the last value.
///
/// New subscribers immediately receive the current value. Only the owner
/// (for connection state: the WebSocket client or SSE link) should call
/// [`BehaviorSubject::next`]; everyone else observes.
pub struct BehaviorSubject<T, E> {
    state: Arc<Mutex<SubjectState<T, E>>>,
}

impl<T, E> Clone for BehaviorSubject<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T, E> BehaviorSubject<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a subject holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            state: Arc::new(Mutex::new(SubjectState {
                value: initial,
                observers: Vec::new(),
                next_id: 0,
                completed: false,
            })),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.state.lock().value.clone()
    }

    /// Replace the value and push it to every subscriber.
    pub fn next(&self, value: T) {
        let observers = {
            let mut st = self.state.lock();
            if st.completed {
                return;
            }
            st.value = value.clone();
            st.observers.clone()
        };
        for (_, observer) in observers {
            observer.next(value.clone());
        }
    }

    /// Fail every subscriber. Later subscribers only get the last value.
    pub fn error(&self, error: E) {
        let observers = {
            let mut st = self.state.lock();
            st.completed = true;
            std::mem::take(&mut st.observers)
        };
        for (_, observer) in observers {
            observer.error(error.clone());
        }
    }

    /// Complete every subscriber.
    pub fn complete(&self) {
        let observers = {
            let mut st = self.state.lock();
            st.completed = true;
            std::mem::take(&mut st.observers)
        };
        for (_, observer) in observers {
            observer.complete();
        }
    }

    /// Number of live subscribers.
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// View of the subject as an [`Observable`].
    pub fn observable(&self) -> Observable<T, E> {
        let state = self.state.clone();
        Observable::new(move |subscriber: Subscriber<T, E>| {
            let (id, current, completed) = {
                let mut st = state.lock();
                let id = st.next_id;
                st.next_id += 1;
                if !st.completed {
                    st.observers.push((id, subscriber.clone()));
                }
                (id, st.value.clone(), st.completed)
            };
            subscriber.next(current);
            if completed {
                subscriber.complete();
                return Teardown::noop();
            }
            let state = state.clone();
            Teardown::new(move || {
                state.lock().observers.retain(|(oid, _)| *oid != id);
            })
        })
    }

    /// Shorthand for `self.observable().subscribe(observer)`.
    pub fn subscribe(&self, observer: Observer<T, E>) -> Subscription {
        self.observable().subscribe(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replays_current_value() {
        let subject: BehaviorSubject<&'static str, String> = BehaviorSubject::new("idle");
        subject.next("connecting");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = subject.subscribe(Observer::new().on_next(move |v| s.lock().push(v)));
        subject.next("pending");
        assert_eq!(*seen.lock(), vec!["connecting", "pending"]);
        assert_eq!(subject.get(), "pending");

        sub.unsubscribe();
        assert_eq!(subject.observer_count(), 0);
        subject.next("idle");
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_complete_detaches_observers() {
        let subject: BehaviorSubject<u8, String> = BehaviorSubject::new(0);
        let done = Arc::new(Mutex::new(false));
        let d = done.clone();
        subject.subscribe(Observer::new().on_complete(move || *d.lock() = true));
        subject.complete();
        assert!(*done.lock());
        assert_eq!(subject.observer_count(), 0);
        subject.next(9);
        assert_eq!(subject.get(), 0);
    }
}
