//! Bookkeeping of WebSocket requests.
//!
//! A request is *outgoing* from registration until it is flushed to the
//! socket, then *pending* until it settles. Pending messages are kept
//! verbatim so they can be replayed after a reconnect.

use crate::{
    error::EdenLinkError,
    models::{ClientEnvelope, LinkResult},
    observable::Observer,
};
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Callbacks receiving the results of one request.
pub type RequestCallbacks = Observer<LinkResult, EdenLinkError>;

/// Where a request currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Registered, not yet written to a socket
    Outgoing,
    /// Sent, waiting for its answer (or, for subscriptions, its stop)
    Pending,
}

/// Copy of a tracked request.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    /// Message as sent (or to be sent)
    pub message: ClientEnvelope,
    /// Result callbacks
    pub callbacks: RequestCallbacks,
    /// Outgoing or pending
    pub status: RequestStatus,
}

impl RequestSnapshot {
    /// Whether the request is a subscription.
    pub fn is_subscription(&self) -> bool {
        self.message.is_subscription()
    }
}

struct TrackedRequest {
    message: ClientEnvelope,
    callbacks: RequestCallbacks,
    done: watch::Sender<bool>,
}

impl TrackedRequest {
    fn snapshot(&self, status: RequestStatus) -> RequestSnapshot {
        RequestSnapshot {
            message: self.message.clone(),
            callbacks: self.callbacks.clone(),
            status,
        }
    }

    fn finish(self, status: RequestStatus) -> RequestSnapshot {
        let snapshot = self.snapshot(status);
        self.done.send_replace(true);
        snapshot
    }
}

#[derive(Default)]
struct ManagerState {
    /// Registration order is flush order.
    outgoing: Vec<(u64, TrackedRequest)>,
    pending: BTreeMap<u64, TrackedRequest>,
}

/// Tracks every in-flight request of a WebSocket client. Cheap to clone.
///
/// Callbacks are never invoked while the internal lock is held; callers
/// take a snapshot and call them afterwards.
#[derive(Clone, Default)]
pub struct RequestManager {
    state: Arc<Mutex<ManagerState>>,
}

impl std::fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("RequestManager")
            .field("outgoing", &st.outgoing.len())
            .field("pending", &st.pending.len())
            .finish()
    }
}

impl RequestManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new outgoing request.
    pub fn register(&self, id: u64, message: ClientEnvelope, callbacks: RequestCallbacks) -> AbortHandle {
        let (done, _) = watch::channel(false);
        self.state.lock().outgoing.push((
            id,
            TrackedRequest {
                message,
                callbacks,
                done,
            },
        ));
        AbortHandle {
            manager: self.clone(),
            id,
        }
    }

    /// Move every outgoing request to pending and return their messages in
    /// registration order.
    pub fn flush(&self) -> Vec<ClientEnvelope> {
        let mut st = self.state.lock();
        let outgoing = std::mem::take(&mut st.outgoing);
        let mut messages = Vec::with_capacity(outgoing.len());
        for (id, request) in outgoing {
            messages.push(request.message.clone());
            st.pending.insert(id, request);
        }
        messages
    }

    /// Messages of every pending request, by id.
    pub fn get_pending_requests(&self) -> Vec<ClientEnvelope> {
        self.state
            .lock()
            .pending
            .values()
            .map(|r| r.message.clone())
            .collect()
    }

    /// Messages not yet flushed, in registration order.
    pub fn get_outgoing_requests(&self) -> Vec<ClientEnvelope> {
        self.state
            .lock()
            .outgoing
            .iter()
            .map(|(_, r)| r.message.clone())
            .collect()
    }

    /// Snapshot of a request by id.
    pub fn get_request(&self, id: u64) -> Option<RequestSnapshot> {
        let st = self.state.lock();
        if let Some(r) = st.pending.get(&id) {
            return Some(r.snapshot(RequestStatus::Pending));
        }
        st.outgoing
            .iter()
            .find(|(rid, _)| *rid == id)
            .map(|(_, r)| r.snapshot(RequestStatus::Outgoing))
    }

    /// Stop tracking a request and resolve its [`end`](Self::end) future.
    pub fn delete(&self, id: u64) -> Option<RequestSnapshot> {
        let mut st = self.state.lock();
        if let Some(r) = st.pending.remove(&id) {
            return Some(r.finish(RequestStatus::Pending));
        }
        let index = st.outgoing.iter().position(|(rid, _)| *rid == id)?;
        let (_, r) = st.outgoing.remove(index);
        Some(r.finish(RequestStatus::Outgoing))
    }

    /// Remove a request only while it is still outgoing.
    fn abort_outgoing(&self, id: u64) -> bool {
        let mut st = self.state.lock();
        match st.outgoing.iter().position(|(rid, _)| *rid == id) {
            Some(index) => {
                let (_, r) = st.outgoing.remove(index);
                r.done.send_replace(true);
                true
            },
            None => false,
        }
    }

    /// Remove every outgoing request.
    pub fn take_outgoing(&self) -> Vec<RequestSnapshot> {
        let outgoing = std::mem::take(&mut self.state.lock().outgoing);
        outgoing
            .into_iter()
            .map(|(_, r)| r.finish(RequestStatus::Outgoing))
            .collect()
    }

    /// Remove pending requests matching `predicate`.
    pub fn take_pending_where(&self, predicate: impl Fn(&ClientEnvelope) -> bool) -> Vec<RequestSnapshot> {
        let mut st = self.state.lock();
        let ids: Vec<u64> = st
            .pending
            .iter()
            .filter(|(_, r)| predicate(&r.message))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| st.pending.remove(&id))
            .map(|r| r.finish(RequestStatus::Pending))
            .collect()
    }

    /// Future resolving once request `id` is deleted.
    pub fn end(&self, id: u64) -> Option<BoxFuture<'static, ()>> {
        let st = self.state.lock();
        let request = st
            .pending
            .get(&id)
            .or_else(|| st.outgoing.iter().find(|(rid, _)| *rid == id).map(|(_, r)| r))?;
        let mut rx = request.done.subscribe();
        Some(
            async move {
                let _ = rx.wait_for(|done| *done).await;
            }
            .boxed(),
        )
    }

    /// End futures of every pending request.
    pub fn pending_ends(&self) -> Vec<BoxFuture<'static, ()>> {
        let ids: Vec<u64> = self.state.lock().pending.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.end(id)).collect()
    }

    /// Record the last event id seen by a subscription so a replay resumes
    /// after it.
    pub fn set_last_event_id(&self, id: u64, event_id: &str) {
        let mut st = self.state.lock();
        if let Some(request) = st.pending.get_mut(&id) {
            if let Some(JsonValue::Object(params)) = request.message.params.as_mut() {
                params.insert("lastEventId".to_string(), JsonValue::String(event_id.to_string()));
            }
        }
    }

    /// Whether anything waits to be flushed.
    pub fn has_outgoing_requests(&self) -> bool {
        !self.state.lock().outgoing.is_empty()
    }

    /// Whether anything waits for an answer.
    pub fn has_pending_requests(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Whether a subscription is active.
    pub fn has_pending_subscriptions(&self) -> bool {
        self.state
            .lock()
            .pending
            .values()
            .any(|r| r.message.is_subscription())
    }

    /// Whether nothing is tracked at all.
    pub fn is_idle(&self) -> bool {
        let st = self.state.lock();
        st.outgoing.is_empty() && st.pending.is_empty()
    }
}

/// Returned by [`RequestManager::register`].
#[derive(Debug, Clone)]
pub struct AbortHandle {
    manager: RequestManager,
    id: u64,
}

impl AbortHandle {
    /// Drop the request if it has not been flushed yet. Returns whether it
    /// was removed; once sent this is a no-op.
    pub fn abort(&self) -> bool {
        self.manager.abort_outgoing(self.id)
    }

    /// Request id.
    pub fn id(&self) -> u64 {
        self.id
    }
}
