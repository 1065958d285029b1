//! Terminal link over a [`WebSocketClient`].

use super::chain::{Link, LinkObservable, Next};
use crate::{
    models::{ClientEnvelope, LinkResult, Operation, OperationType},
    observable::{operators::forward_to, Observable, Observer, Teardown},
    ws::WebSocketClient,
};

/// Sends every operation through a shared WebSocket client.
///
/// Subscriptions additionally receive the client's connection state as
/// [`LinkResult::State`]. Unsubscribing drops an unsent request, or stops
/// a running subscription on the server.
#[derive(Debug, Clone)]
pub struct WsLink {
    client: WebSocketClient,
}

impl WsLink {
    /// Link over `client`.
    pub fn new(client: WebSocketClient) -> Self {
        Self { client }
    }

    /// Underlying client.
    pub fn client(&self) -> &WebSocketClient {
        &self.client
    }
}

impl Link for WsLink {
    fn run(&self, op: Operation, _next: Next) -> LinkObservable {
        let client = self.client.clone();
        Observable::new(move |subscriber| {
            let envelope = match ClientEnvelope::request(&op) {
                Ok(envelope) => envelope,
                Err(e) => {
                    subscriber.error(e);
                    return Teardown::noop();
                },
            };

            let state = (op.kind == OperationType::Subscription).then(|| {
                let sub = subscriber.clone();
                client
                    .connection_state()
                    .subscribe(Observer::new().on_next(move |state| sub.next(LinkResult::State(state))))
            });

            let handle = match client.request(envelope, forward_to(&subscriber)) {
                Ok(handle) => handle,
                Err(e) => {
                    if let Some(state) = &state {
                        state.unsubscribe();
                    }
                    subscriber.error(e);
                    return Teardown::noop();
                },
            };

            let client = client.clone();
            Teardown::new(move || {
                if let Some(state) = state {
                    state.unsubscribe();
                }
                client.release(&handle);
            })
        })
    }
}
