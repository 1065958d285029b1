#![allow(dead_code)]
//! In-process servers and transport doubles shared by the integration tests.

use eden_link::fetch::{Fetcher, HttpRequest, HttpResponse};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Address of a running test server.
pub struct TestServer {
    pub url: String,
    /// Accepted TCP connections
    pub connections: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Accept WebSocket connections on a random local port and hand each one to
/// `handler` with its 0-based index.
pub async fn spawn_ws_server<F, Fut>(handler: F) -> TestServer
where
    F: Fn(usize, ServerSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
    let addr = listener.local_addr().expect("test server address");
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    handler(index, ws).await;
                }
            });
        }
    });
    TestServer {
        url: format!("ws://{}/ws", addr),
        connections,
    }
}

/// Next client frame as a list of envelopes. Keep-alive probes are
/// answered and skipped. `None` once the socket is gone.
pub async fn read_envelopes(ws: &mut ServerSocket) -> Option<Vec<JsonValue>> {
    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        if text.as_str() == "PING" {
            let _ = ws.send(Message::Text("PONG".into())).await;
            continue;
        }
        return match serde_json::from_str::<JsonValue>(text.as_str()).ok()? {
            JsonValue::Array(items) => Some(items),
            other => Some(vec![other]),
        };
    }
    None
}

/// Send one JSON frame.
pub async fn send_json(ws: &mut ServerSocket, value: JsonValue) {
    let _ = ws.send(Message::Text(value.to_string().into())).await;
}

/// Wait until `condition` holds, polling every few milliseconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

type Respond = dyn Fn(&HttpRequest) -> eden_link::Result<HttpResponse> + Send + Sync;

/// In-memory HTTP server.
pub struct MockFetcher {
    pub requests: Mutex<Vec<HttpRequest>>,
    respond: Box<Respond>,
}

impl MockFetcher {
    pub fn new(
        respond: impl Fn(&HttpRequest) -> eden_link::Result<HttpResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: HttpRequest) -> eden_link::Result<HttpResponse> {
        let response = (self.respond)(&request);
        self.requests.lock().push(request);
        response
    }
}
