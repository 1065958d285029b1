//! HTTP transport used by the HTTP, batch and SSE links.
//!
//! [`Fetcher`] is the seam between the links and the network: the default
//! [`ReqwestFetcher`] talks to a real server, tests plug in an in-memory
//! implementation.

use crate::{
    error::{EdenLinkError, Result},
    models::{FormValue, HttpMethod},
    timeouts::EdenLinkTimeouts,
};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use log::debug;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Request body on the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HttpBody {
    /// No body.
    #[default]
    Empty,
    /// Text body with its content type (JSON bodies use `application/json`).
    Text {
        /// `Content-Type` header value.
        content_type: String,
        /// Body text.
        body: String,
    },
    /// `multipart/form-data` fields, in order. Keys may repeat.
    Multipart(Vec<(String, FormValue)>),
}

impl HttpBody {
    /// JSON body.
    pub fn json(value: &JsonValue) -> Self {
        HttpBody::Text {
            content_type: "application/json".to_string(),
            body: value.to_string(),
        }
    }

    /// Text value of the first multipart field named `key`.
    pub fn field(&self, key: &str) -> Option<&str> {
        match self {
            HttpBody::Multipart(fields) => fields.iter().find_map(|(k, v)| match v {
                FormValue::Text(t) if k == key => Some(t.as_str()),
                _ => None,
            }),
            _ => None,
        }
    }
}

/// Fully-resolved HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method
    pub method: HttpMethod,
    /// Absolute URL including the query string
    pub url: String,
    /// Header names as given by the caller
    pub headers: BTreeMap<String, String>,
    /// Body
    pub body: HttpBody,
    /// Abort the request when cancelled
    pub signal: Option<CancellationToken>,
}

impl HttpRequest {
    /// GET request without headers.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: HttpBody::Empty,
            signal: None,
        }
    }

    /// Header lookup, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Streaming HTTP response.
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Header names lower-cased
    pub headers: BTreeMap<String, String>,
    body: BoxStream<'static, Result<Bytes>>,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Response with a streamed body.
    pub fn new(
        status: u16,
        headers: BTreeMap<String, String>,
        body: BoxStream<'static, Result<Bytes>>,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response whose body is delivered in the given chunks.
    pub fn from_chunks(status: u16, headers: BTreeMap<String, String>, chunks: Vec<Bytes>) -> Self {
        Self::new(status, headers, stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    /// Response with a JSON body.
    pub fn json(status: u16, value: &JsonValue) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self::from_chunks(status, headers, vec![Bytes::from(value.to_string())])
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value (name is matched case-insensitively).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// `Content-Type` without parameters, lower-cased.
    pub fn mime_type(&self) -> Option<String> {
        self.header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
    }

    /// Take the body stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        self.body
    }

    /// Collect the body.
    pub async fn bytes(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Collect the body as UTF-8 text.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EdenLinkError::SerializationError(format!("Response is not UTF-8: {}", e)))
    }

    /// Body as JSON; non-JSON text becomes a JSON string and an empty body
    /// becomes `null`.
    pub async fn json_or_text(self) -> Result<JsonValue> {
        let text = self.text().await?;
        if text.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(JsonValue::String(text)))
    }
}

/// Performs HTTP requests.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Send `request` and return the response once headers arrived.
    ///
    /// Network failures are `Err`; HTTP error statuses are a normal response.
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`Fetcher`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Client with the given timeouts and connection pooling.
    pub fn new(timeouts: &EdenLinkTimeouts) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(timeouts.connection_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));
        if !EdenLinkTimeouts::is_no_timeout(timeouts.request_timeout) {
            builder = builder.timeout(timeouts.request_timeout);
        }
        let client = builder
            .build()
            .map_err(|e| EdenLinkError::ConfigurationError(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: HttpRequest) -> Result<reqwest::RequestBuilder> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| EdenLinkError::ConfigurationError(e.to_string()))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            HttpBody::Empty => builder,
            HttpBody::Text { content_type, body } => {
                builder.header("content-type", content_type).body(body)
            },
            HttpBody::Multipart(fields) => {
                let mut form = reqwest::multipart::Form::new();
                for (key, value) in fields {
                    form = match value {
                        FormValue::Text(text) => form.text(key, text),
                        FormValue::File(file) => {
                            let mut part = reqwest::multipart::Part::bytes(file.data.to_vec())
                                .file_name(file.file_name.clone());
                            if let Some(ct) = &file.content_type {
                                part = part.mime_str(ct)?;
                            }
                            form.part(key, part)
                        },
                    };
                }
                builder.multipart(form)
            },
        };
        Ok(builder)
    }
}

#[async_trait::async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let signal = request.signal.clone();
        let method = request.method;
        let url = request.url.clone();
        let builder = self.build(request)?;

        debug!("[EDEN_HTTP] {} {}", method, url);
        let start = Instant::now();
        let send = builder.send();
        let response = match signal {
            Some(signal) => tokio::select! {
                res = send => res?,
                _ = signal.cancelled() => {
                    debug!("[EDEN_HTTP] {} {} aborted", method, url);
                    return Err(EdenLinkError::Cancelled);
                },
            },
            None => send.await?,
        };
        debug!(
            "[EDEN_HTTP] {} {} -> {} in {}ms",
            method,
            url,
            response.status(),
            start.elapsed().as_millis()
        );

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(EdenLinkError::from))
            .boxed();
        Ok(HttpResponse::new(status, headers, body))
    }
}

/// In-memory fetcher recording every request.
#[cfg(test)]
pub(crate) struct RecordingFetcher {
    pub requests: parking_lot::Mutex<Vec<HttpRequest>>,
    respond: Box<dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync>,
}

#[cfg(test)]
impl RecordingFetcher {
    pub fn new(
        respond: impl Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            requests: parking_lot::Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl Fetcher for RecordingFetcher {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = (self.respond)(&request);
        self.requests.lock().push(request);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_json_or_text() {
        let res = HttpResponse::json(200, &json!({"ok": true}));
        assert_eq!(res.mime_type().as_deref(), Some("application/json"));
        assert_eq!(res.json_or_text().await.unwrap(), json!({"ok": true}));

        let res = HttpResponse::from_chunks(500, BTreeMap::new(), vec![Bytes::from("boom")]);
        assert_eq!(res.json_or_text().await.unwrap(), json!("boom"));

        let res = HttpResponse::from_chunks(204, BTreeMap::new(), vec![]);
        assert_eq!(res.json_or_text().await.unwrap(), JsonValue::Null);
    }

    #[tokio::test]
    async fn test_chunked_body_is_concatenated() {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "text/plain; charset=utf-8".to_string());
        let res = HttpResponse::from_chunks(
            200,
            headers,
            vec![Bytes::from("hel"), Bytes::from("lo")],
        );
        assert_eq!(res.header("CONTENT-TYPE"), Some("text/plain; charset=utf-8"));
        assert_eq!(res.mime_type().as_deref(), Some("text/plain"));
        assert_eq!(res.text().await.unwrap(), "hello");
    }

    #[test]
    fn test_request_header_lookup() {
        let mut req = HttpRequest::get("http://localhost/x");
        req.headers.insert("X-Trace".into(), "1".into());
        assert_eq!(req.header("x-trace"), Some("1"));
        assert_eq!(req.header("accept"), None);
    }
}
