//! Terminal link sending each operation as one HTTP request.

use super::chain::{Link, LinkObservable, Next};
use crate::{
    auth::{AuthProvider, DynamicAuthProvider, ResolvedAuth},
    error::{EdenLinkError, Result},
    fetch::{Fetcher, HttpBody, HttpRequest, HttpResponse, ReqwestFetcher},
    models::{
        FormValue, LinkResult, Operation, OperationType, RequestBody, ResponseMeta,
    },
    observable::Observable,
    timeouts::EdenLinkTimeouts,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Transport settings shared by the HTTP-based links.
#[derive(Clone)]
pub struct HttpLinkOptions {
    pub(crate) base_url: String,
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) auth: ResolvedAuth,
    pub(crate) fetcher: Arc<dyn Fetcher>,
}

impl std::fmt::Debug for HttpLinkOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLinkOptions")
            .field("base_url", &self.base_url)
            .field("headers", &self.headers)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl HttpLinkOptions {
    /// Builder for the given server URL.
    pub fn builder(base_url: impl Into<String>) -> HttpLinkOptionsBuilder {
        HttpLinkOptionsBuilder {
            base_url: base_url.into(),
            headers: BTreeMap::new(),
            auth: ResolvedAuth::None,
            fetcher: None,
            timeouts: EdenLinkTimeouts::default(),
        }
    }

    /// Server URL every path is appended to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Headers sent with every request.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Default headers merged with credentials, for transports that cannot
    /// set per-request headers themselves.
    pub(crate) async fn resolved_headers(&self) -> Result<BTreeMap<String, String>> {
        let mut headers = self.headers.clone();
        self.auth.resolve().await?.apply_to_headers(&mut headers);
        Ok(headers)
    }

    pub(crate) async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.fetcher.fetch(request).await
    }
}

/// Builder for [`HttpLinkOptions`].
pub struct HttpLinkOptionsBuilder {
    base_url: String,
    headers: BTreeMap<String, String>,
    auth: ResolvedAuth,
    fetcher: Option<Arc<dyn Fetcher>>,
    timeouts: EdenLinkTimeouts,
}

impl HttpLinkOptionsBuilder {
    /// Header sent with every request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Static credentials.
    pub fn auth(mut self, auth: AuthProvider) -> Self {
        self.auth = ResolvedAuth::Static(auth);
        self
    }

    /// Credentials resolved before every request.
    pub fn dynamic_auth(mut self, provider: Arc<dyn DynamicAuthProvider>) -> Self {
        self.auth = ResolvedAuth::Dynamic(provider);
        self
    }

    /// Custom transport (defaults to `reqwest`).
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Timeouts for the default transport.
    pub fn timeouts(mut self, timeouts: EdenLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Validate the URL and build the options.
    pub fn build(self) -> Result<HttpLinkOptions> {
        reqwest::Url::parse(&self.base_url).map_err(|e| {
            EdenLinkError::ConfigurationError(format!("Invalid base URL '{}': {}", self.base_url, e))
        })?;
        let fetcher = match self.fetcher {
            Some(f) => f,
            None => Arc::new(ReqwestFetcher::new(&self.timeouts)?),
        };
        Ok(HttpLinkOptions {
            base_url: self.base_url,
            headers: self.headers,
            auth: self.auth,
            fetcher,
        })
    }
}

/// Join `base_url` and `path` and append `query`.
pub fn build_url(base_url: &str, path: &str, query: &BTreeMap<String, String>) -> Result<String> {
    let joined = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let mut url = reqwest::Url::parse(&joined)
        .map_err(|e| EdenLinkError::ConfigurationError(format!("Invalid URL '{}': {}", joined, e)))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.to_string())
}

/// Encode a request body. JSON payloads containing files and form bodies
/// become multipart: the JSON goes into a `body` field, every file into a
/// `files.path` / `files.files` pair.
pub fn encode_body(body: Option<&RequestBody>) -> HttpBody {
    match body {
        None => HttpBody::Empty,
        Some(RequestBody::Json(payload)) => {
            let (json, files) = payload.extract_files();
            if files.is_empty() {
                return HttpBody::json(&json);
            }
            let mut fields = vec![("body".to_string(), FormValue::Text(json.to_string()))];
            for (path, file) in files {
                fields.push(("files.path".to_string(), FormValue::Text(path)));
                fields.push(("files.files".to_string(), FormValue::File(file)));
            }
            HttpBody::Multipart(fields)
        },
        Some(RequestBody::FormData(fields)) => HttpBody::Multipart(fields.clone()),
    }
}

/// Build the HTTP request for a single operation.
pub(crate) async fn build_http_request(options: &HttpLinkOptions, op: &Operation) -> Result<HttpRequest> {
    let url = build_url(&options.base_url, &op.path, &op.params.query)?;
    let mut headers = options.headers.clone();
    headers.extend(op.params.headers.clone());
    options.auth.resolve().await?.apply_to_headers(&mut headers);
    Ok(HttpRequest {
        method: op.params.method,
        url,
        headers,
        body: encode_body(op.params.body.as_ref()),
        signal: op.signal.clone(),
    })
}

/// Status >= 400 becomes [`LinkResult::Error`], anything else
/// [`LinkResult::Data`].
pub(crate) async fn read_response(response: HttpResponse) -> Result<LinkResult> {
    let meta = ResponseMeta {
        status: response.status,
        headers: response.headers.clone(),
    };
    let status = response.status;
    let value = response.json_or_text().await?;
    Ok(if status >= 400 {
        LinkResult::Error {
            status,
            value,
            response: Some(meta),
        }
    } else {
        LinkResult::Data {
            data: value,
            id: None,
            response: Some(meta),
        }
    })
}

/// One HTTP request per query or mutation.
#[derive(Debug, Clone)]
pub struct HttpLink {
    options: HttpLinkOptions,
}

impl HttpLink {
    /// Link over the given transport settings.
    pub fn new(options: HttpLinkOptions) -> Self {
        Self { options }
    }
}

impl Link for HttpLink {
    fn run(&self, op: Operation, _next: Next) -> LinkObservable {
        if op.kind == OperationType::Subscription {
            return Observable::error(EdenLinkError::ConfigurationError(
                "Subscriptions are not supported by HttpLink - use WsLink or HttpSubscriptionLink"
                    .to_string(),
            ));
        }
        let options = self.options.clone();
        Observable::from_future(move || {
            let options = options.clone();
            let op = op.clone();
            async move {
                let request = build_http_request(&options, &op).await?;
                let response = options.send(request).await?;
                read_response(response).await
            }
        })
    }
}
