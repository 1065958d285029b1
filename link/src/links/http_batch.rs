//! Terminal link batching queries and mutations issued in the same tick.

use super::chain::{Link, LinkObservable, Next};
use super::http::{build_http_request, build_url, read_response, HttpLinkOptions};
use crate::{
    batch::{
        encode_batch_headers, encode_get_batch, encode_post_batch, read_batch_response,
        BatchLoader, BatchResolver, DataLoader, DEFAULT_BATCH_WINDOW,
    },
    error::{EdenLinkError, Result},
    fetch::{HttpBody, HttpRequest},
    models::{HttpMethod, LinkResult, Operation, OperationType},
    observable::{Observable, Teardown},
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Settings of [`HttpBatchLink`].
#[derive(Debug, Clone)]
pub struct HttpBatchLinkOptions {
    http: HttpLinkOptions,
    batch_path: String,
    method: HttpMethod,
    max_url_length: Option<usize>,
    max_items: Option<usize>,
    batch_window: Duration,
}

impl HttpBatchLinkOptions {
    /// POST batches to `/batch` without size limits.
    pub fn new(http: HttpLinkOptions) -> Self {
        Self {
            http,
            batch_path: "/batch".to_string(),
            method: HttpMethod::Post,
            max_url_length: None,
            max_items: None,
            batch_window: DEFAULT_BATCH_WINDOW,
        }
    }

    /// Path of the batch endpoint.
    pub fn batch_path(mut self, path: impl Into<String>) -> Self {
        self.batch_path = path.into();
        self
    }

    /// Preferred batch method (`GET` or `POST`). GET batches are upgraded
    /// to POST when a member is not a GET.
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Longest GET batch URL.
    pub fn max_url_length(mut self, max: usize) -> Self {
        self.max_url_length = Some(max);
        self
    }

    /// Most operations per batch.
    pub fn max_items(mut self, max: usize) -> Self {
        self.max_items = Some(max);
        self
    }

    /// Delay between the first operation of a batch and its dispatch.
    pub fn batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    fn method_for(&self, ops: &[&Operation]) -> HttpMethod {
        if self.method == HttpMethod::Get && ops.iter().all(|op| op.params.method == HttpMethod::Get) {
            HttpMethod::Get
        } else {
            HttpMethod::Post
        }
    }
}

/// [`BatchLoader`] sending operations to the batch endpoint.
#[derive(Debug, Clone)]
pub struct HttpBatchLoader {
    options: HttpBatchLinkOptions,
}

impl HttpBatchLoader {
    /// Loader for `options`.
    pub fn new(options: HttpBatchLinkOptions) -> Self {
        Self { options }
    }
}

#[async_trait::async_trait]
impl BatchLoader for HttpBatchLoader {
    type Key = Operation;
    type Value = LinkResult;

    fn validate(&self, ops: &[&Operation]) -> bool {
        if self.options.max_items.is_some_and(|max| ops.len() > max) {
            return false;
        }
        match self.options.max_url_length {
            Some(max) if self.options.method_for(ops) == HttpMethod::Get => {
                let owned: Vec<Operation> = ops.iter().map(|op| (*op).clone()).collect();
                encode_get_batch(&self.options.http.base_url, &self.options.batch_path, &owned)
                    .map(|url| url.len() <= max)
                    .unwrap_or(false)
            },
            _ => true,
        }
    }

    async fn fetch(&self, ops: Vec<Operation>, resolver: &BatchResolver<LinkResult>) -> Result<()> {
        let http = &self.options.http;
        if let [op] = ops.as_slice() {
            let request = build_http_request(http, op).await?;
            let result = read_response(http.send(request).await?).await?;
            resolver.resolve(0, Ok(result));
            return Ok(());
        }

        let refs: Vec<&Operation> = ops.iter().collect();
        let method = self.options.method_for(&refs);
        let headers = encode_batch_headers(&http.resolved_headers().await?, &ops);
        let (url, body) = match method {
            HttpMethod::Get => (
                encode_get_batch(&http.base_url, &self.options.batch_path, &ops)?,
                HttpBody::Empty,
            ),
            _ => (
                build_url(&http.base_url, &self.options.batch_path, &BTreeMap::new())?,
                HttpBody::Multipart(encode_post_batch(&ops)),
            ),
        };
        log::debug!("[EDEN_BATCH] {} batch of {} to {}", method, ops.len(), url);
        let response = http
            .send(HttpRequest {
                method,
                url,
                headers,
                body,
                signal: None,
            })
            .await?;
        read_batch_response(response, resolver).await
    }
}

/// Coalesces the queries and mutations of one tick into one HTTP request.
///
/// A lone operation is sent as a plain request. Aborting one member never
/// affects its siblings.
#[derive(Debug, Clone)]
pub struct HttpBatchLink {
    loader: DataLoader<HttpBatchLoader>,
}

impl HttpBatchLink {
    /// Link over `options`.
    pub fn new(options: HttpBatchLinkOptions) -> Self {
        Self {
            loader: {
                let window = options.batch_window;
                DataLoader::with_window(HttpBatchLoader::new(options), window)
            },
        }
    }
}

impl Link for HttpBatchLink {
    fn run(&self, op: Operation, _next: Next) -> LinkObservable {
        if op.kind == OperationType::Subscription {
            return Observable::error(EdenLinkError::ConfigurationError(
                "Subscriptions are not supported by HttpBatchLink - use WsLink or HttpSubscriptionLink"
                    .to_string(),
            ));
        }
        let loader = self.loader.clone();
        Observable::new(move |subscriber| {
            let signal = op
                .signal
                .as_ref()
                .map(|s| s.child_token())
                .unwrap_or_default();
            let load = loader.load(op.clone(), Some(signal.clone()));
            let task = tokio::spawn(async move {
                match load.await {
                    Ok(result) => {
                        subscriber.next(result);
                        subscriber.complete();
                    },
                    Err(e) => subscriber.error(e),
                }
            });
            Teardown::new(move || {
                signal.cancel();
                task.abort();
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{HttpResponse, RecordingFetcher};
    use crate::links::chain::{create_chain, link};
    use crate::models::RequestParams;
    use crate::observable::first_value;
    use serde_json::json;
    use std::sync::Arc;

    fn batch_link(fetcher: Arc<RecordingFetcher>, method: HttpMethod) -> HttpBatchLink {
        let http = HttpLinkOptions::builder("http://h/api")
            .fetcher(fetcher)
            .build()
            .unwrap();
        HttpBatchLink::new(HttpBatchLinkOptions::new(http).method(method))
    }

    fn query(l: &HttpBatchLink, id: u64, path: &str) -> LinkObservable {
        let op = Operation::new(id, OperationType::Query, path, RequestParams::get());
        create_chain(vec![link(l.clone())].into(), op)
    }

    #[tokio::test]
    async fn test_single_operation_is_not_batched() {
        let fetcher = RecordingFetcher::new(|_| Ok(HttpResponse::json(200, &json!("one"))));
        let l = batch_link(fetcher.clone(), HttpMethod::Get);
        let result = first_value(query(&l, 1, "/a"), None).await.unwrap();
        assert_eq!(result.into_response().unwrap().data, json!("one"));
        assert_eq!(fetcher.requests.lock()[0].url, "http://h/api/a");
    }

    #[tokio::test]
    async fn test_get_batch_upgrades_to_post_for_mutations() {
        let fetcher = RecordingFetcher::new(|_| {
            Ok(HttpResponse::json(
                200,
                &json!([{"type": "data", "data": 1}, {"type": "data", "data": 2}]),
            ))
        });
        let l = batch_link(fetcher.clone(), HttpMethod::Get);
        let read = query(&l, 1, "/a");
        let write = create_chain(
            vec![link(l.clone())].into(),
            Operation::new(2, OperationType::Mutation, "/b", RequestParams::post()),
        );
        let (a, b) = tokio::join!(first_value(read, None), first_value(write, None));
        assert_eq!(a.unwrap().into_response().unwrap().data, json!(1));
        assert_eq!(b.unwrap().into_response().unwrap().data, json!(2));

        let requests = fetcher.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert_eq!(requests[0].url, "http://h/api/batch");
        assert_eq!(requests[0].body.field("1.path"), Some("/b"));
    }

    #[tokio::test]
    async fn test_url_budget_splits_get_batches() {
        let fetcher = RecordingFetcher::new(|req| {
            let n = req.url.matches(".path=").count();
            let items: Vec<_> = (0..n).map(|i| json!({"type": "data", "data": i})).collect();
            Ok(if n == 0 {
                HttpResponse::json(200, &json!("single"))
            } else {
                HttpResponse::json(200, &json!(items))
            })
        });
        let http = HttpLinkOptions::builder("http://h")
            .fetcher(fetcher.clone())
            .build()
            .unwrap();
        let l = HttpBatchLink::new(
            HttpBatchLinkOptions::new(http)
                .method(HttpMethod::Get)
                .max_url_length(70),
        );
        let loads = (1..=3).map(|i| first_value(query(&l, i, "/path"), None));
        let results = futures_util::future::join_all(loads).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(fetcher.requests.lock().len() >= 2);
    }

    #[tokio::test]
    async fn test_batch_error_rejects_each_member() {
        let fetcher = RecordingFetcher::new(|_| Err(EdenLinkError::TransportError("reset".into())));
        let l = batch_link(fetcher, HttpMethod::Post);
        let (a, b) = tokio::join!(
            first_value(query(&l, 1, "/a"), None),
            first_value(query(&l, 2, "/b"), None)
        );
        assert_eq!(a.unwrap_err(), EdenLinkError::TransportError("reset".into()));
        assert_eq!(b.unwrap_err(), EdenLinkError::TransportError("reset".into()));
    }
}
