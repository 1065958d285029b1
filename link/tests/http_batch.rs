//! Batch link against an in-memory server that decodes the wire format.

mod common;

use common::MockFetcher;
use eden_link::batch::{decode_get_batch, decode_post_batch};
use eden_link::fetch::{HttpBody, HttpRequest, HttpResponse};
use eden_link::{
    CallOptions, EdenClient, EdenLinkError, HttpBatchLink, HttpBatchLinkOptions, HttpLinkOptions,
    HttpMethod, RequestParams,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Answers a batch with `{path, x}` per member, a plain request with its URL.
fn batch_server(request: &HttpRequest) -> eden_link::Result<HttpResponse> {
    if !request.url.contains("/batch") {
        return Ok(HttpResponse::json(200, &json!(request.url)));
    }
    let members = match &request.body {
        HttpBody::Multipart(fields) => decode_post_batch(fields.clone(), &request.headers)?,
        _ => decode_get_batch(&request.url, &request.headers)?,
    };
    let results: Vec<_> = members
        .iter()
        .map(|m| {
            json!({
                "type": "data",
                "data": {"path": m.path, "x": m.params.query.get("x")},
            })
        })
        .collect();
    Ok(HttpResponse::json(200, &json!(results)))
}

fn client(fetcher: Arc<MockFetcher>, method: HttpMethod) -> EdenClient {
    let http = HttpLinkOptions::builder("http://localhost:3000/api")
        .fetcher(fetcher)
        .build()
        .unwrap();
    EdenClient::builder()
        .link(HttpBatchLink::new(HttpBatchLinkOptions::new(http).method(method)))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_concurrent_queries_share_one_get_request() {
    let fetcher = MockFetcher::new(batch_server);
    let client = client(fetcher.clone(), HttpMethod::Get);
    let (a, b, c) = tokio::join!(
        client.query("/users", RequestParams::get().query("x", 1), CallOptions::new()),
        client.query("/posts", RequestParams::get().query("x", 2), CallOptions::new()),
        client.query("/tags", RequestParams::get(), CallOptions::new()),
    );
    assert_eq!(a.unwrap().data, json!({"path": "/users", "x": "1"}));
    assert_eq!(b.unwrap().data, json!({"path": "/posts", "x": "2"}));
    assert_eq!(c.unwrap().data, json!({"path": "/tags", "x": null}));

    let requests = fetcher.requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, HttpMethod::Get);
    assert!(requests[0].url.starts_with("http://localhost:3000/api/batch?"));
}

#[tokio::test]
async fn test_mixed_batch_is_posted() {
    let fetcher = MockFetcher::new(batch_server);
    let client = client(fetcher.clone(), HttpMethod::Get);
    let (read, write) = tokio::join!(
        client.query("/users", RequestParams::get().query("x", 1), CallOptions::new()),
        client.mutation("/users", RequestParams::post().json(json!({"name": "a"})), CallOptions::new()),
    );
    assert_eq!(read.unwrap().data, json!({"path": "/users", "x": "1"}));
    assert!(write.is_ok());
    let requests = fetcher.requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, HttpMethod::Post);
}

#[tokio::test]
async fn test_aborted_member_does_not_affect_siblings() {
    let fetcher = MockFetcher::new(batch_server);
    let client = client(fetcher.clone(), HttpMethod::Post);
    let signal = CancellationToken::new();
    signal.cancel();
    let (a, aborted, b) = tokio::join!(
        client.query("/a", RequestParams::get(), CallOptions::new()),
        client.query("/gone", RequestParams::get(), CallOptions::new().signal(signal)),
        client.query("/b", RequestParams::get(), CallOptions::new()),
    );
    assert_eq!(a.unwrap().data["path"], json!("/a"));
    assert_eq!(b.unwrap().data["path"], json!("/b"));
    assert_eq!(aborted.unwrap_err(), EdenLinkError::Cancelled);

    let requests = fetcher.requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body.field("0.path"), Some("/a"));
    assert_eq!(requests[0].body.field("1.path"), Some("/b"));
    assert_eq!(requests[0].body.field("2.path"), None);
}

#[tokio::test]
async fn test_missing_batch_endpoint_is_a_configuration_error() {
    let fetcher = MockFetcher::new(|request| {
        if request.url.contains("/batch") {
            Ok(HttpResponse::json(404, &json!("not found")))
        } else {
            Ok(HttpResponse::json(200, &json!("single")))
        }
    });
    let client = client(fetcher, HttpMethod::Post);
    let (a, b) = tokio::join!(
        client.query("/a", RequestParams::get(), CallOptions::new()),
        client.query("/b", RequestParams::get(), CallOptions::new()),
    );
    assert!(matches!(a, Err(EdenLinkError::ConfigurationError(_))));
    assert!(matches!(b, Err(EdenLinkError::ConfigurationError(_))));
}
