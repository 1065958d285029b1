//! Wire encoding of batched HTTP requests.
//!
//! GET batches travel in the query string:
//!
//! ```text
//! /batch?0.path=/a&0.method=GET&0.query.x=1&1.path=/b&1.method=GET
//! ```
//!
//! POST batches are `multipart/form-data` with the same indexed keys plus
//! `{i}.body`, `{i}.body_type` (`json` or `formdata`), `{i}.body.{key}` and
//! `{i}.files.path` / `{i}.files.files` pairs for files extracted from JSON
//! bodies. Headers use `{i}.{name}` for one request and the bare name for
//! all of them. The response is a JSON array aligned with the request
//! indexes, or NDJSON lines `{"index": i, "result": ...}` settling slots as
//! they arrive.
//!
//! The decoders are what a server does with a batch; the client only needs
//! them to check that an encoding round-trips.

use super::dataloader::BatchResolver;
use crate::{
    error::{EdenLinkError, Result},
    fetch::HttpResponse,
    links::http::build_url,
    models::{
        EdenResult, FilePart, FormValue, HttpMethod, LinkResult, Operation, Payload, RequestBody,
        RequestParams,
    },
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Headers never forwarded to sub-requests.
pub const RESERVED_HEADERS: &[&str] = &["content-type", "content-length", "accept", "transfer-encoding"];

/// Content types of streamed batch responses.
const STREAMED_MIME_TYPES: &[&str] = &["application/x-ndjson", "application/ndjson", "application/jsonl"];

/// One request of a batch, as a server sees it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchRequest {
    /// Route path
    pub path: String,
    /// Method, query, headers and body
    pub params: RequestParams,
}

impl From<&Operation> for BatchRequest {
    fn from(op: &Operation) -> Self {
        Self {
            path: op.path.clone(),
            params: op.params.clone(),
        }
    }
}

/// One line of a streamed batch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamedResult {
    /// Index of the request this line settles
    pub index: usize,
    /// Its result
    pub result: EdenResult,
}

fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS.iter().any(|r| r.eq_ignore_ascii_case(name))
}

/// Split `3.query.x` into `(3, "query.x")`. Keys without a numeric prefix
/// are global.
fn split_index(key: &str) -> Option<(usize, &str)> {
    let (prefix, rest) = key.split_once('.')?;
    prefix.parse().ok().map(|index| (index, rest))
}

/// URL of a GET batch.
pub fn encode_get_batch(base_url: &str, batch_path: &str, ops: &[Operation]) -> Result<String> {
    let mut url = reqwest::Url::parse(&build_url(base_url, batch_path, &BTreeMap::new())?)
        .map_err(|e| EdenLinkError::ConfigurationError(e.to_string()))?;
    {
        let mut pairs = url.query_pairs_mut();
        for (i, op) in ops.iter().enumerate() {
            pairs.append_pair(&format!("{}.path", i), &op.path);
            pairs.append_pair(&format!("{}.method", i), op.params.method.as_str());
            for (key, value) in &op.params.query {
                pairs.append_pair(&format!("{}.query.{}", i, key), value);
            }
        }
    }
    Ok(url.to_string())
}

/// Headers of a batch request: `global` as-is, each operation's own
/// headers prefixed with its index.
pub fn encode_batch_headers(
    global: &BTreeMap<String, String>,
    ops: &[Operation],
) -> BTreeMap<String, String> {
    let mut headers = global.clone();
    for (i, op) in ops.iter().enumerate() {
        for (name, value) in &op.params.headers {
            if !is_reserved(name) {
                headers.insert(format!("{}.{}", i, name.to_ascii_lowercase()), value.clone());
            }
        }
    }
    headers
}

/// Multipart fields of a POST batch.
pub fn encode_post_batch(ops: &[Operation]) -> Vec<(String, FormValue)> {
    let mut fields = Vec::new();
    for (i, op) in ops.iter().enumerate() {
        fields.push((format!("{}.path", i), FormValue::Text(op.path.clone())));
        fields.push((
            format!("{}.method", i),
            FormValue::Text(op.params.method.as_str().to_string()),
        ));
        for (key, value) in &op.params.query {
            fields.push((format!("{}.query.{}", i, key), FormValue::Text(value.clone())));
        }
        match &op.params.body {
            None => {},
            Some(RequestBody::Json(payload)) => {
                let (json, files) = payload.extract_files();
                fields.push((format!("{}.body", i), FormValue::Text(json.to_string())));
                fields.push((format!("{}.body_type", i), FormValue::Text("json".to_string())));
                for (path, file) in files {
                    fields.push((format!("{}.files.path", i), FormValue::Text(path)));
                    fields.push((format!("{}.files.files", i), FormValue::File(file)));
                }
            },
            Some(RequestBody::FormData(form)) => {
                fields.push((format!("{}.body_type", i), FormValue::Text("formdata".to_string())));
                for (key, value) in form {
                    fields.push((format!("{}.body.{}", i, key), value.clone()));
                }
            },
        }
    }
    fields
}

#[derive(Default)]
struct PartialRequest {
    path: Option<String>,
    params: RequestParams,
    body_json: Option<String>,
    body_type: Option<String>,
    form: Vec<(String, FormValue)>,
    file_paths: Vec<String>,
    files: Vec<FilePart>,
}

impl PartialRequest {
    fn finish(self, index: usize) -> Result<BatchRequest> {
        let path = self.path.ok_or_else(|| {
            EdenLinkError::SerializationError(format!("Batch request {} has no path", index))
        })?;
        let mut params = self.params;
        params.body = match self.body_type.as_deref() {
            Some("formdata") => Some(RequestBody::FormData(self.form)),
            Some("json") | None => match self.body_json {
                Some(text) => {
                    let json: JsonValue = serde_json::from_str(&text)?;
                    if self.file_paths.len() != self.files.len() {
                        return Err(EdenLinkError::SerializationError(format!(
                            "Batch request {} has {} file paths for {} files",
                            index,
                            self.file_paths.len(),
                            self.files.len()
                        )));
                    }
                    Some(RequestBody::Json(splice_files(
                        json,
                        self.file_paths.into_iter().zip(self.files).collect(),
                    )))
                },
                None => None,
            },
            Some(other) => {
                return Err(EdenLinkError::SerializationError(format!(
                    "Unknown body_type '{}' in batch request {}",
                    other, index
                )))
            },
        };
        Ok(BatchRequest { path, params })
    }
}

fn into_requests(partials: BTreeMap<usize, PartialRequest>) -> Result<Vec<BatchRequest>> {
    partials
        .into_iter()
        .enumerate()
        .map(|(position, (index, partial))| {
            if position != index {
                return Err(EdenLinkError::SerializationError(format!(
                    "Batch request {} is missing",
                    position
                )));
            }
            partial.finish(index)
        })
        .collect()
}

fn apply_headers(
    partials: &mut BTreeMap<usize, PartialRequest>,
    headers: &BTreeMap<String, String>,
) {
    let mut global = Vec::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        match split_index(&name) {
            Some((index, header)) => {
                if let Some(partial) = partials.get_mut(&index) {
                    if !is_reserved(header) {
                        partial.params.headers.insert(header.to_string(), value.clone());
                    }
                }
            },
            None if !is_reserved(&name) => global.push((name, value.clone())),
            None => {},
        }
    }
    for partial in partials.values_mut() {
        for (name, value) in &global {
            partial
                .params
                .headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// Server side of [`encode_get_batch`].
pub fn decode_get_batch(url: &str, headers: &BTreeMap<String, String>) -> Result<Vec<BatchRequest>> {
    let url = reqwest::Url::parse(url)
        .map_err(|e| EdenLinkError::SerializationError(format!("Invalid batch URL: {}", e)))?;
    let mut partials: BTreeMap<usize, PartialRequest> = BTreeMap::new();
    let mut global_query = Vec::new();
    for (key, value) in url.query_pairs() {
        match split_index(&key) {
            Some((index, field)) => {
                let partial = partials.entry(index).or_default();
                if field == "path" {
                    partial.path = Some(value.into_owned());
                } else if field == "method" {
                    partial.params.method = value.parse()?;
                } else if let Some(name) = field.strip_prefix("query.") {
                    partial.params.query.insert(name.to_string(), value.into_owned());
                }
            },
            None => global_query.push((key.into_owned(), value.into_owned())),
        }
    }
    for partial in partials.values_mut() {
        for (key, value) in &global_query {
            partial
                .params
                .query
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
    apply_headers(&mut partials, headers);
    into_requests(partials)
}

/// Server side of [`encode_post_batch`].
pub fn decode_post_batch(
    fields: Vec<(String, FormValue)>,
    headers: &BTreeMap<String, String>,
) -> Result<Vec<BatchRequest>> {
    let text = |value: FormValue, key: &str| match value {
        FormValue::Text(t) => Ok(t),
        FormValue::File(_) => Err(EdenLinkError::SerializationError(format!(
            "Batch field '{}' must be text",
            key
        ))),
    };
    let mut partials: BTreeMap<usize, PartialRequest> = BTreeMap::new();
    for (key, value) in fields {
        let Some((index, field)) = split_index(&key) else {
            continue;
        };
        let partial = partials.entry(index).or_default();
        match field {
            "path" => partial.path = Some(text(value, &key)?),
            "method" => partial.params.method = text(value, &key)?.parse::<HttpMethod>()?,
            "body" => partial.body_json = Some(text(value, &key)?),
            "body_type" => partial.body_type = Some(text(value, &key)?),
            "files.path" => partial.file_paths.push(text(value, &key)?),
            "files.files" => match value {
                FormValue::File(file) => partial.files.push(file),
                FormValue::Text(_) => {
                    return Err(EdenLinkError::SerializationError(format!(
                        "Batch field '{}' must be a file",
                        key
                    )))
                },
            },
            other => {
                if let Some(name) = other.strip_prefix("body.") {
                    partial.form.push((name.to_string(), value));
                } else if let Some(name) = other.strip_prefix("query.") {
                    let name = name.to_string();
                    let value = text(value, &key)?;
                    partial.params.query.insert(name, value);
                }
            },
        }
    }
    apply_headers(&mut partials, headers);
    into_requests(partials)
}

/// Put extracted files back at their dotted paths.
fn splice_files(json: JsonValue, files: Vec<(String, FilePart)>) -> Payload {
    if files.is_empty() {
        return Payload::Value(json);
    }
    let mut payload = to_payload(json);
    for (path, file) in files {
        set_file(&mut payload, &path, file);
    }
    payload
}

fn to_payload(json: JsonValue) -> Payload {
    match json {
        JsonValue::Object(map) => {
            Payload::Object(map.into_iter().map(|(k, v)| (k, to_payload(v))).collect())
        },
        JsonValue::Array(items) => Payload::Array(items.into_iter().map(to_payload).collect()),
        leaf => Payload::Value(leaf),
    }
}

fn set_file(node: &mut Payload, path: &str, file: FilePart) {
    if path.is_empty() {
        *node = Payload::File(file);
        return;
    }
    let (head, rest) = path.split_once('.').unwrap_or((path, ""));
    match node {
        Payload::Object(map) => set_file(
            map.entry(head.to_string())
                .or_insert(Payload::Value(JsonValue::Null)),
            rest,
            file,
        ),
        Payload::Array(items) => {
            if let Some(child) = head.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                set_file(child, rest, file);
            }
        },
        _ => {},
    }
}

fn element_result(result: EdenResult, headers: &BTreeMap<String, String>) -> LinkResult {
    let mut result = result.into_link_result();
    if let LinkResult::Data {
        response: Some(meta),
        ..
    }
    | LinkResult::Error {
        response: Some(meta),
        ..
    } = &mut result
    {
        meta.headers = headers.clone();
    }
    result
}

/// Demultiplex a batch response into `resolver`.
///
/// `404`/`405` mean the server has no batch endpoint. A non-array error
/// body fails every member with the same [`EdenLinkError::FetchStatusError`].
pub async fn read_batch_response(
    response: HttpResponse,
    resolver: &BatchResolver<LinkResult>,
) -> Result<()> {
    let status = response.status;
    if matches!(status, 404 | 405) {
        return Err(EdenLinkError::ConfigurationError(format!(
            "The server does not support batching (HTTP {})",
            status
        )));
    }
    let headers = response.headers.clone();
    let streamed = response
        .mime_type()
        .is_some_and(|mime| STREAMED_MIME_TYPES.contains(&mime.as_str()));
    if streamed && response.is_success() {
        return read_streamed(response, resolver, &headers).await;
    }

    match response.json_or_text().await? {
        JsonValue::Array(items) => {
            for (index, item) in items.into_iter().enumerate() {
                let result = serde_json::from_value::<EdenResult>(item)
                    .map(|r| element_result(r, &headers))
                    .map_err(EdenLinkError::from);
                resolver.resolve(index, result);
            }
            Ok(())
        },
        value if status >= 400 => Err(EdenLinkError::FetchStatusError { status, value }),
        other => Err(EdenLinkError::SerializationError(format!(
            "Expected a batch response array, got {}",
            other
        ))),
    }
}

async fn read_streamed(
    response: HttpResponse,
    resolver: &BatchResolver<LinkResult>,
    headers: &BTreeMap<String, String>,
) -> Result<()> {
    let mut body = response.into_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let settle = |line: &[u8]| -> Result<()> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let line: StreamedResult = serde_json::from_slice(line)?;
        log::debug!("[EDEN_BATCH] Streamed result for #{}", line.index);
        resolver.resolve(line.index, Ok(element_result(line.result, headers)));
        Ok(())
    };
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            settle(&line)?;
        }
    }
    settle(&buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationType;
    use bytes::Bytes;
    use serde_json::json;

    fn op(id: u64, path: &str, params: RequestParams) -> Operation {
        Operation::new(id, OperationType::Query, path, params)
    }

    #[test]
    fn test_get_batch_round_trip() {
        let ops = vec![
            op(1, "/a", RequestParams::get().query("x", 1).header("X-Trace", "t1")),
            op(2, "/b", RequestParams::get()),
        ];
        let url = encode_get_batch("http://h/api", "/batch", &ops).unwrap();
        assert!(url.starts_with("http://h/api/batch?0.path=%2Fa&0.method=GET&0.query.x=1"));

        let mut global = BTreeMap::new();
        global.insert("authorization".to_string(), "Bearer t".to_string());
        let headers = encode_batch_headers(&global, &ops);
        assert_eq!(headers.get("0.x-trace").map(String::as_str), Some("t1"));

        let decoded = decode_get_batch(&url, &headers).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].path, "/a");
        assert_eq!(decoded[0].params.query.get("x").map(String::as_str), Some("1"));
        assert_eq!(decoded[0].params.headers.get("x-trace").map(String::as_str), Some("t1"));
        assert_eq!(decoded[1].path, "/b");
        assert!(decoded[1].params.query.is_empty());
        assert_eq!(
            decoded[1].params.headers.get("authorization").map(String::as_str),
            Some("Bearer t")
        );
    }

    #[test]
    fn test_reserved_headers_are_not_forwarded() {
        let ops = vec![op(1, "/a", RequestParams::get().header("Content-Type", "text/plain"))];
        let headers = encode_batch_headers(&BTreeMap::new(), &ops);
        assert!(headers.is_empty());

        let mut incoming = BTreeMap::new();
        incoming.insert("content-type".to_string(), "multipart/form-data".to_string());
        incoming.insert("0.accept".to_string(), "text/html".to_string());
        let url = encode_get_batch("http://h", "/batch", &ops).unwrap();
        let decoded = decode_get_batch(&url, &incoming).unwrap();
        assert!(decoded[0].params.headers.is_empty());
    }

    #[test]
    fn test_bare_query_applies_to_all() {
        let decoded = decode_get_batch(
            "http://h/batch?0.path=%2Fa&1.path=%2Fb&1.query.v=2&v=1",
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(decoded[0].params.query.get("v").map(String::as_str), Some("1"));
        assert_eq!(decoded[1].params.query.get("v").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_post_batch_round_trip_with_files() {
        let mut doc = BTreeMap::new();
        doc.insert("title".to_string(), Payload::Value(json!("cv")));
        doc.insert("file".to_string(), Payload::File(FilePart::new("cv.pdf", b"%PDF".to_vec())));
        let ops = vec![
            op(1, "/docs", RequestParams::post().payload(Payload::Object(doc.clone()))),
            op(
                2,
                "/login",
                RequestParams::post().form(vec![("user".to_string(), FormValue::Text("ann".into()))]),
            ),
            op(3, "/plain", RequestParams::new(HttpMethod::Put).json(json!({"n": 1}))),
        ];
        let fields = encode_post_batch(&ops);
        let decoded = decode_post_batch(fields, &BTreeMap::new()).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].params.body, Some(RequestBody::Json(Payload::Object(doc))));
        assert_eq!(
            decoded[1].params.body,
            Some(RequestBody::FormData(vec![("user".to_string(), FormValue::Text("ann".into()))]))
        );
        assert_eq!(decoded[2].params.method, HttpMethod::Put);
        assert_eq!(decoded[2].params.body, Some(RequestBody::Json(Payload::Value(json!({"n": 1})))));
    }

    #[test]
    fn test_post_batch_keeps_query_parameters() {
        let ops = vec![
            op(1, "/a", RequestParams::get().query("x", 1).query("sort", "desc")),
            op(2, "/b", RequestParams::post().json(json!({"n": 2}))),
        ];
        let fields = encode_post_batch(&ops);
        let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"0.query.x"));
        assert!(keys.contains(&"0.query.sort"));

        let decoded = decode_post_batch(fields, &BTreeMap::new()).unwrap();
        assert_eq!(decoded[0].params.method, HttpMethod::Get);
        assert_eq!(decoded[0].params.query.get("x").map(String::as_str), Some("1"));
        assert_eq!(decoded[0].params.query.get("sort").map(String::as_str), Some("desc"));
        assert!(decoded[1].params.query.is_empty());
    }

    #[test]
    fn test_missing_index_is_rejected() {
        let err = decode_get_batch("http://h/batch?1.path=%2Fb", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, EdenLinkError::SerializationError(_)));
    }

    fn data_of(result: LinkResult) -> JsonValue {
        match result {
            LinkResult::Data { data, .. } => data,
            other => panic!("expected data, got {:?}", other),
        }
    }

    fn resolver(n: usize) -> (BatchResolver<LinkResult>, Vec<tokio::sync::oneshot::Receiver<Result<LinkResult>>>) {
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..n {
            let (tx, rx) = tokio::sync::oneshot::channel();
            senders.push(tx);
            receivers.push(rx);
        }
        (BatchResolver::new(senders), receivers)
    }

    #[tokio::test]
    async fn test_array_response_is_positional() {
        let (resolver, mut receivers) = resolver(2);
        let body = json!([
            {"type": "data", "data": {"id": 1}, "error": null},
            {"data": null, "error": {"status": 404, "value": "missing"}}
        ]);
        read_batch_response(HttpResponse::json(200, &body), &resolver).await.unwrap();

        let second = receivers.pop().unwrap().await.unwrap().unwrap();
        let first = receivers.pop().unwrap().await.unwrap().unwrap();
        assert_eq!(data_of(first), json!({"id": 1}));
        assert!(matches!(second, LinkResult::Error { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_streamed_lines_settle_out_of_order() {
        let (resolver, receivers) = resolver(2);
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/x-ndjson".to_string());
        let response = HttpResponse::from_chunks(
            200,
            headers,
            vec![
                Bytes::from(r#"{"index":1,"result":{"type":"data","data":"b"}}"#.to_string() + "\n{\"ind"),
                Bytes::from(r#"ex":0,"result":{"type":"data","data":"a"}}"#),
            ],
        );
        read_batch_response(response, &resolver).await.unwrap();
        let values: Vec<JsonValue> = futures_util::future::join_all(receivers)
            .await
            .into_iter()
            .map(|r| data_of(r.unwrap().unwrap()))
            .collect();
        assert_eq!(values, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_configuration_error() {
        let (resolver, _rx) = resolver(1);
        let err = read_batch_response(HttpResponse::json(404, &json!("no")), &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, EdenLinkError::ConfigurationError(_)));

        let err = read_batch_response(HttpResponse::json(500, &json!({"m": "x"})), &resolver)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
    }
}
