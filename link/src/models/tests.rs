use serde_json::json;
use std::collections::BTreeMap;

use super::*;
use crate::error::EdenLinkError;

// ==================== ConnectionOptions Tests ====================

#[test]
fn test_connection_options_default() {
    let opts = ConnectionOptions::default();

    assert!(opts.auto_reconnect, "auto_reconnect should default to true");
    assert_eq!(opts.reconnect_delay_ms, 1000);
    assert_eq!(opts.max_reconnect_delay_ms, 30000);
    assert!(opts.max_reconnect_attempts.is_none(), "retries are unbounded by default");
    assert!(!opts.lazy);
}

#[test]
fn test_connection_options_deserialize_partial() {
    let opts: ConnectionOptions = serde_json::from_value(json!({"lazy": true})).unwrap();
    assert!(opts.lazy);
    assert!(opts.auto_reconnect);
    assert_eq!(opts.reconnect_delay_ms, 1000);
}

#[test]
fn test_retry_delay_backoff() {
    let opts = ConnectionOptions::default();
    assert_eq!(opts.retry_delay_ms(0), 0, "first attempt is immediate");
    assert_eq!(opts.retry_delay_ms(1), 2000);
    assert_eq!(opts.retry_delay_ms(2), 4000);
    assert_eq!(opts.retry_delay_ms(4), 16000);
    assert_eq!(opts.retry_delay_ms(5), 30000, "capped at max");
    assert_eq!(opts.retry_delay_ms(200), 30000, "no overflow on huge attempts");
}

// ==================== Operation Tests ====================

#[test]
fn test_operation_type_serialization() {
    assert_eq!(serde_json::to_value(OperationType::Subscription).unwrap(), json!("subscription"));
    assert_eq!(OperationType::Mutation.to_string(), "mutation");
}

#[test]
fn test_operation_abort_flag() {
    let signal = tokio_util::sync::CancellationToken::new();
    let op = Operation::new(1, OperationType::Query, "/users", RequestParams::get())
        .with_signal(signal.clone());
    assert!(!op.is_aborted());
    signal.cancel();
    assert!(op.is_aborted());
}

#[test]
fn test_context_mutation() {
    let mut ctx = OperationContext::new();
    assert!(ctx.is_empty());
    ctx.insert("lastEventId", json!("4"));
    assert_eq!(ctx.get("lastEventId"), Some(&json!("4")));
    assert_eq!(ctx.remove("lastEventId"), Some(json!("4")));
    assert!(ctx.is_empty());
}

// ==================== RequestParams Tests ====================

#[test]
fn test_http_method_parse() {
    assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
    assert_eq!(HttpMethod::default(), HttpMethod::Get);
    assert!(matches!(
        "FETCH".parse::<HttpMethod>(),
        Err(EdenLinkError::SerializationError(_))
    ));
}

#[test]
fn test_payload_extract_files() {
    let avatar = FilePart::new("a.png", b"png".to_vec()).with_content_type("image/png");
    let doc = FilePart::new("b.txt", b"txt".to_vec());
    let mut inner = BTreeMap::new();
    inner.insert("name".to_string(), Payload::Value(json!("eve")));
    inner.insert("avatar".to_string(), Payload::File(avatar.clone()));
    inner.insert(
        "attachments".to_string(),
        Payload::Array(vec![Payload::Value(json!(1)), Payload::File(doc.clone())]),
    );
    let payload = Payload::Object(inner);

    assert!(payload.has_files());
    let (json, files) = payload.extract_files();
    assert_eq!(json, json!({"name": "eve", "avatar": null, "attachments": [1, null]}));
    assert_eq!(
        files,
        vec![("attachments.1".to_string(), doc), ("avatar".to_string(), avatar)]
    );
}

#[test]
fn test_request_params_builder() {
    let params = RequestParams::post()
        .query("page", 2)
        .header("x-trace", "abc")
        .json(json!({"title": "hi"}));
    assert_eq!(params.method, HttpMethod::Post);
    assert_eq!(params.query.get("page").map(String::as_str), Some("2"));
    assert_eq!(params.headers.get("x-trace").map(String::as_str), Some("abc"));
    assert!(matches!(params.body, Some(RequestBody::Json(Payload::Value(_)))));
}

// ==================== LinkResult Tests ====================

#[test]
fn test_eden_result_wire_shapes() {
    let ok: EdenResult =
        serde_json::from_value(json!({"type": "data", "data": {"id": 1}, "error": null}))
            .unwrap();
    assert_eq!(
        ok.into_link_result(),
        LinkResult::Data {
            data: json!({"id": 1}),
            id: None,
            response: Some(ResponseMeta::with_status(200)),
        }
    );

    let err: EdenResult =
        serde_json::from_value(json!({"data": null, "error": {"status": 404, "value": "nope"}}))
            .unwrap();
    assert!(matches!(
        err.into_link_result(),
        LinkResult::Error { status: 404, .. }
    ));
}

#[test]
fn test_into_response_maps_errors() {
    let err = LinkResult::Error {
        status: 401,
        value: json!({"message": "unauthorized"}),
        response: None,
    }
    .into_response()
    .unwrap_err();
    assert_eq!(err.status(), Some(401));

    let ok = LinkResult::data(json!([1, 2])).into_response().unwrap();
    assert_eq!(ok.json::<Vec<u8>>().unwrap(), vec![1, 2]);
}

// ==================== ConnectionState Tests ====================

#[test]
fn test_connection_state_names() {
    assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    assert_eq!(ConnectionState::connecting().as_str(), "connecting");
    let state = ConnectionState::Connecting {
        error: Some(EdenLinkError::WebSocketClosedError("1006".into())),
    };
    assert!(state.is_connecting());
    assert!(state.to_string().starts_with("connecting ("));
}

// ==================== WebSocket Envelope Tests ====================

#[test]
fn test_client_envelope_serialization() {
    let mut op = Operation::new(
        7,
        OperationType::Subscription,
        "/chat",
        RequestParams::get().query("room", "a"),
    );
    op.context.insert("lastEventId", json!("3"));
    let frame = encode_client_frame(&[ClientEnvelope::request(&op).unwrap(), ClientEnvelope::stop(2)])
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(
        value,
        json!([
            {
                "id": 7,
                "method": "subscription",
                "params": {"path": "/chat", "method": "GET", "query": {"room": "a"}, "lastEventId": "3"}
            },
            {"id": 2, "method": "subscription.stop"}
        ])
    );
}

#[test]
fn test_websocket_rejects_file_bodies() {
    let op = Operation::new(
        1,
        OperationType::Mutation,
        "/upload",
        RequestParams::post().payload(Payload::File(FilePart::new("x", b"1".to_vec()))),
    );
    assert!(matches!(
        ClientEnvelope::request(&op),
        Err(EdenLinkError::ConfigurationError(_))
    ));
}

#[test]
fn test_decode_server_frame_single_or_array() {
    let one = decode_server_frame(r#"{"id":1,"result":{"type":"started"}}"#).unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].result, Some(ServerResult::Started));

    let many = decode_server_frame(
        r#"[{"id":2,"result":{"type":"data","data":{"n":1},"id":"9"}},{"id":3,"error":{"code":"NOT_FOUND"}}]"#,
    )
    .unwrap();
    assert_eq!(many.len(), 2);
    assert_eq!(
        many[0].result,
        Some(ServerResult::Data {
            data: json!({"n": 1}),
            id: Some("9".into())
        })
    );
    assert!(many[1].error.is_some());

    let push = decode_server_frame(r#"{"id":null,"result":{"type":"reconnect"}}"#).unwrap();
    assert!(push[0].is_reconnect());
}

#[test]
fn test_malformed_envelope_does_not_drop_its_siblings() {
    let frame = decode_server_frame(
        r#"[{"id":1,"result":{"type":"data","data":"a"}},{"id":"oops","result":{"type":"bogus"}},{"id":3,"result":{"type":"stopped"}}]"#,
    )
    .unwrap();
    assert_eq!(frame.len(), 2);
    assert_eq!(frame[0].id, Some(1));
    assert_eq!(frame[1].id, Some(3));
    assert_eq!(frame[1].result, Some(ServerResult::Stopped));

    assert!(decode_server_frame(r#"{"id":"oops"}"#).is_err());
    assert!(decode_server_frame("not json").is_err());
}
