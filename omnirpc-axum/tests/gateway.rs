//! End-to-end gateway tests: one service registry served over binary
//! framing, the web-text variant, REST transcoding, and JSON-RPC envelopes,
//! driven in-process through the tower service.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine as _;
use http_body_util::BodyExt;
use omnirpc_axum::core::{base64_encode, frame_flags, frame_message};
use omnirpc_axum::prelude::*;
use omnirpc_axum::transcoding::TemplateError;
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower::ServiceExt;

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
struct EchoRequest {
    #[prost(string, tag = "1")]
    payload: String,
}

impl FieldNames for EchoRequest {
    const FIELD_NAMES: &'static [&'static str] = &["payload"];
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
struct EchoResponse {
    #[prost(string, tag = "1")]
    payload: String,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
struct GetBookRequest {
    #[prost(string, tag = "1")]
    shelf: String,
    #[prost(string, tag = "2")]
    book: String,
}

impl FieldNames for GetBookRequest {
    const FIELD_NAMES: &'static [&'static str] = &["shelf", "book"];
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
struct Book {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(string, tag = "2")]
    shelf: String,
}

fn gateway() -> RpcGateway {
    gateway_with(GatewayConfig::default())
}

fn gateway_with(config: GatewayConfig) -> RpcGateway {
    let echo = ServiceBuilder::new(ServiceName::new("test", "Echo"))
        .unary("Echo", None, |_ctx: CallContext, req: EchoRequest| async move {
            Ok(EchoResponse {
                payload: req.payload,
            })
        })
        .unary("Fail", None, |_ctx: CallContext, _req: EchoRequest| async move {
            Err::<EchoResponse, _>(Status::not_found("nothing here"))
        })
        .unary(
            "WaitForCancel",
            None,
            |ctx: CallContext, _req: EchoRequest| async move {
                ctx.closed().await;
                Err::<EchoResponse, _>(Status::cancelled("interrupted"))
            },
        )
        .server_streaming(
            "Repeat",
            None,
            |_ctx: CallContext, req: EchoRequest, mut out: Outbound<EchoResponse>| async move {
                for _ in 0..3 {
                    out.send(&EchoResponse {
                        payload: req.payload.clone(),
                    })
                    .await?;
                }
                Ok(())
            },
        )
        .build();

    let books = ServiceBuilder::new(ServiceName::new("library.v1", "Books"))
        .unary(
            "GetBook",
            HttpBinding::get("/v1/shelves/{shelf}/books/{book}"),
            |_ctx: CallContext, req: GetBookRequest| async move {
                Ok(Book {
                    name: format!("books/{}", req.book),
                    shelf: req.shelf,
                })
            },
        )
        .build();

    GatewayBuilder::new()
        .config(config)
        .register(echo)
        .register(books)
        .build()
        .expect("gateway build")
}

/// Split a length-prefixed frame sequence into (flags, payload) pairs.
fn split_frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        let flags = bytes[0];
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        frames.push((flags, bytes[5..5 + len].to_vec()));
        bytes = &bytes[5 + len..];
    }
    frames
}

fn binary_request(path: &str, content_type: &str, frames: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", content_type)
        .body(Body::from(frames.to_vec()))
        .unwrap()
}

// ============================================================================
// Binary protocol
// ============================================================================

#[tokio::test]
async fn test_binary_unary_round_trip() {
    let request = EchoRequest {
        payload: "hi".to_string(),
    };
    let body = frame_message(&request.encode_to_vec(), frame_flags::MESSAGE);

    let resp = gateway()
        .oneshot(binary_request("/test.Echo/Echo", "application/grpc+proto", &body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/grpc+proto");

    let collected = resp.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().expect("status trailers");
    assert_eq!(trailers["grpc-status"], "0");

    let frames = split_frames(&collected.to_bytes());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, frame_flags::MESSAGE);
    let decoded = EchoResponse::decode(frames[0].1.as_slice()).unwrap();
    assert_eq!(decoded.payload, "hi");
}

#[tokio::test]
async fn test_binary_json_format() {
    let payload = serde_json::to_vec(&json!({"payload": "hi"})).unwrap();
    let body = frame_message(&payload, frame_flags::MESSAGE);

    let resp = gateway()
        .oneshot(binary_request("/test.Echo/Echo", "application/grpc+json", &body))
        .await
        .unwrap();
    assert_eq!(resp.headers()["content-type"], "application/grpc+json");

    let collected = resp.into_body().collect().await.unwrap();
    let frames = split_frames(&collected.to_bytes());
    let value: Value = serde_json::from_slice(&frames[0].1).unwrap();
    assert_eq!(value, json!({"payload": "hi"}));
}

#[tokio::test]
async fn test_binary_server_streaming() {
    let request = EchoRequest {
        payload: "again".to_string(),
    };
    let body = frame_message(&request.encode_to_vec(), frame_flags::MESSAGE);

    let resp = gateway()
        .oneshot(binary_request("/test.Echo/Repeat", "application/grpc+proto", &body))
        .await
        .unwrap();

    let collected = resp.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().expect("status trailers");
    assert_eq!(trailers["grpc-status"], "0");

    let frames = split_frames(&collected.to_bytes());
    assert_eq!(frames.len(), 3);
    for (flags, payload) in frames {
        assert_eq!(flags, frame_flags::MESSAGE);
        let decoded = EchoResponse::decode(payload.as_slice()).unwrap();
        assert_eq!(decoded.payload, "again");
    }
}

#[tokio::test]
async fn test_binary_unknown_method() {
    let resp = gateway()
        .oneshot(binary_request("/test.Echo/Nope", "application/grpc+proto", &[]))
        .await
        .unwrap();

    // Trailers-only response: the status lives in the headers.
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["grpc-status"], "5");
}

#[tokio::test]
async fn test_binary_unary_rejects_second_request_message() {
    let request = EchoRequest {
        payload: "hi".to_string(),
    };
    let mut body = frame_message(&request.encode_to_vec(), frame_flags::MESSAGE).to_vec();
    body.extend_from_slice(&frame_message(&request.encode_to_vec(), frame_flags::MESSAGE));

    let resp = gateway()
        .oneshot(binary_request("/test.Echo/Echo", "application/grpc+proto", &body))
        .await
        .unwrap();

    let collected = resp.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().expect("status trailers");
    assert_eq!(trailers["grpc-status"], "3");
}

#[tokio::test]
async fn test_binary_message_too_large() {
    let gateway = gateway_with(GatewayConfig {
        limits: MessageLimits::new(16),
        ..GatewayConfig::default()
    });
    let request = EchoRequest {
        payload: "x".repeat(64),
    };
    let body = frame_message(&request.encode_to_vec(), frame_flags::MESSAGE);

    let resp = gateway
        .oneshot(binary_request("/test.Echo/Echo", "application/grpc+proto", &body))
        .await
        .unwrap();

    let collected = resp.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().expect("status trailers");
    assert_eq!(trailers["grpc-status"], "8");
}

#[tokio::test]
async fn test_binary_deadline_expiry() {
    let request = EchoRequest {
        payload: "hi".to_string(),
    };
    let body = frame_message(&request.encode_to_vec(), frame_flags::MESSAGE);
    let req = Request::builder()
        .method("POST")
        .uri("/test.Echo/WaitForCancel")
        .header("content-type", "application/grpc+proto")
        .header("grpc-timeout", "20m")
        .body(Body::from(body))
        .unwrap();

    let resp = gateway().oneshot(req).await.unwrap();
    let collected = resp.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().expect("status trailers");
    assert_eq!(trailers["grpc-status"], "4");
}

// ============================================================================
// Web-text protocol
// ============================================================================

#[tokio::test]
async fn test_web_text_round_trip() {
    let request = EchoRequest {
        payload: "hi".to_string(),
    };
    let frames = frame_message(&request.encode_to_vec(), frame_flags::MESSAGE);

    let resp = gateway()
        .oneshot(binary_request(
            "/test.Echo/Echo",
            "application/grpc-web-text+proto",
            &base64_encode(&frames),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"],
        "application/grpc-web-text+proto"
    );

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&body)
        .unwrap();

    let frames = split_frames(&decoded);
    assert_eq!(frames.len(), 2);

    assert_eq!(frames[0].0, frame_flags::MESSAGE);
    let response = EchoResponse::decode(frames[0].1.as_slice()).unwrap();
    assert_eq!(response.payload, "hi");

    // Trailers ride inside the body as a final flagged frame.
    assert_eq!(frames[1].0, frame_flags::TRAILER);
    let trailer = String::from_utf8(frames[1].1.clone()).unwrap();
    assert!(trailer.contains("grpc-status: 0"));
}

#[tokio::test]
async fn test_web_text_handler_error_in_trailer_frame() {
    let request = EchoRequest {
        payload: "hi".to_string(),
    };
    let frames = frame_message(&request.encode_to_vec(), frame_flags::MESSAGE);

    let resp = gateway()
        .oneshot(binary_request(
            "/test.Echo/Fail",
            "application/grpc-web-text+proto",
            &base64_encode(&frames),
        ))
        .await
        .unwrap();

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&body)
        .unwrap();

    let frames = split_frames(&decoded);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, frame_flags::TRAILER);
    let trailer = String::from_utf8(frames[0].1.clone()).unwrap();
    assert!(trailer.contains("grpc-status: 5"));
    assert!(trailer.contains("nothing here"));
}

// ============================================================================
// Transcoding protocol
// ============================================================================

#[tokio::test]
async fn test_transcoding_path_variables() {
    let req = Request::builder()
        .method("GET")
        .uri("/v1/shelves/5/books/dune")
        .body(Body::empty())
        .unwrap();

    let resp = gateway().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/json");

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, json!({"name": "books/dune", "shelf": "5"}));
}

#[tokio::test]
async fn test_transcoding_canonical_binding() {
    // Methods without an explicit HTTP binding stay reachable through the
    // synthesized POST binding on their RPC path.
    let req = Request::builder()
        .method("POST")
        .uri("/test.Echo/Echo")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&json!({"payload": "hi"})).unwrap()))
        .unwrap();

    let resp = gateway().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, json!({"payload": "hi"}));
}

#[tokio::test]
async fn test_transcoding_handler_error_maps_to_http_status() {
    let req = Request::builder()
        .method("POST")
        .uri("/test.Echo/Fail")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&json!({"payload": "x"})).unwrap()))
        .unwrap();

    let resp = gateway().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["code"], "not_found");
    assert_eq!(value["message"], "nothing here");
}

#[tokio::test]
async fn test_transcoding_unmatched_route_is_404() {
    let req = Request::builder()
        .method("GET")
        .uri("/v1/drawers/5")
        .body(Body::empty())
        .unwrap();

    let resp = gateway().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[test]
fn test_ambiguous_bindings_fail_gateway_build() {
    let a = ServiceBuilder::new(ServiceName::new("test", "A"))
        .unary(
            "Get",
            HttpBinding::get("/v1/things/{thing}"),
            |_ctx: CallContext, req: EchoRequest| async move {
                Ok(EchoResponse {
                    payload: req.payload,
                })
            },
        )
        .build();
    let b = ServiceBuilder::new(ServiceName::new("test", "B"))
        .unary(
            "Get",
            HttpBinding::get("/v1/things/*"),
            |_ctx: CallContext, req: EchoRequest| async move {
                Ok(EchoResponse {
                    payload: req.payload,
                })
            },
        )
        .build();

    let err = GatewayBuilder::new().register(a).register(b).build().unwrap_err();
    assert!(matches!(
        err,
        BuildError::Template(TemplateError::Ambiguous(_, _))
    ));
}

// ============================================================================
// JSON-RPC envelope protocol
// ============================================================================

async fn post_envelope(gateway: &RpcGateway, body: Vec<u8>) -> (StatusCode, bytes::Bytes) {
    let req = Request::builder()
        .method("POST")
        .uri("/test.Echo")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let resp = gateway.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

#[tokio::test]
async fn test_envelope_result_echoes_id() {
    let request = json!({
        "jsonrpc": "2.0",
        "method": "Echo",
        "params": {"payload": "hi"},
        "id": 1,
    });
    let (status, body) =
        post_envelope(&gateway(), serde_json::to_vec(&request).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["jsonrpc"], "2.0");
    assert_eq!(value["result"], json!({"payload": "hi"}));
    assert_eq!(value["id"], 1);
}

#[tokio::test]
async fn test_envelope_notification_produces_no_bytes() {
    let request = json!({
        "jsonrpc": "2.0",
        "method": "Echo",
        "params": {"payload": "hi"},
    });
    let (status, body) =
        post_envelope(&gateway(), serde_json::to_vec(&request).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_envelope_positional_params() {
    let request = json!({
        "jsonrpc": "2.0",
        "method": "Echo",
        "params": ["hi"],
        "id": 2,
    });
    let (_, body) = post_envelope(&gateway(), serde_json::to_vec(&request).unwrap()).await;

    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["result"], json!({"payload": "hi"}));

    // Array length must equal the declared field count.
    let request = json!({
        "jsonrpc": "2.0",
        "method": "Echo",
        "params": ["hi", "extra"],
        "id": 3,
    });
    let (_, body) = post_envelope(&gateway(), serde_json::to_vec(&request).unwrap()).await;
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["code"], -32602);
    assert_eq!(value["id"], 3);
}

#[tokio::test]
async fn test_envelope_method_not_found() {
    let request = json!({
        "jsonrpc": "2.0",
        "method": "Nope",
        "id": 1,
    });
    let (status, body) =
        post_envelope(&gateway(), serde_json::to_vec(&request).unwrap()).await;

    // Envelope failures ride in the envelope, not the HTTP status.
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["code"], -32601);
    assert_eq!(value["id"], 1);
}

#[tokio::test]
async fn test_envelope_parse_error() {
    let (status, body) = post_envelope(&gateway(), b"{oops".to_vec()).await;

    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["code"], -32700);
    assert_eq!(value["id"], Value::Null);
}

#[tokio::test]
async fn test_envelope_invalid_request() {
    let (_, body) =
        post_envelope(&gateway(), serde_json::to_vec(&json!({"jsonrpc": "2.0"})).unwrap()).await;

    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["code"], -32600);
}

#[tokio::test]
async fn test_envelope_batch() {
    let batch = json!([
        {"jsonrpc": "2.0", "method": "Echo", "params": {"payload": "a"}, "id": 1},
        {"jsonrpc": "2.0", "method": "Echo", "params": {"payload": "b"}},
        42,
        {"jsonrpc": "2.0", "method": "Nope", "id": 3},
    ]);
    let (_, body) = post_envelope(&gateway(), serde_json::to_vec(&batch).unwrap()).await;

    let Value::Array(responses) = serde_json::from_slice(&body).unwrap() else {
        panic!("expected a batch response array");
    };
    // The notification produced no entry; the malformed entry produced an
    // error entry at its position without failing the batch.
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["result"], json!({"payload": "a"}));
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[1]["error"]["code"], -32600);
    assert_eq!(responses[2]["error"]["code"], -32601);
    assert_eq!(responses[2]["id"], 3);
}

#[tokio::test]
async fn test_envelope_batch_of_notifications_produces_no_body() {
    let batch = json!([
        {"jsonrpc": "2.0", "method": "Echo", "params": {"payload": "a"}},
        {"jsonrpc": "2.0", "method": "Echo", "params": {"payload": "b"}},
    ]);
    let (status, body) = post_envelope(&gateway(), serde_json::to_vec(&batch).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_envelope_empty_batch_rejected() {
    let (_, body) = post_envelope(&gateway(), b"[]".to_vec()).await;

    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["code"], -32600);
}

#[tokio::test]
async fn test_envelope_cancel_unknown_id_is_ignored() {
    let request = json!({
        "jsonrpc": "2.0",
        "method": "rpc.cancel",
        "params": {"id": 99},
        "id": 1,
    });
    let (status, body) =
        post_envelope(&gateway(), serde_json::to_vec(&request).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["result"], Value::Null);
    assert_eq!(value["id"], 1);
}

// ============================================================================
// In-process invocation
// ============================================================================

#[tokio::test]
async fn test_invoke_json_bypasses_transport() {
    let gateway = gateway();

    let result = gateway
        .invoke_json("test.Echo", "Echo", json!({"payload": "hi"}))
        .await
        .unwrap();
    assert_eq!(result, json!({"payload": "hi"}));

    let err = gateway
        .invoke_json("test.Echo", "Nope", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let err = gateway
        .invoke_json("test.Echo", "Repeat", json!({"payload": "hi"}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}
