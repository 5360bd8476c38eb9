//! The gateway: immutable registry, protocol dispatch, and the tower
//! service tying them together.
//!
//! A [`GatewayBuilder`] collects services and compiles the lookup tables
//! before serving begins; [`RpcGateway`] is the resulting clone-able tower
//! service. Per request, the protocol adapters are offered the request head
//! in priority order, the claiming adapter's frame codec and codecs are
//! wired into a call, and the dispatcher drives the registered handler.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, header};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use http_body::Frame;
use http_body_util::BodyExt;
use omnirpc_axum_core::{
    Code, ContentEncoding, Deframer, EnvelopeDeframer, FrameError, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, LengthPrefixedDeframer, Status, TextDeframer, WholeBodyDeframer, WireFormat,
    WireMessage, base64_encode, error_codes, frame_flags, frame_message,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::adapter::{ADAPTER_PRIORITY, Accepted, Protocol};
use crate::call::{CallContext, CallShared, ResponseSink};
use crate::config::GatewayConfig;
use crate::service::{Cardinality, ErasedMethod, Service};
use crate::transcoding::body::{assemble_request, project_response};
use crate::transcoding::{PathMatch, PathMatcher, PathMatcherBuilder, TemplateError};

/// Startup configuration failure. Never silently dropped: building the
/// gateway fails instead of serving with a broken route table.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("duplicate method registration: {0}")]
    DuplicateMethod(String),
}

/// Builder collecting services and configuration for one gateway.
#[derive(Default)]
pub struct GatewayBuilder {
    services: Vec<Service>,
    config: GatewayConfig,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    /// Compile the immutable registry and path matcher.
    ///
    /// All route tables are built here, before any request is served;
    /// nothing is mutated afterwards.
    pub fn build(self) -> Result<RpcGateway, BuildError> {
        let mut methods: HashMap<String, Arc<dyn ErasedMethod>> = HashMap::new();
        let mut services = HashSet::new();
        let mut matcher_builder = PathMatcherBuilder::new();

        for service in &self.services {
            services.insert(service.name().full_name());
            for method in service.methods() {
                let path = method.method_path().to_string();
                if methods.insert(path.clone(), method.clone()).is_some() {
                    return Err(BuildError::DuplicateMethod(path));
                }
                register_http(&mut matcher_builder, method)?;
            }
        }

        let matcher = matcher_builder.build()?;
        Ok(RpcGateway {
            inner: Arc::new(Registry {
                methods,
                services,
                matcher,
                config: self.config,
                active: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Register a method's HTTP bindings with the path matcher, synthesizing a
/// canonical binding when none of its bindings collapse to the method's
/// own RPC path, so every method stays reachable over the JSON surface.
fn register_http(
    builder: &mut PathMatcherBuilder,
    method: &Arc<dyn ErasedMethod>,
) -> Result<(), TemplateError> {
    let canonical = method.method_path();
    let mut has_canonical = false;

    if let Some(binding) = method.http_binding() {
        let mut stack = vec![binding];
        while let Some(b) = stack.pop() {
            if b.path == canonical {
                has_canonical = true;
            }
            builder.register(
                b.verb.clone(),
                &b.path,
                b.body.clone(),
                b.response_body.clone(),
                canonical,
            )?;
            for extra in &b.additional_bindings {
                stack.push(extra);
            }
        }
    }

    if !has_canonical {
        builder.register(
            Method::POST,
            canonical,
            Some("*".to_string()),
            None,
            canonical,
        )?;
    }
    Ok(())
}

/// The immutable state shared by every call.
pub(crate) struct Registry {
    methods: HashMap<String, Arc<dyn ErasedMethod>>,
    services: HashSet<String>,
    matcher: PathMatcher,
    config: GatewayConfig,
    /// JSON-RPC calls in flight, keyed by serialized correlation id, so a
    /// `rpc.cancel` envelope can reach them.
    active: Mutex<HashMap<String, Arc<CallShared>>>,
}

/// The gateway service.
///
/// Implements `tower::Service<Request<Body>>`, so it can be served
/// directly or mounted into an axum router as a fallback service:
///
/// ```ignore
/// let gateway = GatewayBuilder::new().register(service).build()?;
/// let app = axum::Router::new().fallback_service(gateway);
/// ```
#[derive(Clone)]
pub struct RpcGateway {
    inner: Arc<Registry>,
}

impl std::fmt::Debug for RpcGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcGateway").finish_non_exhaustive()
    }
}

impl RpcGateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Invoke a unary method in-process, bypassing transport framing.
    ///
    /// This is the direct invocation path for embedders (tool-calling
    /// bridges, the JSON-RPC batch expansion): params in, result value
    /// out, no fake transport request in between.
    pub async fn invoke_json(
        &self,
        service: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, Status> {
        invoke_json(&self.inner, service, method, params).await
    }
}

impl tower::Service<Request<Body>> for RpcGateway {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let registry = self.inner.clone();
        Box::pin(async move { Ok(handle(registry, req).await) })
    }
}

/// Offer the request to each adapter in priority order; serve through the
/// first claim.
async fn handle(registry: Arc<Registry>, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();

    for protocol in ADAPTER_PRIORITY {
        let Some(accepted) = protocol.try_accept(&parts, &registry.matcher, &registry.services)
        else {
            continue;
        };
        tracing::debug!(target: "omnirpc", ?protocol, path = %parts.uri.path(), "adapter claimed request");

        return match accepted {
            Accepted::Framed {
                protocol,
                method_path,
                format,
                encoding,
                timeout,
                content_type,
            } => match protocol {
                Protocol::Binary => serve_binary(
                    registry,
                    method_path,
                    format,
                    encoding,
                    timeout,
                    content_type,
                    body,
                ),
                _ => {
                    serve_web_text(
                        registry,
                        method_path,
                        format,
                        encoding,
                        timeout,
                        content_type,
                        body,
                    )
                    .await
                }
            },
            Accepted::Transcoded { matched } => serve_transcoded(registry, matched, body).await,
            Accepted::Envelope { service } => serve_envelope(registry, service, body).await,
        };
    }

    json_error_response(
        StatusCode::NOT_FOUND,
        &Status::not_found("no service or route matches the request"),
    )
}

// ============================================================================
// Shared call plumbing
// ============================================================================

fn deadline_for(config: &GatewayConfig, timeout: Option<Duration>) -> Option<Instant> {
    timeout
        .or(config.default_timeout)
        .map(|d| Instant::now() + d)
}

/// Arm the deadline timer: expiry cancels the call unless it already
/// reached a terminal state.
fn spawn_deadline(shared: &Arc<CallShared>) {
    let Some(deadline) = shared.deadline() else {
        return;
    };
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                shared.cancel(Status::deadline_exceeded("deadline exceeded"));
            }
            _ = shared.closed() => {}
        }
    });
}

/// Feed transport body chunks through a deframer into the call's inbound
/// channel, preserving arrival order.
async fn pump_inbound<D: Deframer>(
    mut body: Body,
    mut deframer: D,
    tx: mpsc::Sender<Result<WireMessage, Status>>,
    shared: Arc<CallShared>,
) {
    loop {
        while let Some(item) = deframer.next() {
            match item {
                Ok(msg) => {
                    if tx.send(Ok(msg)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(target: "omnirpc", %err, "inbound framing failed");
                    let _ = tx.send(Err(Status::from(err))).await;
                    return;
                }
            }
        }

        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    deframer.update(data);
                }
            }
            Some(Err(err)) => {
                shared.cancel(Status::cancelled(format!("transport error: {err}")));
                let _ = tx
                    .send(Err(Status::cancelled("transport closed mid-request")))
                    .await;
                return;
            }
            None => {
                deframer.end();
                while let Some(item) = deframer.next() {
                    match item {
                        Ok(msg) => {
                            if tx.send(Ok(msg)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(Status::from(err))).await;
                            return;
                        }
                    }
                }
                return;
            }
        }
    }
}

/// A channel pre-loaded with the single request message of a one-shot call.
fn single_message_channel(msg: WireMessage) -> mpsc::Receiver<Result<WireMessage, Status>> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(Ok(msg));
    rx
}

/// Run the handler and collect its response messages, resolving the final
/// status: the handler's error if it failed, the cancellation status if
/// the call was cancelled, OK otherwise.
async fn invoke_collect(
    registry: &Arc<Registry>,
    method: &Arc<dyn ErasedMethod>,
    shared: &Arc<CallShared>,
    inbound: mpsc::Receiver<Result<WireMessage, Status>>,
    response_format: WireFormat,
) -> (Status, Vec<WireMessage>) {
    spawn_deadline(shared);

    let (out_tx, mut out_rx) = mpsc::channel(registry.config.response_queue);
    let limit = method.cardinality().single_response().then_some(1);
    let sink = ResponseSink::new(out_tx.clone(), shared.clone(), limit);
    let ctx = CallContext::new(shared.clone());

    let invoke_shared = shared.clone();
    let invoke = async move {
        let result = method.invoke(ctx, inbound, sink, response_format).await;
        match result {
            Ok(()) => invoke_shared.finish(Status::ok()),
            Err(status) => {
                tracing::debug!(target: "omnirpc", %status, method = method.method_path(), "handler failed");
                invoke_shared.finish(status);
            }
        }
        // Keep the channel open until the final status is set.
        drop(out_tx);
    };
    let collect = async {
        let mut messages = Vec::new();
        while let Some(msg) = out_rx.recv().await {
            messages.push(msg);
        }
        messages
    };

    let ((), messages) = tokio::join!(invoke, collect);
    (shared.status(), messages)
}

/// Read a one-shot request body through its deframer.
async fn deframe_one<D: Deframer>(mut body: Body, deframer: &mut D) -> Result<WireMessage, Status> {
    loop {
        if let Some(item) = deframer.next() {
            return item.map_err(Status::from);
        }
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    deframer.update(data);
                }
            }
            Some(Err(err)) => {
                return Err(Status::cancelled(format!("transport error: {err}")));
            }
            None => {
                deframer.end();
                return match deframer.next() {
                    Some(item) => item.map_err(Status::from),
                    None => Err(Status::invalid_argument("empty request body")),
                };
            }
        }
    }
}

// ============================================================================
// Binary protocol
// ============================================================================

/// Serve a binary-framed call: respond immediately with a streaming body,
/// trailers carrying the final status.
fn serve_binary(
    registry: Arc<Registry>,
    method_path: String,
    format: WireFormat,
    encoding: ContentEncoding,
    timeout: Option<Duration>,
    content_type: &'static str,
    body: Body,
) -> Response<Body> {
    let Some(method) = registry.methods.get(&method_path).cloned() else {
        return trailers_only_response(
            content_type,
            &Status::not_found(format!("unknown method: {method_path}")),
        );
    };
    if !method.accepts(format) {
        return trailers_only_response(
            content_type,
            &Status::invalid_argument("method does not accept the request wire format"),
        );
    }

    let shared = CallShared::new(deadline_for(&registry.config, timeout));
    spawn_deadline(&shared);

    let queue = registry.config.response_queue;
    let (in_tx, in_rx) = mpsc::channel(queue);
    let (out_tx, out_rx) = mpsc::channel(queue);

    let deframer = LengthPrefixedDeframer::new(
        format,
        encoding,
        registry.config.limits.max_message_size(),
    );
    tokio::spawn(pump_inbound(body, deframer, in_tx, shared.clone()));

    let limit = method.cardinality().single_response().then_some(1);
    let sink = ResponseSink::new(out_tx.clone(), shared.clone(), limit);
    let ctx = CallContext::new(shared.clone());
    let dispatch_shared = shared.clone();
    tokio::spawn(async move {
        let result = method.invoke(ctx, in_rx, sink, format).await;
        match result {
            Ok(()) => dispatch_shared.finish(Status::ok()),
            Err(status) => {
                tracing::debug!(target: "omnirpc", %status, "handler failed");
                dispatch_shared.finish(status);
            }
        }
        // Trailers read the final status; close the channel only after it
        // is set.
        drop(out_tx);
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::new(FramedResponseBody::new(out_rx, shared)))
        .expect("response build failed")
}

/// Trailers-only response: the status rendered in headers, empty body.
fn trailers_only_response(content_type: &'static str, status: &Status) -> Response<Body> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header("grpc-status", status.code().as_u32());
    if let Some(message) = status.message() {
        if let Ok(value) = HeaderValue::from_str(message) {
            builder = builder.header("grpc-message", value);
        }
    }
    builder.body(Body::empty()).expect("response build failed")
}

fn status_trailers(status: &Status) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from(status.code().as_u32()));
    if let Some(message) = status.message() {
        if let Ok(value) = HeaderValue::from_str(message) {
            trailers.insert("grpc-message", value);
        }
    }
    trailers
}

pin_project_lite::pin_project! {
    /// Streaming response body: length-prefixed message frames in handler
    /// order, then the status trailers once the call ends.
    struct FramedResponseBody {
        rx: mpsc::Receiver<WireMessage>,
        shared: Arc<CallShared>,
        trailers_sent: bool,
    }
}

impl FramedResponseBody {
    fn new(rx: mpsc::Receiver<WireMessage>, shared: Arc<CallShared>) -> Self {
        Self {
            rx,
            shared,
            trailers_sent: false,
        }
    }
}

impl http_body::Body for FramedResponseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if *this.trailers_sent {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(msg)) => Poll::Ready(Some(Ok(Frame::data(frame_message(
                msg.payload(),
                frame_flags::MESSAGE,
            ))))),
            Poll::Ready(None) => {
                *this.trailers_sent = true;
                Poll::Ready(Some(Ok(Frame::trailers(status_trailers(
                    &this.shared.status(),
                )))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ============================================================================
// Web-text protocol
// ============================================================================

/// Serve a text-variant call. The request body is base64 as a unit, so the
/// response is buffered and encoded the same way: message frames, a
/// trailer frame, one base64 unit.
async fn serve_web_text(
    registry: Arc<Registry>,
    method_path: String,
    format: WireFormat,
    encoding: ContentEncoding,
    timeout: Option<Duration>,
    content_type: &'static str,
    body: Body,
) -> Response<Body> {
    let Some(method) = registry.methods.get(&method_path).cloned() else {
        return web_text_response(
            content_type,
            &Status::not_found(format!("unknown method: {method_path}")),
            &[],
        );
    };
    if !method.accepts(format) {
        return web_text_response(
            content_type,
            &Status::invalid_argument("method does not accept the request wire format"),
            &[],
        );
    }

    let shared = CallShared::new(deadline_for(&registry.config, timeout));

    let (in_tx, in_rx) = mpsc::channel(registry.config.response_queue);
    let deframer = TextDeframer::new(format, encoding, registry.config.limits.max_message_size());
    tokio::spawn(pump_inbound(body, deframer, in_tx, shared.clone()));

    let (status, messages) = invoke_collect(&registry, &method, &shared, in_rx, format).await;
    web_text_response(content_type, &status, &messages)
}

fn web_text_response(
    content_type: &'static str,
    status: &Status,
    messages: &[WireMessage],
) -> Response<Body> {
    let mut frames = BytesMut::new();
    for msg in messages {
        frames.extend_from_slice(&frame_message(msg.payload(), frame_flags::MESSAGE));
    }

    // Trailers become a final frame inside the body, flagged 0x80.
    let mut trailer = format!("grpc-status: {}\r\n", status.code().as_u32());
    if let Some(message) = status.message() {
        trailer.push_str(&format!("grpc-message: {message}\r\n"));
    }
    frames.extend_from_slice(&frame_message(trailer.as_bytes(), frame_flags::TRAILER));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(base64_encode(&frames)))
        .expect("response build failed")
}

// ============================================================================
// Transcoding protocol
// ============================================================================

async fn serve_transcoded(
    registry: Arc<Registry>,
    matched: PathMatch,
    body: Body,
) -> Response<Body> {
    let Some(method) = registry.methods.get(&matched.method_path).cloned() else {
        return json_error_response(
            StatusCode::NOT_FOUND,
            &Status::not_found(format!("unknown method: {}", matched.method_path)),
        );
    };
    if method.cardinality() != Cardinality::Unary {
        return json_error_response(
            StatusCode::NOT_IMPLEMENTED,
            &Status::unimplemented("streaming methods are not reachable over the REST surface"),
        );
    }

    let mut deframer =
        WholeBodyDeframer::new(WireFormat::Json, registry.config.limits.max_message_size());
    let raw = match deframe_one(body, &mut deframer).await {
        Ok(msg) => msg,
        Err(status) => return json_error_response(http_code(&status), &status),
    };

    let assembled = match assemble_request(raw.payload(), matched.body.as_deref(), &matched.bindings)
    {
        Ok(value) => value,
        Err(status) => return json_error_response(http_code(&status), &status),
    };
    let payload = serde_json::to_vec(&assembled).expect("json value serialization");
    let request = WireMessage::new(WireFormat::Json, Bytes::from(payload));

    let shared = CallShared::new(deadline_for(&registry.config, None));
    let (status, mut messages) = invoke_collect(
        &registry,
        &method,
        &shared,
        single_message_channel(request),
        WireFormat::Json,
    )
    .await;

    if status.code() != Code::Ok {
        return json_error_response(http_code(&status), &status);
    }

    let response_value = messages
        .pop()
        .map(|msg| serde_json::from_slice(msg.payload()).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    let projected = project_response(matched.response_body.as_deref(), response_value);
    let bytes = serde_json::to_vec(&projected).expect("json value serialization");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("response build failed")
}

fn http_code(status: &Status) -> StatusCode {
    StatusCode::from_u16(status.code().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn json_error_response(code: StatusCode, status: &Status) -> Response<Body> {
    let body = serde_json::to_vec(status).expect("status serialization");
    Response::builder()
        .status(code)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("response build failed")
}

// ============================================================================
// JSON-RPC envelope protocol
// ============================================================================

/// Built-in envelope method cancelling an in-flight call by correlation id.
const CANCEL_METHOD: &str = "rpc.cancel";

async fn serve_envelope(registry: Arc<Registry>, service: String, body: Body) -> Response<Body> {
    // Accumulate the body first: a JSON array is a batch expanded through
    // the in-process invocation path, anything else goes through the
    // envelope deframer.
    let mut deframer =
        WholeBodyDeframer::new(WireFormat::Json, registry.config.limits.max_message_size());
    let raw = match deframe_one(body, &mut deframer).await {
        Ok(msg) => msg.into_payload(),
        Err(status) => {
            return envelope_error_response(None, JsonRpcError::from_status(&status));
        }
    };

    let first_byte = raw.iter().copied().find(|b| !b.is_ascii_whitespace());
    if first_byte == Some(b'[') {
        return serve_envelope_batch(&registry, &service, &raw).await;
    }

    let mut envelope = EnvelopeDeframer::new(registry.config.limits.max_message_size());
    envelope.update(raw);
    envelope.end();

    let msg = match envelope.next() {
        Some(Ok(msg)) => msg,
        Some(Err(FrameError::EnvelopeParse(err))) => {
            return envelope_error_response(
                None,
                JsonRpcError::new(error_codes::PARSE_ERROR, format!("parse error: {err}")),
            );
        }
        Some(Err(FrameError::EnvelopeInvalid(err))) => {
            return envelope_error_response(
                None,
                JsonRpcError::new(error_codes::INVALID_REQUEST, format!("invalid request: {err}")),
            );
        }
        Some(Err(err)) => {
            let status = Status::from(err);
            return envelope_error_response(None, JsonRpcError::from_status(&status));
        }
        None => {
            return envelope_error_response(
                None,
                JsonRpcError::new(error_codes::INVALID_REQUEST, "empty request"),
            );
        }
    };
    let head = envelope.head().cloned().expect("envelope head after deframe");

    match dispatch_envelope(&registry, &service, &head.method, head.id, msg).await {
        Some(response) => json_rpc_response_body(
            &serde_json::to_value(&response).expect("response serialization"),
        ),
        // Notification: zero response bytes.
        None => Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .expect("response build failed"),
    }
}

async fn serve_envelope_batch(
    registry: &Arc<Registry>,
    service: &str,
    raw: &[u8],
) -> Response<Body> {
    let entries = match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Array(entries)) => entries,
        _ => {
            return envelope_error_response(
                None,
                JsonRpcError::new(error_codes::PARSE_ERROR, "malformed batch"),
            );
        }
    };
    if entries.is_empty() {
        return envelope_error_response(
            None,
            JsonRpcError::new(error_codes::INVALID_REQUEST, "empty batch"),
        );
    }

    let mut responses = Vec::new();
    for entry in entries {
        match JsonRpcRequest::from_value(entry) {
            Ok(request) => {
                let msg = envelope_wire_message(request.params);
                if let Some(response) =
                    dispatch_envelope(registry, service, &request.method, request.id, msg).await
                {
                    responses.push(response);
                }
            }
            // A malformed entry yields an error entry at its position
            // without failing the whole batch.
            Err(err) => responses.push(JsonRpcResponse::error(
                None,
                JsonRpcError::new(error_codes::INVALID_REQUEST, err.to_string()),
            )),
        }
    }

    if responses.is_empty() {
        // All notifications: no response body at all.
        return Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .expect("response build failed");
    }
    json_rpc_response_body(&serde_json::to_value(&responses).expect("response serialization"))
}

/// Dispatch one envelope request. `None` means no response is owed (the
/// request was a notification).
async fn dispatch_envelope(
    registry: &Arc<Registry>,
    service: &str,
    method_name: &str,
    id: Option<Value>,
    msg: WireMessage,
) -> Option<JsonRpcResponse> {
    if method_name == CANCEL_METHOD {
        return handle_cancel(registry, id, &msg);
    }

    let respond = id.is_some();
    let path = format!("/{service}/{method_name}");

    let Some(method) = registry.methods.get(&path).cloned() else {
        return respond.then(|| {
            JsonRpcResponse::error(
                id,
                JsonRpcError::new(error_codes::METHOD_NOT_FOUND, "Method not found"),
            )
        });
    };
    if method.cardinality() != Cardinality::Unary {
        return respond.then(|| {
            JsonRpcResponse::error(
                id,
                JsonRpcError::new(
                    error_codes::METHOD_NOT_FOUND,
                    "method is not reachable over the envelope surface",
                ),
            )
        });
    }
    if !method.accepts(msg.format()) {
        return respond.then(|| {
            JsonRpcResponse::error(
                id,
                JsonRpcError::new(error_codes::INVALID_PARAMS, "unsupported params shape"),
            )
        });
    }

    let shared = CallShared::new(deadline_for(&registry.config, None));

    // Track the call by correlation id so rpc.cancel can reach it.
    let key = id.as_ref().map(|id| id.to_string());
    if let Some(key) = &key {
        registry
            .active
            .lock()
            .unwrap()
            .insert(key.clone(), shared.clone());
    }

    let (status, mut messages) = invoke_collect(
        registry,
        &method,
        &shared,
        single_message_channel(msg),
        WireFormat::Json,
    )
    .await;

    if let Some(key) = &key {
        registry.active.lock().unwrap().remove(key);
    }

    if !respond {
        return None;
    }
    let id = id.expect("respond implies id");

    if status.code() == Code::Ok {
        let result = messages
            .pop()
            .map(|msg| serde_json::from_slice(msg.payload()).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        Some(JsonRpcResponse::result(id, result))
    } else {
        Some(JsonRpcResponse::error(
            Some(id),
            JsonRpcError::from_status(&status),
        ))
    }
}

/// Cancel the in-flight call named by `{"id": ...}` in the params.
/// Unknown ids are ignored: the call may have already ended.
fn handle_cancel(
    registry: &Arc<Registry>,
    id: Option<Value>,
    msg: &WireMessage,
) -> Option<JsonRpcResponse> {
    let params: Value = serde_json::from_slice(msg.payload()).unwrap_or(Value::Null);
    let target = params.get("id").cloned().filter(|v| !v.is_null());

    if let Some(target) = target {
        let key = target.to_string();
        let call = registry.active.lock().unwrap().get(&key).cloned();
        match call {
            Some(call) => call.cancel(Status::cancelled("cancelled by caller")),
            None => {
                tracing::debug!(target: "omnirpc", %key, "cancel for unknown call id");
            }
        }
    }

    id.map(|id| JsonRpcResponse::result(id, Value::Null))
}

/// Build the wire message carrying an envelope's params.
fn envelope_wire_message(params: Option<Value>) -> WireMessage {
    match params {
        Some(params @ Value::Array(_)) => WireMessage::new(
            WireFormat::JsonArray,
            Bytes::from(serde_json::to_vec(&params).expect("json value serialization")),
        ),
        Some(params) => WireMessage::new(
            WireFormat::Json,
            Bytes::from(serde_json::to_vec(&params).expect("json value serialization")),
        ),
        None => WireMessage::new(WireFormat::Json, Bytes::from_static(b"{}")),
    }
}

fn envelope_error_response(id: Option<Value>, error: JsonRpcError) -> Response<Body> {
    let response = JsonRpcResponse::error(id, error);
    json_rpc_response_body(&serde_json::to_value(&response).expect("response serialization"))
}

/// Envelope failures ride inside the envelope: the HTTP status is always
/// 200, the `error` object carries the failure.
fn json_rpc_response_body(value: &Value) -> Response<Body> {
    let body = serde_json::to_vec(value).expect("json value serialization");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json-rpc")
        .body(Body::from(body))
        .expect("response build failed")
}

// ============================================================================
// In-process invocation
// ============================================================================

async fn invoke_json(
    registry: &Arc<Registry>,
    service: &str,
    method_name: &str,
    params: Value,
) -> Result<Value, Status> {
    let path = format!("/{service}/{method_name}");
    let Some(method) = registry.methods.get(&path).cloned() else {
        return Err(Status::not_found(format!("unknown method: {path}")));
    };
    if method.cardinality() != Cardinality::Unary {
        return Err(Status::unimplemented(
            "in-process invocation supports unary methods only",
        ));
    }

    let msg = envelope_wire_message(if params.is_null() { None } else { Some(params) });
    if !method.accepts(msg.format()) {
        return Err(Status::invalid_argument("unsupported params shape"));
    }

    let shared = CallShared::new(deadline_for(&registry.config, None));
    let (status, mut messages) = invoke_collect(
        registry,
        &method,
        &shared,
        single_message_channel(msg),
        WireFormat::Json,
    )
    .await;

    if status.code() != Code::Ok {
        return Err(status);
    }
    Ok(messages
        .pop()
        .map(|msg| serde_json::from_slice(msg.payload()).unwrap_or(Value::Null))
        .unwrap_or(Value::Null))
}
