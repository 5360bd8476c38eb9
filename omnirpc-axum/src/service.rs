//! Service registration: names, method descriptors, and handler tables.
//!
//! Services bind once at startup; everything a [`ServiceBuilder`] produces
//! is immutable from then on. Handlers receive a call-shaped abstraction
//! ([`CallContext`], [`Inbound`], [`Outbound`]) and are never told which
//! wire protocol carried the request.

use std::sync::Arc;

use futures::future::BoxFuture;
use omnirpc_axum_core::{
    FieldNames, MessageDecoder, MessageEncoder, Status, WireFormat, WireMessage,
};
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::call::{CallContext, Inbound, Outbound, ResponseSink};

/// Namespaced service identity.
///
/// Derives the canonical method path `/{package.Name}/{method}` used by the
/// binary and text protocols. Created once at registration and immutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName {
    package: String,
    name: String,
}

impl ServiceName {
    pub fn new<P: Into<String>, N: Into<String>>(package: P, name: N) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fully qualified name, e.g. `library.v1.Shelves`.
    pub fn full_name(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.package, self.name)
        }
    }

    /// The canonical RPC path for one method, e.g. `/library.v1.Shelves/Get`.
    pub fn method_path(&self, method: &str) -> String {
        format!("/{}/{}", self.full_name(), method)
    }
}

/// Request/response cardinality of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl Cardinality {
    /// Whether the method takes a single request message.
    pub fn single_request(&self) -> bool {
        matches!(self, Cardinality::Unary | Cardinality::ServerStreaming)
    }

    /// Whether the method produces a single response message.
    pub fn single_response(&self) -> bool {
        matches!(self, Cardinality::Unary | Cardinality::ClientStreaming)
    }
}

/// Declarative HTTP binding for the transcoding surface.
///
/// Mirrors the shape of `google.api.http` annotations: an HTTP verb, a path
/// template, optional body and response-body field selectors, and
/// additional alias bindings.
#[derive(Debug, Clone)]
pub struct HttpBinding {
    pub verb: http::Method,
    pub path: String,
    pub body: Option<String>,
    pub response_body: Option<String>,
    pub additional_bindings: Vec<HttpBinding>,
}

impl HttpBinding {
    pub fn new<P: Into<String>>(verb: http::Method, path: P) -> Self {
        Self {
            verb,
            path: path.into(),
            body: None,
            response_body: None,
            additional_bindings: Vec::new(),
        }
    }

    pub fn get<P: Into<String>>(path: P) -> Self {
        Self::new(http::Method::GET, path)
    }

    pub fn post<P: Into<String>>(path: P) -> Self {
        Self::new(http::Method::POST, path)
    }

    pub fn put<P: Into<String>>(path: P) -> Self {
        Self::new(http::Method::PUT, path)
    }

    pub fn delete<P: Into<String>>(path: P) -> Self {
        Self::new(http::Method::DELETE, path)
    }

    pub fn patch<P: Into<String>>(path: P) -> Self {
        Self::new(http::Method::PATCH, path)
    }

    /// Field selector for the request body; `*` maps the whole body onto
    /// the request message.
    pub fn body<S: Into<String>>(mut self, selector: S) -> Self {
        self.body = Some(selector.into());
        self
    }

    /// Field selector projecting the response message onto the HTTP body.
    pub fn response_body<S: Into<String>>(mut self, selector: S) -> Self {
        self.response_body = Some(selector.into());
        self
    }

    /// Add an alias binding for the same method.
    pub fn additional(mut self, binding: HttpBinding) -> Self {
        self.additional_bindings.push(binding);
        self
    }
}

// ============================================================================
// Handler plumbing
// ============================================================================

enum Handler<I, O> {
    Unary(Arc<dyn Fn(CallContext, I) -> BoxFuture<'static, Result<O, Status>> + Send + Sync>),
    ServerStreaming(
        Arc<
            dyn Fn(CallContext, I, Outbound<O>) -> BoxFuture<'static, Result<(), Status>>
                + Send
                + Sync,
        >,
    ),
    ClientStreaming(
        Arc<dyn Fn(CallContext, Inbound<I>) -> BoxFuture<'static, Result<O, Status>> + Send + Sync>,
    ),
    BidiStreaming(
        Arc<
            dyn Fn(CallContext, Inbound<I>, Outbound<O>) -> BoxFuture<'static, Result<(), Status>>
                + Send
                + Sync,
        >,
    ),
}

impl<I, O> Clone for Handler<I, O> {
    fn clone(&self) -> Self {
        match self {
            Handler::Unary(f) => Handler::Unary(f.clone()),
            Handler::ServerStreaming(f) => Handler::ServerStreaming(f.clone()),
            Handler::ClientStreaming(f) => Handler::ClientStreaming(f.clone()),
            Handler::BidiStreaming(f) => Handler::BidiStreaming(f.clone()),
        }
    }
}

/// Read exactly one request message; a second one is a protocol error.
async fn recv_single<I>(inbound: &mut Inbound<I>) -> Result<I, Status> {
    let first = match inbound.next().await {
        Some(Ok(msg)) => msg,
        Some(Err(status)) => return Err(status),
        None => return Err(Status::invalid_argument("missing request message")),
    };
    match inbound.next().await {
        None => Ok(first),
        Some(Err(status)) => Err(status),
        Some(Ok(_)) => Err(Status::invalid_argument(
            "received more than one request message for a single-request method",
        )),
    }
}

/// Type-erased method binding: the dispatcher drives calls through this
/// without knowing the request/response types.
pub(crate) trait ErasedMethod: Send + Sync {
    fn service_name(&self) -> &ServiceName;
    fn method_name(&self) -> &str;
    /// Canonical method path, `/{package.Service}/{Method}`.
    fn method_path(&self) -> &str;
    fn cardinality(&self) -> Cardinality;
    fn http_binding(&self) -> Option<&HttpBinding>;
    /// Whether the method's decoder understands the given wire format.
    fn accepts(&self, format: WireFormat) -> bool;

    /// Decode the inbound stream, run the handler, and encode its output
    /// into the sink. The returned status is the handler's result; the
    /// caller owns the final state transition.
    fn invoke(
        &self,
        ctx: CallContext,
        inbound: mpsc::Receiver<Result<WireMessage, Status>>,
        sink: ResponseSink,
        response_format: WireFormat,
    ) -> BoxFuture<'static, Result<(), Status>>;
}

struct MethodBinding<I, O> {
    service_name: ServiceName,
    method_name: String,
    method_path: String,
    cardinality: Cardinality,
    decoder: MessageDecoder<I>,
    encoder: MessageEncoder<O>,
    http: Option<HttpBinding>,
    handler: Handler<I, O>,
}

impl<I, O> ErasedMethod for MethodBinding<I, O>
where
    I: Send + 'static,
    O: Send + Sync + 'static,
{
    fn service_name(&self) -> &ServiceName {
        &self.service_name
    }

    fn method_name(&self) -> &str {
        &self.method_name
    }

    fn method_path(&self) -> &str {
        &self.method_path
    }

    fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    fn http_binding(&self) -> Option<&HttpBinding> {
        self.http.as_ref()
    }

    fn accepts(&self, format: WireFormat) -> bool {
        self.decoder.accepts(format)
    }

    fn invoke(
        &self,
        ctx: CallContext,
        inbound: mpsc::Receiver<Result<WireMessage, Status>>,
        sink: ResponseSink,
        response_format: WireFormat,
    ) -> BoxFuture<'static, Result<(), Status>> {
        let decoder = self.decoder.clone();
        let encoder = self.encoder.clone();
        let handler = self.handler.clone();

        Box::pin(async move {
            let mut inbound = Inbound::new(inbound, decoder);
            let mut outbound = Outbound::new(sink, encoder, response_format);

            match handler {
                Handler::Unary(f) => {
                    let request = recv_single(&mut inbound).await?;
                    let response = f(ctx, request).await?;
                    outbound.send(&response).await
                }
                Handler::ServerStreaming(f) => {
                    let request = recv_single(&mut inbound).await?;
                    f(ctx, request, outbound).await
                }
                Handler::ClientStreaming(f) => {
                    let response = f(ctx, inbound).await?;
                    outbound.send(&response).await
                }
                Handler::BidiStreaming(f) => f(ctx, inbound, outbound).await,
            }
        })
    }
}

// ============================================================================
// Service builder
// ============================================================================

/// One registered service: an immutable bundle of method bindings.
pub struct Service {
    name: ServiceName,
    methods: Vec<Arc<dyn ErasedMethod>>,
}

impl Service {
    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub(crate) fn methods(&self) -> &[Arc<dyn ErasedMethod>] {
        &self.methods
    }
}

/// Builder registering method handlers for one service.
///
/// # Example
///
/// ```ignore
/// let service = ServiceBuilder::new(ServiceName::new("library.v1", "Shelves"))
///     .unary("GetShelf", HttpBinding::get("/v1/shelves/{shelf}"), get_shelf)
///     .unary("CreateShelf", HttpBinding::post("/v1/shelves").body("*"), create_shelf)
///     .build();
/// ```
pub struct ServiceBuilder {
    name: ServiceName,
    methods: Vec<Arc<dyn ErasedMethod>>,
}

impl ServiceBuilder {
    pub fn new(name: ServiceName) -> Self {
        Self {
            name,
            methods: Vec::new(),
        }
    }

    fn push<I, O>(
        mut self,
        method: &str,
        cardinality: Cardinality,
        http: Option<HttpBinding>,
        handler: Handler<I, O>,
    ) -> Self
    where
        I: Message + Default + DeserializeOwned + FieldNames + Send + 'static,
        O: Message + Serialize + Send + 'static,
    {
        let binding = MethodBinding {
            service_name: self.name.clone(),
            method_name: method.to_string(),
            method_path: self.name.method_path(method),
            cardinality,
            decoder: MessageDecoder::decoder(),
            encoder: MessageEncoder::encoder(),
            http,
            handler,
        };
        self.methods.push(Arc::new(binding));
        self
    }

    /// Register a unary method.
    pub fn unary<I, O, F, Fut>(
        self,
        method: &str,
        http: impl Into<Option<HttpBinding>>,
        handler: F,
    ) -> Self
    where
        I: Message + Default + DeserializeOwned + FieldNames + Send + 'static,
        O: Message + Serialize + Send + 'static,
        F: Fn(CallContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Status>> + Send + 'static,
    {
        let f = Arc::new(move |ctx, req| {
            Box::pin(handler(ctx, req)) as BoxFuture<'static, Result<O, Status>>
        });
        self.push(
            method,
            Cardinality::Unary,
            http.into(),
            Handler::Unary(f),
        )
    }

    /// Register a server-streaming method.
    pub fn server_streaming<I, O, F, Fut>(
        self,
        method: &str,
        http: impl Into<Option<HttpBinding>>,
        handler: F,
    ) -> Self
    where
        I: Message + Default + DeserializeOwned + FieldNames + Send + 'static,
        O: Message + Serialize + Send + 'static,
        F: Fn(CallContext, I, Outbound<O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = Arc::new(move |ctx, req, out| {
            Box::pin(handler(ctx, req, out)) as BoxFuture<'static, Result<(), Status>>
        });
        self.push(
            method,
            Cardinality::ServerStreaming,
            http.into(),
            Handler::ServerStreaming(f),
        )
    }

    /// Register a client-streaming method.
    pub fn client_streaming<I, O, F, Fut>(
        self,
        method: &str,
        http: impl Into<Option<HttpBinding>>,
        handler: F,
    ) -> Self
    where
        I: Message + Default + DeserializeOwned + FieldNames + Send + 'static,
        O: Message + Serialize + Send + 'static,
        F: Fn(CallContext, Inbound<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Status>> + Send + 'static,
    {
        let f = Arc::new(move |ctx, inbound| {
            Box::pin(handler(ctx, inbound)) as BoxFuture<'static, Result<O, Status>>
        });
        self.push(
            method,
            Cardinality::ClientStreaming,
            http.into(),
            Handler::ClientStreaming(f),
        )
    }

    /// Register a bidirectional-streaming method.
    pub fn bidi_streaming<I, O, F, Fut>(
        self,
        method: &str,
        http: impl Into<Option<HttpBinding>>,
        handler: F,
    ) -> Self
    where
        I: Message + Default + DeserializeOwned + FieldNames + Send + 'static,
        O: Message + Serialize + Send + 'static,
        F: Fn(CallContext, Inbound<I>, Outbound<O>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = Arc::new(move |ctx, inbound, out| {
            Box::pin(handler(ctx, inbound, out)) as BoxFuture<'static, Result<(), Status>>
        });
        self.push(
            method,
            Cardinality::BidiStreaming,
            http.into(),
            Handler::BidiStreaming(f),
        )
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}
