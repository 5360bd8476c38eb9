//! # omnirpc-axum
//!
//! A multi-protocol RPC gateway for [Axum](https://github.com/tokio-rs/axum):
//! one set of service implementations reachable simultaneously over
//! gRPC-compatible binary framing, its base64 web-text variant, REST/JSON
//! transcoding driven by declarative HTTP bindings, and JSON-RPC 2.0
//! envelopes.
//!
//! ## Features
//!
//! - **One registry, four protocols:** register a handler once; the gateway
//!   negotiates the wire protocol per request and re-serializes the result
//!   into whichever encoding the caller used.
//! - **Declarative REST bindings:** `google.api.http`-style path templates
//!   (`/v1/shelves/{shelf}/books/{book}`) map REST requests onto RPC
//!   methods, with typed variable extraction from path and query.
//! - **Protocol-neutral handlers:** handlers see a call-shaped abstraction
//!   (inbound stream, response sink, deadline, cancellation) and are never
//!   told which wire protocol is in use.
//! - **Startup-checked routes:** ambiguous or malformed path bindings fail
//!   [`GatewayBuilder::build`](gateway::GatewayBuilder::build) instead of
//!   being resolved by a runtime heuristic.
//!
//! ## Getting Started
//!
//! ```ignore
//! use omnirpc_axum::prelude::*;
//!
//! let echo = ServiceBuilder::new(ServiceName::new("example.v1", "Echo"))
//!     .unary("Say", HttpBinding::post("/v1/echo:say").body("*"), say)
//!     .build();
//!
//! let gateway = GatewayBuilder::new().register(echo).build()?;
//! let app = axum::Router::new().fallback_service(gateway);
//! ```

pub mod adapter;
pub mod call;
pub mod config;
pub mod gateway;
pub mod service;
pub mod transcoding;

// Re-export several crates
pub use futures;
pub use omnirpc_axum_core as core;
pub use prost;
pub use serde;

pub mod prelude {
    //! A prelude providing the most common types.
    pub use crate::call::{CallContext, Inbound, Outbound, TrySendError};
    pub use crate::config::{GatewayConfig, MessageLimits};
    pub use crate::gateway::{BuildError, GatewayBuilder, RpcGateway};
    pub use crate::service::{
        Cardinality, HttpBinding, Service, ServiceBuilder, ServiceName,
    };
    pub use omnirpc_axum_core::{Code, FieldNames, Status};
}
