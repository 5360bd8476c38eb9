//! JSON-RPC 2.0 envelope model.
//!
//! The envelope protocol carries the method name, parameters, and a
//! correlation id in one JSON object:
//!
//! ```text
//! {"jsonrpc":"2.0","method":"Echo","params":{...},"id":1}
//! ```
//!
//! A request without an `id` is a notification and produces no response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::{Code, Status};

/// The only JSON-RPC protocol version this crate speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Server-defined errors live in `[SERVER_ERROR_MIN, SERVER_ERROR_MAX]`.
    pub const SERVER_ERROR_MIN: i64 = -32099;
    pub const SERVER_ERROR_MAX: i64 = -32000;
}

/// A structurally invalid envelope (well-formed JSON that is not a valid
/// JSON-RPC 2.0 request). Maps to error code −32600.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvalidEnvelope {
    #[error("jsonrpc must be \"2.0\"")]
    Version,
    #[error("method is required")]
    MissingMethod,
    #[error("params must be an object or array")]
    BadParams,
    #[error("request must be a json object")]
    NotAnObject,
}

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request with a correlation id.
    pub fn new<M: Into<String>>(method: M, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    /// Create a notification (no id, no response expected).
    pub fn notification<M: Into<String>>(method: M, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Validate a decoded JSON value as a JSON-RPC request.
    pub fn from_value(value: Value) -> Result<Self, InvalidEnvelope> {
        let Value::Object(mut obj) = value else {
            return Err(InvalidEnvelope::NotAnObject);
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            _ => return Err(InvalidEnvelope::Version),
        }

        let method = match obj.remove("method") {
            Some(Value::String(m)) => m,
            _ => return Err(InvalidEnvelope::MissingMethod),
        };

        let params = match obj.remove("params") {
            None => None,
            Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p),
            Some(_) => return Err(InvalidEnvelope::BadParams),
        };

        // An explicit null id is treated as absent: the caller cannot be
        // answered with a meaningful correlation either way.
        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(id) => Some(id),
        };

        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method,
            params,
            id,
        })
    }

    /// Whether this request is a notification (no id).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// The out-of-band head of an envelope: the method name and correlation id
/// the deframer extracts so the response can echo the id.
#[derive(Debug, Clone)]
pub struct EnvelopeHead {
    pub method: String,
    pub id: Option<Value>,
}

impl EnvelopeHead {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new<M: Into<String>>(code: i64, message: M) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Render a neutral status as an envelope error object.
    pub fn from_status(status: &Status) -> Self {
        let code = match status.code() {
            Code::NotFound | Code::Unimplemented => error_codes::METHOD_NOT_FOUND,
            Code::InvalidArgument | Code::OutOfRange => error_codes::INVALID_PARAMS,
            Code::Internal | Code::Unknown | Code::DataLoss => error_codes::INTERNAL_ERROR,
            _ => error_codes::SERVER_ERROR_MAX,
        };
        let message = status
            .message()
            .map(str::to_string)
            .unwrap_or_else(|| status.code().as_str().to_string());
        Self {
            code,
            message,
            data: None,
        }
    }
}

/// A JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    /// A successful response echoing the request id.
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// An error response. `id` is `null` when the request id is unknown.
    pub fn error(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id: id.unwrap_or(Value::Null),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
