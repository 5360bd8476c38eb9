//! Message codecs: per-type, per-format pluggable serializers.
//!
//! A [`MessageDecoder`] declares which wire formats it accepts via
//! [`accepts`](MessageDecoder::accepts), letting a registry pick a decoder
//! without attempting a decode. Decoders and encoders are built through
//! factory constructors and hold boxed codec functions, so descriptors can
//! store them without generic plumbing at every call site.

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::message::{WireFormat, WireMessage};

/// Decode/encode failure for one message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The decoder does not understand the message's declared format.
    #[error("unsupported wire format: {0:?}")]
    UnsupportedFormat(WireFormat),

    /// The payload is malformed for its declared format.
    #[error("malformed {format:?} payload: {reason}")]
    Malformed { format: WireFormat, reason: String },

    /// A positional JSON array does not line up with the message's fields.
    #[error("json array has {actual} elements but the message declares {expected} fields")]
    ArityMismatch { expected: usize, actual: usize },

    /// Serialization failed. This is a bug in the message type, not bad
    /// caller input.
    #[error("message encoding failed: {0}")]
    Encode(String),
}

impl CodecError {
    fn malformed(format: WireFormat, err: impl std::fmt::Display) -> Self {
        CodecError::Malformed {
            format,
            reason: err.to_string(),
        }
    }
}

impl From<CodecError> for crate::status::Status {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(_) => crate::status::Status::internal(err.to_string()),
            _ => crate::status::Status::invalid_argument(err.to_string()),
        }
    }
}

/// Declaration-order field names for a message type.
///
/// Stands in for descriptor reflection: positional JSON arrays are merged
/// into a message by index-matching array elements to these names. Generated
/// code (or the registering service) provides the impl.
pub trait FieldNames {
    const FIELD_NAMES: &'static [&'static str];
}

type DecodeFn<T> = Arc<dyn Fn(&WireMessage) -> Result<T, CodecError> + Send + Sync>;
type EncodeFn<T> = Arc<dyn Fn(&T, WireFormat) -> Result<Bytes, CodecError> + Send + Sync>;

/// Decodes [`WireMessage`]s into values of `T`.
pub struct MessageDecoder<T> {
    accepts: fn(WireFormat) -> bool,
    decode: DecodeFn<T>,
}

impl<T> Clone for MessageDecoder<T> {
    fn clone(&self) -> Self {
        Self {
            accepts: self.accepts,
            decode: self.decode.clone(),
        }
    }
}

impl<T> MessageDecoder<T> {
    /// Whether this decoder understands the given wire format.
    pub fn accepts(&self, format: WireFormat) -> bool {
        (self.accepts)(format)
    }

    /// Decode one message.
    pub fn decode(&self, msg: &WireMessage) -> Result<T, CodecError> {
        (self.decode)(msg)
    }

    /// Full decoder for a message type: binary via protobuf, structured
    /// JSON via serde, and positional JSON arrays via [`FieldNames`].
    pub fn decoder() -> Self
    where
        T: Message + Default + DeserializeOwned + FieldNames,
    {
        Self {
            accepts: |format| !matches!(format, WireFormat::Raw),
            decode: Arc::new(|msg| match msg.format() {
                WireFormat::Binary => T::decode(msg.payload().as_ref())
                    .map_err(|e| CodecError::malformed(WireFormat::Binary, e)),
                WireFormat::Json => serde_json::from_slice(msg.payload())
                    .map_err(|e| CodecError::malformed(WireFormat::Json, e)),
                WireFormat::JsonArray => decode_positional::<T>(msg.payload()),
                WireFormat::Raw => Err(CodecError::UnsupportedFormat(WireFormat::Raw)),
            }),
        }
    }

    /// JSON-only decoder for plain serde types.
    pub fn json() -> Self
    where
        T: DeserializeOwned,
    {
        Self {
            accepts: |format| format == WireFormat::Json,
            decode: Arc::new(|msg| {
                if msg.format() != WireFormat::Json {
                    return Err(CodecError::UnsupportedFormat(msg.format()));
                }
                serde_json::from_slice(msg.payload())
                    .map_err(|e| CodecError::malformed(WireFormat::Json, e))
            }),
        }
    }
}

impl MessageDecoder<Bytes> {
    /// Passthrough decoder for opaque-payload handlers.
    pub fn identity() -> Self {
        Self {
            accepts: |_| true,
            decode: Arc::new(|msg| Ok(msg.payload().clone())),
        }
    }
}

/// Merge a bare JSON array into a message by index-matching array positions
/// to the message's declared fields in declaration order.
fn decode_positional<T>(payload: &[u8]) -> Result<T, CodecError>
where
    T: DeserializeOwned + FieldNames,
{
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| CodecError::malformed(WireFormat::JsonArray, e))?;
    let serde_json::Value::Array(items) = value else {
        return Err(CodecError::Malformed {
            format: WireFormat::JsonArray,
            reason: "expected a json array".to_string(),
        });
    };

    if items.len() != T::FIELD_NAMES.len() {
        return Err(CodecError::ArityMismatch {
            expected: T::FIELD_NAMES.len(),
            actual: items.len(),
        });
    }

    let mut object = serde_json::Map::with_capacity(items.len());
    for (name, item) in T::FIELD_NAMES.iter().zip(items) {
        object.insert((*name).to_string(), item);
    }

    serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|e| CodecError::malformed(WireFormat::JsonArray, e))
}

/// Encodes values of `T` into payload bytes for a requested wire format.
pub struct MessageEncoder<T> {
    encode: EncodeFn<T>,
}

impl<T> Clone for MessageEncoder<T> {
    fn clone(&self) -> Self {
        Self {
            encode: self.encode.clone(),
        }
    }
}

impl<T> MessageEncoder<T> {
    /// Encode one message in the given format.
    pub fn encode(&self, value: &T, format: WireFormat) -> Result<Bytes, CodecError> {
        (self.encode)(value, format)
    }

    /// Full encoder for a message type: binary via protobuf, JSON via serde.
    ///
    /// Positional-array callers receive structured JSON back; only requests
    /// use the positional form.
    pub fn encoder() -> Self
    where
        T: Message + Serialize,
    {
        Self {
            encode: Arc::new(|value, format| match format {
                WireFormat::Binary => Ok(Bytes::from(value.encode_to_vec())),
                WireFormat::Json | WireFormat::JsonArray => serde_json::to_vec(value)
                    .map(Bytes::from)
                    .map_err(|e| CodecError::Encode(e.to_string())),
                WireFormat::Raw => Err(CodecError::UnsupportedFormat(WireFormat::Raw)),
            }),
        }
    }
}

impl MessageEncoder<Bytes> {
    /// Passthrough encoder for opaque-payload handlers.
    pub fn identity() -> Self {
        Self {
            encode: Arc::new(|value, _| Ok(value.clone())),
        }
    }
}
