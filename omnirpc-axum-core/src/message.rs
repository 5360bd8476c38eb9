//! Wire-level message values.
//!
//! A [`WireMessage`] is one undecoded application message as it appears on
//! the wire: a format tag, a content encoding, and the payload bytes. Every
//! frame codec produces them and every message codec consumes them.

use bytes::Bytes;

/// On-the-wire encoding of one message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Canonical binary (protobuf) serialization.
    Binary,
    /// Structured JSON object equivalent to the message's field set.
    Json,
    /// Bare JSON array mapped positionally onto the message's fields.
    JsonArray,
    /// Opaque payload handed to the handler as-is.
    Raw,
}

/// Content encoding applied to a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
}

impl ContentEncoding {
    /// The encoding name used in HTTP headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
        }
    }

    /// Parse an encoding name from a header value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "" | "identity" => Some(ContentEncoding::Identity),
            "gzip" => Some(ContentEncoding::Gzip),
            _ => None,
        }
    }
}

/// One undecoded application message.
///
/// Value type: produced fresh per message and never mutated after
/// construction. The payload is reference-counted, so cloning is cheap.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    format: WireFormat,
    encoding: ContentEncoding,
    payload: Bytes,
}

impl WireMessage {
    /// Create a message with identity encoding.
    pub fn new(format: WireFormat, payload: Bytes) -> Self {
        Self {
            format,
            encoding: ContentEncoding::Identity,
            payload,
        }
    }

    /// Create a message with an explicit content encoding.
    pub fn with_encoding(format: WireFormat, encoding: ContentEncoding, payload: Bytes) -> Self {
        Self {
            format,
            encoding,
            payload,
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn encoding(&self) -> ContentEncoding {
        self.encoding
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the message, returning the payload bytes.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
