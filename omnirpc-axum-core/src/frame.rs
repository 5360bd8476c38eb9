//! Incremental frame codecs.
//!
//! A [`Deframer`] turns a raw byte stream into discrete [`WireMessage`]s
//! under one protocol's framing rules. Deframers are stateful and
//! single-use per call direction: feed chunks with `update`, signal
//! end-of-stream with `end`, and drain messages with `next`.
//!
//! Binary framing is `[flags:1][length:4 BE][payload]`; the text variant
//! base64-wraps the whole frame sequence; the one-shot variants treat the
//! entire body as a single message.

use bytes::{Bytes, BytesMut};

use crate::compression;
use crate::envelope::{EnvelopeHead, JsonRpcRequest};
use crate::message::{ContentEncoding, WireFormat, WireMessage};

/// Frame header size: flags byte plus the 4-byte big-endian length.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame flag bits.
pub mod frame_flags {
    /// Regular uncompressed message.
    pub const MESSAGE: u8 = 0x00;
    /// Payload is compressed with the negotiated content encoding.
    pub const COMPRESSED: u8 = 0x01;
    /// Trailer frame (web variant responses only).
    pub const TRAILER: u8 = 0x80;
}

/// A framing violation. Fails the call; a message is never partially
/// delivered.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("message size {size} exceeds maximum allowed size of {max} bytes")]
    MessageTooLarge { size: u64, max: u64 },

    #[error("invalid frame flags: 0x{0:02x}")]
    InvalidFlags(u8),

    #[error("truncated frame: {0} trailing bytes")]
    Truncated(usize),

    #[error("malformed base64 body: {0}")]
    Base64(String),

    #[error("malformed envelope json: {0}")]
    EnvelopeParse(String),

    #[error("invalid envelope: {0}")]
    EnvelopeInvalid(String),

    #[error("decompression failed: {0}")]
    Decompress(String),
}

impl From<FrameError> for crate::status::Status {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::MessageTooLarge { .. } => {
                crate::status::Status::resource_exhausted(err.to_string())
            }
            _ => crate::status::Status::invalid_argument(err.to_string()),
        }
    }
}

/// Incremental deframer: byte stream in, framed messages out.
pub trait Deframer: Send {
    /// Append a chunk of transport bytes.
    fn update(&mut self, chunk: Bytes);

    /// Signal that no more bytes will arrive.
    fn end(&mut self);

    /// Pop the next fully framed message, or `None` if more bytes are
    /// needed. After an `Err` the deframer is poisoned and yields nothing.
    fn next(&mut self) -> Option<Result<WireMessage, FrameError>>;
}

/// Wrap a payload in a `[flags][length][payload]` frame.
pub fn frame_message(payload: &[u8], flags: u8) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&[flags]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.freeze()
}

// ============================================================================
// Length-prefixed binary framing
// ============================================================================

/// Deframer for length-prefixed binary framing.
///
/// Enforces the configured maximum message size the moment a frame's
/// declared length exceeds it, before the frame body arrives.
pub struct LengthPrefixedDeframer {
    buffer: BytesMut,
    format: WireFormat,
    encoding: ContentEncoding,
    max_message_size: usize,
    ended: bool,
    failed: bool,
}

impl LengthPrefixedDeframer {
    pub fn new(format: WireFormat, encoding: ContentEncoding, max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            format,
            encoding,
            max_message_size,
            ended: false,
            failed: false,
        }
    }

    fn fail(&mut self, err: FrameError) -> Option<Result<WireMessage, FrameError>> {
        self.failed = true;
        self.buffer.clear();
        Some(Err(err))
    }
}

impl Deframer for LengthPrefixedDeframer {
    fn update(&mut self, chunk: Bytes) {
        if self.failed {
            return;
        }
        self.buffer.extend_from_slice(&chunk);
    }

    fn end(&mut self) {
        self.ended = true;
    }

    fn next(&mut self) -> Option<Result<WireMessage, FrameError>> {
        if self.failed {
            return None;
        }

        if self.buffer.len() >= FRAME_HEADER_SIZE {
            let flags = self.buffer[0];
            let length = u32::from_be_bytes([
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
            ]) as usize;

            // Reject over-size frames before the body arrives.
            if length > self.max_message_size {
                return self.fail(FrameError::MessageTooLarge {
                    size: length as u64,
                    max: self.max_message_size as u64,
                });
            }

            let compressed = flags & frame_flags::COMPRESSED != 0;
            if flags & !frame_flags::COMPRESSED != 0 {
                return self.fail(FrameError::InvalidFlags(flags));
            }

            if self.buffer.len() >= FRAME_HEADER_SIZE + length {
                let mut frame = self.buffer.split_to(FRAME_HEADER_SIZE + length);
                let payload = frame.split_off(FRAME_HEADER_SIZE).freeze();

                let payload = if compressed {
                    match compression::decompress(payload, self.encoding) {
                        Ok(p) => p,
                        Err(e) => return self.fail(FrameError::Decompress(e.to_string())),
                    }
                } else {
                    payload
                };

                return Some(Ok(WireMessage::new(self.format, payload)));
            }
        }

        if self.ended && !self.buffer.is_empty() {
            let trailing = self.buffer.len();
            return self.fail(FrameError::Truncated(trailing));
        }

        None
    }
}

// ============================================================================
// Base64 text-wrapped framing
// ============================================================================

/// Deframer for the browser-safe text variant: the entire frame sequence is
/// base64-encoded as one unit on the wire.
///
/// Partial base64 cannot be decoded safely, so the stream is buffered until
/// `end()` before decoding and applying length-prefixed framing.
pub struct TextDeframer {
    inner: LengthPrefixedDeframer,
    buffer: BytesMut,
    /// Cap on the buffered base64 text: one max-sized frame after the 4/3
    /// expansion. Enforced while accumulating, not just after decode.
    max_encoded: usize,
    ended: bool,
    error: Option<FrameError>,
}

impl TextDeframer {
    pub fn new(format: WireFormat, encoding: ContentEncoding, max_message_size: usize) -> Self {
        let max_encoded = (max_message_size / 3 + FRAME_HEADER_SIZE + 1).saturating_mul(4);
        Self {
            inner: LengthPrefixedDeframer::new(format, encoding, max_message_size),
            buffer: BytesMut::new(),
            max_encoded,
            ended: false,
            error: None,
        }
    }
}

impl Deframer for TextDeframer {
    fn update(&mut self, chunk: Bytes) {
        if self.ended || self.error.is_some() {
            return;
        }
        self.buffer.extend_from_slice(&chunk);

        if self.buffer.len() > self.max_encoded {
            self.error = Some(FrameError::MessageTooLarge {
                size: self.buffer.len() as u64,
                max: self.max_encoded as u64,
            });
            self.buffer.clear();
        }
    }

    fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if self.error.is_some() {
            return;
        }

        match base64_decode(&self.buffer) {
            Ok(decoded) => {
                self.inner.update(Bytes::from(decoded));
                self.inner.end();
            }
            Err(e) => self.error = Some(FrameError::Base64(e.to_string())),
        }
        self.buffer.clear();
    }

    fn next(&mut self) -> Option<Result<WireMessage, FrameError>> {
        if let Some(err) = self.error.take() {
            return Some(Err(err));
        }
        if !self.ended {
            return None;
        }
        self.inner.next()
    }
}

/// Base64-encode an outbound frame sequence as one unit.
pub fn base64_encode(data: &[u8]) -> Bytes {
    use base64::Engine;
    Bytes::from(base64::engine::general_purpose::STANDARD.encode(data))
}

fn base64_decode(data: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::{
        Engine,
        alphabet,
        engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    };
    // Accept both padded and unpadded input.
    const STANDARD_INDIFFERENT: GeneralPurpose = GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    );
    STANDARD_INDIFFERENT.decode(data)
}

// ============================================================================
// Whole-body framing
// ============================================================================

/// One-shot deframer: the entire accumulated body is exactly one message,
/// yielded only after `end()`.
pub struct WholeBodyDeframer {
    buffer: BytesMut,
    format: WireFormat,
    max_message_size: usize,
    processed: bool,
    result: Option<Result<WireMessage, FrameError>>,
}

impl WholeBodyDeframer {
    pub fn new(format: WireFormat, max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            format,
            max_message_size,
            processed: false,
            result: None,
        }
    }
}

impl Deframer for WholeBodyDeframer {
    fn update(&mut self, chunk: Bytes) {
        if self.processed {
            return;
        }
        self.buffer.extend_from_slice(&chunk);

        if self.buffer.len() > self.max_message_size {
            self.result = Some(Err(FrameError::MessageTooLarge {
                size: self.buffer.len() as u64,
                max: self.max_message_size as u64,
            }));
            self.buffer.clear();
            self.processed = true;
        }
    }

    fn end(&mut self) {
        if !self.processed {
            let payload = self.buffer.split().freeze();
            self.result = Some(Ok(WireMessage::new(self.format, payload)));
            self.processed = true;
        }
    }

    fn next(&mut self) -> Option<Result<WireMessage, FrameError>> {
        self.result.take()
    }
}

// ============================================================================
// JSON-RPC envelope framing
// ============================================================================

/// One-shot deframer for JSON-RPC envelopes.
///
/// Accumulates like [`WholeBodyDeframer`], then parses the single message
/// as an envelope: the produced [`WireMessage`] carries the `params` value
/// (object → [`WireFormat::Json`], array → [`WireFormat::JsonArray`]), and
/// the envelope head (method name, correlation id) is exposed out of band
/// through [`head`](EnvelopeDeframer::head) for echoing on the response.
pub struct EnvelopeDeframer {
    inner: WholeBodyDeframer,
    head: Option<EnvelopeHead>,
}

impl EnvelopeDeframer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            inner: WholeBodyDeframer::new(WireFormat::Json, max_message_size),
            head: None,
        }
    }

    /// The envelope head, available once the envelope message has been
    /// produced by `next()`.
    pub fn head(&self) -> Option<&EnvelopeHead> {
        self.head.as_ref()
    }
}

impl Deframer for EnvelopeDeframer {
    fn update(&mut self, chunk: Bytes) {
        self.inner.update(chunk);
    }

    fn end(&mut self) {
        self.inner.end();
    }

    fn next(&mut self) -> Option<Result<WireMessage, FrameError>> {
        let msg = match self.inner.next()? {
            Ok(msg) => msg,
            Err(e) => return Some(Err(e)),
        };

        let value: serde_json::Value = match serde_json::from_slice(msg.payload()) {
            Ok(v) => v,
            Err(e) => return Some(Err(FrameError::EnvelopeParse(e.to_string()))),
        };

        let request = match JsonRpcRequest::from_value(value) {
            Ok(r) => r,
            Err(e) => return Some(Err(FrameError::EnvelopeInvalid(e.to_string()))),
        };

        self.head = Some(EnvelopeHead {
            method: request.method,
            id: request.id,
        });

        let (format, payload) = match request.params {
            Some(params @ serde_json::Value::Array(_)) => (
                WireFormat::JsonArray,
                serde_json::to_vec(&params).expect("json value reserialization"),
            ),
            Some(params) => (
                WireFormat::Json,
                serde_json::to_vec(&params).expect("json value reserialization"),
            ),
            None => (WireFormat::Json, b"{}".to_vec()),
        };

        Some(Ok(WireMessage::new(format, Bytes::from(payload))))
    }
}
