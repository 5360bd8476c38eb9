//! Per-message compression.
//!
//! Frames carrying the compressed flag are decompressed with the encoding
//! negotiated for the request. Only `identity` and `gzip` exist on the wire;
//! `identity` is represented as the absence of a codec.

use std::io;
use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression as GzipLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::message::ContentEncoding;

/// Compress data with the given encoding. `Identity` is a passthrough.
pub fn compress(data: Bytes, encoding: ContentEncoding) -> io::Result<Bytes> {
    match encoding {
        ContentEncoding::Identity => Ok(data),
        ContentEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), GzipLevel::default());
            encoder.write_all(&data)?;
            Ok(Bytes::from(encoder.finish()?))
        }
    }
}

/// Decompress data with the given encoding. `Identity` is a passthrough.
pub fn decompress(data: Bytes, encoding: ContentEncoding) -> io::Result<Bytes> {
    match encoding {
        ContentEncoding::Identity => Ok(data),
        ContentEncoding::Gzip => {
            let mut decoder = GzDecoder::new(data.as_ref());
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            Ok(Bytes::from(decompressed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_round_trip() {
        let original = Bytes::from_static(b"Hello, World! This is a test message.");
        let compressed = compress(original.clone(), ContentEncoding::Gzip).unwrap();
        assert_ne!(compressed, original);

        let decompressed = decompress(compressed, ContentEncoding::Gzip).unwrap();
        assert_eq!(decompressed, original);
    }

    #[test]
    fn test_identity_passthrough() {
        let original = Bytes::from_static(b"Hello, World!");
        let compressed = compress(original.clone(), ContentEncoding::Identity).unwrap();
        assert_eq!(compressed, original);

        let decompressed = decompress(compressed, ContentEncoding::Identity).unwrap();
        assert_eq!(decompressed, original);
    }

    #[test]
    fn test_decompress_invalid_gzip() {
        let invalid = Bytes::from_static(b"not valid gzip data");
        assert!(decompress(invalid, ContentEncoding::Gzip).is_err());
    }
}
