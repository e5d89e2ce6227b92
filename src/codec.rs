//! Compression and transport encoding.
//!
//! Pure wrapper functions standing in for `client/compress.c`'s
//! `yodi_compress`/`yodi_decompress` (originally miniz's `mz_compress2`/
//! `mz_uncompress`) and `client/base64.c`'s `yodi_base64_encode`/`_decode`
//! (originally mbedTLS). Shell output is always deflated then base64
//! encoded before being queued as a result, so the two live together.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::write::ZlibEncoder;
use flate2::read::ZlibDecoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("inflate failed: {0}")]
    Inflate(#[from] std::io::Error),
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("empty input is not valid base64")]
    EmptyBase64,
}

/// Compress `bytes` at the fastest level. Never fails — writing into an
/// in-memory buffer has no I/O to fail on.
pub fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::fast());
    enc.write_all(bytes)
        .expect("compressing into an in-memory buffer cannot fail");
    enc.finish()
        .expect("compressing into an in-memory buffer cannot fail")
}

/// Decompress a `deflate`d buffer. Empty input is rejected; a real stream
/// always carries at least a header.
pub fn inflate(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Inflate(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "empty input is not a valid compressed stream",
        )));
    }
    let mut dec = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    dec.read_to_end(&mut out)?;
    Ok(out)
}

/// Standard padded-alphabet base64, matching mbedTLS's default alphabet.
pub fn b64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>, CodecError> {
    if s.is_empty() {
        return Err(CodecError::EmptyBase64);
    }
    Ok(STANDARD.decode(s)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_inflate_roundtrip() {
        let msg = b"5\n";
        let packed = deflate(msg);
        assert_eq!(inflate(&packed).unwrap(), msg);
    }

    #[test]
    fn deflate_empty_roundtrips() {
        let packed = deflate(b"");
        assert!(!packed.is_empty());
        assert_eq!(inflate(&packed).unwrap(), b"");
    }

    #[test]
    fn inflate_rejects_empty_input() {
        assert!(inflate(b"").is_err());
    }

    #[test]
    fn b64_encode_matches_reference_vector() {
        assert_eq!(b64_encode(&[1, 2, 3, 4]), "AQIDBA==");
    }

    #[test]
    fn b64_decode_matches_reference_vector() {
        assert_eq!(b64_decode("AQIDBA==").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn b64_decode_rejects_empty_input() {
        assert!(b64_decode("").is_err());
    }

    #[test]
    fn b64_decode_rejects_invalid_characters() {
        assert!(b64_decode("AQIDBA\u{1}").is_err());
    }
}
