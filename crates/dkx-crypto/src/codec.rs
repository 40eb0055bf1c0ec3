//! Base64 transport codec.
//!
//! Keys, signatures and signed handshake messages travel over text-only
//! channels as standard Base64 (RFC 4648 §4, `=` padded). Decoding is strict:
//! input whose length is not a multiple of four, characters outside the
//! alphabet and non-canonical padding are all rejected.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use thiserror::Error;

/// Errors returned by [`decode`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("base64 input length {0} is not a multiple of 4")]
    InvalidLength(usize),

    #[error("malformed base64 input: {0}")]
    Malformed(String),
}

/// Encoded length for `input_len` bytes: 4 characters per 3 bytes, rounded up.
pub fn encoded_len(input_len: usize) -> usize {
    input_len.div_ceil(3) * 4
}

/// Encode bytes as padded standard Base64.
pub fn encode(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Decode padded standard Base64.
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    if text.len() % 4 != 0 {
        return Err(CodecError::InvalidLength(text.len()));
    }
    B64.decode(text)
        .map_err(|e| CodecError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4648_vectors() {
        let vectors = [
            ("", ""),
            ("f", "Zg=="),
            ("fo", "Zm8="),
            ("foo", "Zm9v"),
            ("foob", "Zm9vYg=="),
            ("fooba", "Zm9vYmE="),
            ("foobar", "Zm9vYmFy"),
        ];
        for (plain, encoded) in vectors {
            assert_eq!(encode(plain.as_bytes()), encoded);
            assert_eq!(decode(encoded).unwrap(), plain.as_bytes());
        }
    }

    #[test]
    fn test_round_trip_padding_edges() {
        for len in [0usize, 1, 2, 3, 4, 5, 100, 1024, 1025] {
            let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
            let text = encode(&data);
            assert_eq!(text.len(), encoded_len(len));
            assert_eq!(text.len() % 4, 0);
            assert_eq!(decode(&text).unwrap(), data);
        }
    }

    #[test]
    fn test_empty_round_trip() {
        assert_eq!(encode(&[]), "");
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert_eq!(decode("Zg="), Err(CodecError::InvalidLength(3)));
        assert_eq!(decode("Zm9vY"), Err(CodecError::InvalidLength(5)));
    }

    #[test]
    fn test_decode_rejects_bad_characters() {
        assert!(matches!(decode("Zm9*"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode("Zm 9"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode("Zm9v\n==="), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_misplaced_padding() {
        assert!(matches!(decode("Z=g="), Err(CodecError::Malformed(_))));
        assert!(matches!(decode("===="), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_encoded_len_formula() {
        assert_eq!(encoded_len(0), 0);
        assert_eq!(encoded_len(1), 4);
        assert_eq!(encoded_len(3), 4);
        assert_eq!(encoded_len(4), 8);
        assert_eq!(encoded_len(100), 136);
    }
}
