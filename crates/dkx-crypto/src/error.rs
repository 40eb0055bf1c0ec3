//! Error types for key handling, signing and verification.

use thiserror::Error;

use crate::codec::CodecError;

/// Which half of a key pair an operation needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHalf {
    Public,
    Private,
}

impl std::fmt::Display for KeyHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyHalf::Public => write!(f, "public key"),
            KeyHalf::Private => write!(f, "private key"),
        }
    }
}

/// Errors returned by [`KeyPair`](crate::keys::KeyPair) and
/// [`DeviceCrypto`](crate::facade::DeviceCrypto) operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Sign or verify attempted without the required key half.
    #[error("missing key material: no {0} present")]
    MissingKeyMaterial(KeyHalf),

    /// Null, empty or otherwise unusable input.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Key bytes of the wrong size for ED25519.
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    /// The underlying primitive could not complete (entropy, malformed key).
    #[error("signature primitive failed: {0}")]
    PrimitiveFailure(String),

    /// The primitive refused the signature.
    #[error("signature rejected")]
    SignatureRejected,

    /// The primitive accepted the signature but the recovered message differs
    /// from the one supplied by the caller.
    #[error("verification mismatch: recovered message differs from input")]
    VerificationMismatch,

    /// Verification requested before any backend key was imported.
    #[error("no backend public key imported")]
    NoPeerKey,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl CryptoError {
    /// True for the outcomes that mean "this signature is not valid", as
    /// opposed to configuration or argument problems.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::SignatureRejected | CryptoError::VerificationMismatch
        )
    }
}

/// Result alias used throughout the crate.
pub type CryptoResult<T> = Result<T, CryptoError>;
