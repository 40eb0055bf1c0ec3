//! Device-side crypto context.
//!
//! [`DeviceCrypto`] bundles the device's own key pair with the single backend
//! public key the device trusts. It is constructed explicitly and passed to
//! whoever needs it; there is no process-wide instance.

use tracing::debug;

use crate::codec;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyPair, PublicKey, Signature};

/// Own identity plus one trusted backend key.
#[derive(Debug, Default)]
pub struct DeviceCrypto {
    own: KeyPair,
    backend: Option<KeyPair>,
    backend_signature: Option<Signature>,
}

impl DeviceCrypto {
    /// Create a context without any keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context around an existing device key pair.
    pub fn with_key_pair(own: KeyPair) -> Self {
        Self {
            own,
            backend: None,
            backend_signature: None,
        }
    }

    /// Generate the device identity.
    ///
    /// Calling this again replaces the identity; callers must not re-key while
    /// a handshake borrowing [`DeviceCrypto::key_pair`] is in flight.
    pub fn create_key_pair(&mut self) -> CryptoResult<()> {
        self.own.generate()?;
        if let Some(fingerprint) = self.own.fingerprint() {
            debug!(%fingerprint, "created device key pair");
        }
        Ok(())
    }

    /// The device key pair, e.g. to drive a handshake.
    pub fn key_pair(&self) -> &KeyPair {
        &self.own
    }

    pub fn my_public_key(&self) -> Option<PublicKey> {
        self.own.public_key()
    }

    /// Sign with the device private key.
    pub fn sign_message(&self, message: &[u8]) -> CryptoResult<Signature> {
        self.own.sign(message)
    }

    /// Sign with the device private key and Base64-encode the signature.
    pub fn sign_message_encoded(&self, message: &[u8]) -> CryptoResult<String> {
        let signature = self.sign_message(message)?;
        Ok(codec::encode(signature.as_bytes()))
    }

    /// Verify a signature made by the trusted backend.
    ///
    /// Returns [`CryptoError::NoPeerKey`] when no backend key has been
    /// imported, which is distinct from a signature that fails to verify.
    /// The signature is remembered as the last one seen from the backend.
    pub fn verify_signature(&mut self, signature: &Signature, message: &[u8]) -> CryptoResult<()> {
        let backend = self.backend.as_ref().ok_or(CryptoError::NoPeerKey)?;
        self.backend_signature = Some(*signature);
        backend.verify(message, signature)
    }

    pub fn encode_message_base64(&self, message: &[u8]) -> String {
        codec::encode(message)
    }

    pub fn decode_message_base64(&self, message: &str) -> CryptoResult<Vec<u8>> {
        Ok(codec::decode(message)?)
    }

    /// Replace the trusted backend key.
    ///
    /// Only the length is checked; the caller must already have authenticated
    /// the channel the key arrived on (for example through a completed
    /// handshake).
    pub fn import_public_key(&mut self, public_key: &[u8]) -> CryptoResult<()> {
        let backend = KeyPair::from_public_key(public_key)?;
        if let Some(fingerprint) = backend.fingerprint() {
            debug!(%fingerprint, "imported backend public key");
        }
        self.backend = Some(backend);
        Ok(())
    }

    pub fn backend_public_key(&self) -> Option<PublicKey> {
        self.backend.as_ref().and_then(KeyPair::public_key)
    }

    /// Last backend signature passed to [`DeviceCrypto::verify_signature`].
    /// Diagnostic only; never used for trust decisions.
    pub fn backend_signature(&self) -> Option<Signature> {
        self.backend_signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyHalf;
    use ed25519_dalek::SigningKey;

    fn random_message(len: usize) -> Vec<u8> {
        let mut message = vec![0u8; len];
        getrandom::getrandom(&mut message).unwrap();
        message
    }

    #[test]
    fn test_import_backend_key() {
        let public = SigningKey::from_bytes(&[3u8; 32]).verifying_key().to_bytes();
        let mut device = DeviceCrypto::new();
        device.import_public_key(&public).unwrap();
        assert_eq!(device.backend_public_key().unwrap().as_bytes(), &public);
    }

    #[test]
    fn test_import_backend_key_rejects_bad_length() {
        let mut device = DeviceCrypto::new();
        assert_eq!(
            device.import_public_key(&[0u8; 31]),
            Err(CryptoError::InvalidKeyLength { expected: 32, got: 31 })
        );
        assert!(device.backend_public_key().is_none());
    }

    #[test]
    fn test_encode_decode_message() {
        let device = DeviceCrypto::new();
        let message = random_message(100);
        let encoded = device.encode_message_base64(&message);
        assert_eq!(device.decode_message_base64(&encoded).unwrap(), message);
        assert!(matches!(
            device.decode_message_base64("abc"),
            Err(CryptoError::Codec(_))
        ));
    }

    #[test]
    fn test_sign_and_verify_between_two_devices() {
        for _ in 0..10 {
            let mut mine = DeviceCrypto::new();
            let mut other = DeviceCrypto::new();
            mine.create_key_pair().unwrap();
            other.create_key_pair().unwrap();

            other
                .import_public_key(mine.my_public_key().unwrap().as_bytes())
                .unwrap();
            mine.import_public_key(other.my_public_key().unwrap().as_bytes())
                .unwrap();

            let message = random_message(100);
            let my_signature = mine.sign_message(&message).unwrap();
            let other_signature = other.sign_message(&message).unwrap();

            assert!(mine.verify_signature(&other_signature, &message).is_ok());
            assert!(other.verify_signature(&my_signature, &message).is_ok());
            assert_eq!(mine.backend_signature(), Some(other_signature));
        }
    }

    #[test]
    fn test_verify_trusts_only_backend_key() {
        let mut device = DeviceCrypto::new();
        device.create_key_pair().unwrap();
        let backend = KeyPair::generated().unwrap();
        let stranger = KeyPair::generated().unwrap();
        device
            .import_public_key(backend.public_key().unwrap().as_bytes())
            .unwrap();

        let signature = stranger.sign(b"payload").unwrap();
        assert_eq!(
            device.verify_signature(&signature, b"payload"),
            Err(CryptoError::SignatureRejected)
        );
        // Own signatures are not trusted either.
        let own = device.sign_message(b"payload").unwrap();
        assert!(device.verify_signature(&own, b"payload").is_err());
    }

    #[test]
    fn test_verify_without_backend_key_is_distinct_error() {
        let mut device = DeviceCrypto::new();
        let signature = Signature::from_bytes([0u8; 64]);
        assert_eq!(
            device.verify_signature(&signature, b"payload"),
            Err(CryptoError::NoPeerKey)
        );
        assert!(device.backend_signature().is_none());
    }

    #[test]
    fn test_sign_without_identity() {
        let device = DeviceCrypto::new();
        assert_eq!(
            device.sign_message(b"payload"),
            Err(CryptoError::MissingKeyMaterial(KeyHalf::Private))
        );
    }

    #[test]
    fn test_sign_message_encoded() {
        let mut device = DeviceCrypto::new();
        device.create_key_pair().unwrap();
        let encoded = device.sign_message_encoded(b"payload").unwrap();
        let raw = device.decode_message_base64(&encoded).unwrap();
        let signature = Signature::from_slice(&raw).unwrap();
        assert!(device.key_pair().verify(b"payload", &signature).is_ok());
    }

    #[test]
    fn test_create_key_pair_replaces_identity() {
        let mut device = DeviceCrypto::new();
        device.create_key_pair().unwrap();
        let first = device.my_public_key().unwrap();
        device.create_key_pair().unwrap();
        assert_ne!(first, device.my_public_key().unwrap());
    }
}
