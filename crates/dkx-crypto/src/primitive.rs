//! Signature primitive seam.
//!
//! Key pairs talk to the signature algorithm through [`SignaturePrimitive`],
//! which follows the NaCl `crypto_sign` conventions: signing yields a combined
//! `signature || message` buffer and opening a combined buffer yields the
//! recovered message. [`Ed25519`] is the production implementation on top of
//! `ed25519-dalek`.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use getrandom::getrandom;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};

/// ED25519 public key size in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;
/// ED25519 private key size in bytes (`seed || public key`).
pub const PRIVATE_KEY_LEN: usize = 64;
/// ED25519 signature size in bytes.
pub const SIGNATURE_LEN: usize = 64;

const SEED_LEN: usize = PRIVATE_KEY_LEN - PUBLIC_KEY_LEN;

/// Opaque signature capability consumed by [`KeyPair`](crate::keys::KeyPair).
pub trait SignaturePrimitive {
    /// Create a fresh `(public, private)` key pair.
    fn keypair(&self) -> CryptoResult<([u8; PUBLIC_KEY_LEN], [u8; PRIVATE_KEY_LEN])>;

    /// Sign `message`, returning `signature || message`.
    fn sign(&self, message: &[u8], private_key: &[u8; PRIVATE_KEY_LEN]) -> CryptoResult<Vec<u8>>;

    /// Open a combined `signature || message` buffer, returning the message.
    fn open(&self, signed: &[u8], public_key: &[u8; PUBLIC_KEY_LEN]) -> CryptoResult<Vec<u8>>;
}

/// ED25519 via `ed25519-dalek`, private keys in the 64-byte NaCl layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519;

impl SignaturePrimitive for Ed25519 {
    fn keypair(&self) -> CryptoResult<([u8; PUBLIC_KEY_LEN], [u8; PRIVATE_KEY_LEN])> {
        let mut seed = [0u8; SEED_LEN];
        getrandom(&mut seed)
            .map_err(|e| CryptoError::PrimitiveFailure(format!("entropy source: {e}")))?;
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();

        Ok((
            signing_key.verifying_key().to_bytes(),
            signing_key.to_keypair_bytes(),
        ))
    }

    fn sign(&self, message: &[u8], private_key: &[u8; PRIVATE_KEY_LEN]) -> CryptoResult<Vec<u8>> {
        // Rejects a private key whose public suffix does not belong to its seed.
        let signing_key = SigningKey::from_keypair_bytes(private_key)
            .map_err(|e| CryptoError::PrimitiveFailure(format!("private key: {e}")))?;
        let signature: Signature = signing_key.sign(message);

        let mut signed = Vec::with_capacity(SIGNATURE_LEN + message.len());
        signed.extend_from_slice(&signature.to_bytes());
        signed.extend_from_slice(message);
        Ok(signed)
    }

    fn open(&self, signed: &[u8], public_key: &[u8; PUBLIC_KEY_LEN]) -> CryptoResult<Vec<u8>> {
        if signed.len() < SIGNATURE_LEN {
            return Err(CryptoError::SignatureRejected);
        }
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| CryptoError::PrimitiveFailure(format!("public key: {e}")))?;

        let (sig_bytes, message) = signed.split_at(SIGNATURE_LEN);
        let signature = Signature::from_slice(sig_bytes).map_err(|_| CryptoError::SignatureRejected)?;
        verifying_key
            .verify_strict(message, &signature)
            .map_err(|_| CryptoError::SignatureRejected)?;

        Ok(message.to_vec())
    }
}

/// The public key embedded as the suffix of a NaCl private key.
pub fn embedded_public_key(private_key: &[u8; PRIVATE_KEY_LEN]) -> &[u8] {
    &private_key[SEED_LEN..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_layout() {
        let (public, private) = Ed25519.keypair().unwrap();
        assert_eq!(embedded_public_key(&private), public.as_slice());
        assert_ne!(public, [0u8; PUBLIC_KEY_LEN]);
    }

    #[test]
    fn test_sign_produces_combined_buffer() {
        let (public, private) = Ed25519.keypair().unwrap();
        let signed = Ed25519.sign(b"payload", &private).unwrap();

        assert_eq!(signed.len(), SIGNATURE_LEN + 7);
        assert_eq!(&signed[SIGNATURE_LEN..], b"payload");
        assert_eq!(Ed25519.open(&signed, &public).unwrap(), b"payload".to_vec());
    }

    #[test]
    fn test_open_rejects_short_buffer() {
        let (public, _) = Ed25519.keypair().unwrap();
        assert_eq!(
            Ed25519.open(&[0u8; SIGNATURE_LEN - 1], &public),
            Err(CryptoError::SignatureRejected)
        );
    }

    #[test]
    fn test_sign_rejects_inconsistent_private_key() {
        let (_, mut private) = Ed25519.keypair().unwrap();
        private[PRIVATE_KEY_LEN - 1] ^= 0x01;
        assert!(matches!(
            Ed25519.sign(b"payload", &private),
            Err(CryptoError::PrimitiveFailure(_))
        ));
    }

    #[test]
    fn test_deterministic_signatures() {
        let signing_key = SigningKey::from_bytes(&[7u8; SEED_LEN]);
        let private = signing_key.to_keypair_bytes();
        let a = Ed25519.sign(b"same", &private).unwrap();
        let b = Ed25519.sign(b"same", &private).unwrap();
        assert_eq!(a, b);
    }
}
