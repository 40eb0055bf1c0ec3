//! ED25519 key pair handling.
//!
//! A [`KeyPair`] either owns its key material (after [`KeyPair::generate`] or
//! [`KeyPair::import`]) or links to key buffers owned by someone else (after
//! [`KeyPair::link`]). Linked buffers are [`KeySlot`]s: shared handles whose
//! contents are read on every use, so a change made through the caller's
//! handle is visible to the key pair without any copy.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, CryptoResult, KeyHalf};
use crate::primitive::{embedded_public_key, Ed25519, SignaturePrimitive};
use crate::utils::constant_time_compare;

pub use crate::primitive::{PRIVATE_KEY_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN};

fn check_len(bytes: &[u8], expected: usize) -> CryptoResult<()> {
    if bytes.is_empty() {
        return Err(CryptoError::InvalidArgument("empty key"));
    }
    if bytes.len() != expected {
        return Err(CryptoError::InvalidKeyLength {
            expected,
            got: bytes.len(),
        });
    }
    Ok(())
}

/// An ED25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Copy a public key out of a slice of exactly [`PUBLIC_KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        check_len(bytes, PUBLIC_KEY_LEN)?;
        let mut key = [0u8; PUBLIC_KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_LEN] {
        self.0
    }

    /// Short hex fingerprint (first 8 bytes of SHA-256) for logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// An ED25519 private key in NaCl layout: `seed || public key`.
///
/// Zeroized on drop. Must never be sent to a remote party.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; PRIVATE_KEY_LEN]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; PRIVATE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        check_len(bytes, PRIVATE_KEY_LEN)?;
        let mut key = [0u8; PRIVATE_KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; PRIVATE_KEY_LEN] {
        &self.0
    }

    /// The public key carried in the last 32 bytes.
    pub fn embedded_public_key(&self) -> &[u8] {
        embedded_public_key(&self.0)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// A detached ED25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(CryptoError::InvalidArgument("signature must be 64 bytes"));
        }
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(bytes);
        Ok(Self(sig))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; SIGNATURE_LEN] {
        self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

/// Externally owned key storage that a [`KeyPair`] can link to.
///
/// Cloning a slot clones the handle, not the bytes. The buffer is zeroized
/// once the last handle is dropped.
pub struct KeySlot<const N: usize> {
    inner: Arc<RwLock<Zeroizing<[u8; N]>>>,
}

/// Slot holding a public key.
pub type PublicKeySlot = KeySlot<PUBLIC_KEY_LEN>;
/// Slot holding a private key.
pub type PrivateKeySlot = KeySlot<PRIVATE_KEY_LEN>;

impl<const N: usize> KeySlot<N> {
    pub fn new(bytes: [u8; N]) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Zeroizing::new(bytes))),
        }
    }

    /// Copy the current contents out of the slot.
    pub fn read(&self) -> Zeroizing<[u8; N]> {
        Zeroizing::new(**self.inner.read())
    }

    /// Replace the contents of the slot in place.
    pub fn write(&self, bytes: &[u8; N]) {
        self.inner.write().copy_from_slice(bytes);
    }

    /// Mutate the slot contents in place.
    pub fn update<F: FnOnce(&mut [u8; N])>(&self, f: F) {
        let mut guard = self.inner.write();
        f(&mut **guard);
    }

    /// True when both handles refer to the same buffer.
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<const N: usize> Clone for KeySlot<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<const N: usize> fmt::Debug for KeySlot<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySlot<{N}>")
    }
}

enum KeyMaterial {
    Empty,
    Owned {
        public: PublicKey,
        private: Option<PrivateKey>,
    },
    Linked {
        public: PublicKeySlot,
        private: Option<PrivateKeySlot>,
    },
}

/// An ED25519 key pair, owning or linking its key material.
pub struct KeyPair<P: SignaturePrimitive = Ed25519> {
    material: KeyMaterial,
    primitive: P,
}

impl KeyPair<Ed25519> {
    /// Create an empty key pair backed by ED25519.
    pub fn new() -> Self {
        Self::with_primitive(Ed25519)
    }

    /// Create a key pair holding freshly generated keys.
    pub fn generated() -> CryptoResult<Self> {
        let mut pair = Self::new();
        pair.generate()?;
        Ok(pair)
    }

    /// Create a verify-only key pair from a public key.
    pub fn from_public_key(public_key: &[u8]) -> CryptoResult<Self> {
        let mut pair = Self::new();
        pair.import_public_key(public_key)?;
        Ok(pair)
    }
}

impl Default for KeyPair<Ed25519> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: SignaturePrimitive> KeyPair<P> {
    /// Create an empty key pair using a custom signature primitive.
    pub fn with_primitive(primitive: P) -> Self {
        Self {
            material: KeyMaterial::Empty,
            primitive,
        }
    }

    /// Generate a new key pair, replacing any existing or linked material.
    pub fn generate(&mut self) -> CryptoResult<()> {
        let (public, private) = self.primitive.keypair()?;
        self.material = KeyMaterial::Owned {
            public: PublicKey::from_bytes(public),
            private: Some(PrivateKey::from_bytes(private)),
        };
        Ok(())
    }

    /// Import a key pair by copying the given bytes.
    ///
    /// Both slices must have the exact ED25519 sizes and the private key must
    /// carry `public_key` as its suffix. On error the key pair is unchanged.
    pub fn import(&mut self, public_key: &[u8], private_key: &[u8]) -> CryptoResult<()> {
        let public = PublicKey::from_slice(public_key)?;
        let private = PrivateKey::from_slice(private_key)?;
        if !constant_time_compare(private.embedded_public_key(), public.as_bytes()) {
            return Err(CryptoError::InvalidArgument(
                "private key does not embed the supplied public key",
            ));
        }

        self.material = KeyMaterial::Owned {
            public,
            private: Some(private),
        };
        Ok(())
    }

    /// Import only a public key. The key pair becomes verify-only.
    pub fn import_public_key(&mut self, public_key: &[u8]) -> CryptoResult<()> {
        let public = PublicKey::from_slice(public_key)?;
        self.material = KeyMaterial::Owned {
            public,
            private: None,
        };
        Ok(())
    }

    /// Link to externally owned key slots without copying.
    ///
    /// Without a private slot the key pair is verify-only.
    pub fn link(&mut self, public_key: PublicKeySlot, private_key: Option<PrivateKeySlot>) {
        self.material = KeyMaterial::Linked {
            public: public_key,
            private: private_key,
        };
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        match &self.material {
            KeyMaterial::Empty => None,
            KeyMaterial::Owned { public, .. } => Some(*public),
            KeyMaterial::Linked { public, .. } => Some(PublicKey::from_bytes(*public.read())),
        }
    }

    /// Copy out the private key, e.g. to print it during key generation.
    pub fn export_private_key(&self) -> Option<PrivateKey> {
        self.private_bytes().map(|bytes| PrivateKey::from_bytes(*bytes))
    }

    pub fn has_public_key(&self) -> bool {
        !matches!(self.material, KeyMaterial::Empty)
    }

    pub fn has_private_key(&self) -> bool {
        match &self.material {
            KeyMaterial::Empty => false,
            KeyMaterial::Owned { private, .. } => private.is_some(),
            KeyMaterial::Linked { private, .. } => private.is_some(),
        }
    }

    pub fn is_linked(&self) -> bool {
        matches!(self.material, KeyMaterial::Linked { .. })
    }

    /// Fingerprint of the public key, if any.
    pub fn fingerprint(&self) -> Option<String> {
        self.public_key().map(|key| key.fingerprint())
    }

    fn private_bytes(&self) -> Option<Zeroizing<[u8; PRIVATE_KEY_LEN]>> {
        match &self.material {
            KeyMaterial::Owned {
                private: Some(private),
                ..
            } => Some(Zeroizing::new(*private.as_bytes())),
            KeyMaterial::Linked {
                private: Some(slot),
                ..
            } => Some(slot.read()),
            _ => None,
        }
    }

    /// Sign `message`, returning the detached signature.
    pub fn sign(&self, message: &[u8]) -> CryptoResult<Signature> {
        let private = self
            .private_bytes()
            .ok_or(CryptoError::MissingKeyMaterial(KeyHalf::Private))?;
        if message.is_empty() {
            return Err(CryptoError::InvalidArgument("empty message"));
        }

        let signed = self.primitive.sign(message, &private)?;
        if signed.len() != SIGNATURE_LEN + message.len() {
            return Err(CryptoError::PrimitiveFailure(format!(
                "signed buffer has {} bytes, expected {}",
                signed.len(),
                SIGNATURE_LEN + message.len()
            )));
        }
        Signature::from_slice(&signed[..SIGNATURE_LEN])
    }

    /// Verify a detached signature over `message`.
    ///
    /// After the primitive accepts, the recovered message is compared with
    /// `message` again, so a primitive that reports success on altered or
    /// truncated content still fails with [`CryptoError::VerificationMismatch`].
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let public = self
            .public_key()
            .ok_or(CryptoError::MissingKeyMaterial(KeyHalf::Public))?;
        if message.is_empty() {
            return Err(CryptoError::InvalidArgument("empty message"));
        }

        let mut signed = Vec::with_capacity(SIGNATURE_LEN + message.len());
        signed.extend_from_slice(signature.as_bytes());
        signed.extend_from_slice(message);

        let recovered = self.primitive.open(&signed, public.as_bytes())?;
        if recovered.len() != message.len() || !constant_time_compare(&recovered, message) {
            return Err(CryptoError::VerificationMismatch);
        }
        Ok(())
    }
}

impl<P: SignaturePrimitive> fmt::Debug for KeyPair<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .field("has_private_key", &self.has_private_key())
            .field("linked", &self.is_linked())
            .finish()
    }
}
