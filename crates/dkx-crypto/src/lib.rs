#![forbid(unsafe_code)]

pub mod error;
pub mod primitive;
pub mod keys;
pub mod codec;
pub mod utils;

pub mod facade;
pub mod handshake;
pub mod provisioning;

#[cfg(test)]
mod proptests;

pub use error::{CryptoError, CryptoResult, KeyHalf};
pub use facade::DeviceCrypto;
pub use handshake::{DeviceHandshake, HandshakeError, HandshakeStep, ServerHandshake};
pub use keys::{KeyPair, PrivateKey, PrivateKeySlot, PublicKey, PublicKeySlot, Signature};
