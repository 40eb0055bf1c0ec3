//! Four-step device/server key exchange.
//!
//! Each side proves possession of its private key by signing a fresh message
//! of its own and by signing the peer's message when it is echoed back:
//!
//! 1. device → server: `B64(M1 ‖ Sig_D(M1))` with `M1 = Dpub ‖ Dnonce`
//! 2. server → device: `B64(M2 ‖ Sig_S(M2))` with `M2 = Spub ‖ Snonce`
//! 3. server → device: `B64(M1 ‖ Sig_S(M1))`
//! 4. device → server: `B64(M2 ‖ Sig_D(M2))`
//!
//! Public keys are trusted on first handshake: whoever answers step 1 is
//! taken at their word about their own key. Both state machines borrow the
//! party's long-term [`KeyPair`] for their whole lifetime, and a failed
//! handshake cannot be resumed; start a new one to draw fresh nonces.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError};
use crate::error::{CryptoError, CryptoResult, KeyHalf};
use crate::keys::{KeyPair, PublicKey, Signature, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::utils::constant_time_compare_array;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 4;
/// Length of `public key ‖ nonce`.
pub const MESSAGE_LEN: usize = PUBLIC_KEY_LEN + NONCE_LEN;
/// Length of `message ‖ signature` before Base64 encoding.
pub const SIGNED_MESSAGE_LEN: usize = MESSAGE_LEN + SIGNATURE_LEN;

/// Keys and values used on the key/value test channel.
pub mod wire {
    pub const DEVICE_SIGNED_DEVICE_MESSAGE: &str = "deviceSignedDeviceMessage";
    pub const SERVER_SIGNED_SERVER_MESSAGE: &str = "serverSignedServerMessage";
    pub const SERVER_SIGNED_DEVICE_MESSAGE: &str = "serverSignedDeviceMessage";
    pub const DEVICE_SIGNED_SERVER_MESSAGE: &str = "deviceSignedServerMessage";

    /// Out-of-band verdict reported by the server after step 4.
    pub const SERVER_VERIFICATION: &str = "serverVerification";
    pub const VERIFICATION_SUCCESS: &str = "SUCCESS";
    /// Failure report; the value carries the reason.
    pub const ERROR: &str = "error";
    pub const VERIFICATION_FAILED: &str = "VERIFICATION FAILED";
}

// ============================================================================
// Errors
// ============================================================================

/// The protocol step a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStep {
    /// Step 1: the device's signed message.
    DeviceMessage,
    /// Step 2: the server's signed message.
    ServerMessage,
    /// Step 3: the device message echoed and signed by the server.
    EchoedDeviceMessage,
    /// Step 4: the server message echoed and signed by the device.
    EchoedServerMessage,
}

impl HandshakeStep {
    pub fn number(self) -> u8 {
        match self {
            HandshakeStep::DeviceMessage => 1,
            HandshakeStep::ServerMessage => 2,
            HandshakeStep::EchoedDeviceMessage => 3,
            HandshakeStep::EchoedServerMessage => 4,
        }
    }

    /// Key under which this step's payload travels on the key/value channel.
    pub fn wire_key(self) -> &'static str {
        match self {
            HandshakeStep::DeviceMessage => wire::DEVICE_SIGNED_DEVICE_MESSAGE,
            HandshakeStep::ServerMessage => wire::SERVER_SIGNED_SERVER_MESSAGE,
            HandshakeStep::EchoedDeviceMessage => wire::SERVER_SIGNED_DEVICE_MESSAGE,
            HandshakeStep::EchoedServerMessage => wire::DEVICE_SIGNED_SERVER_MESSAGE,
        }
    }
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({})", self.number(), self.wire_key())
    }
}

/// What went wrong within a step.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeErrorKind {
    #[error("payload is not valid base64: {0}")]
    Codec(#[from] CodecError),

    #[error("payload has {got} bytes, expected {expected}")]
    Length { expected: usize, got: usize },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("echoed message differs from the one sent")]
    EchoMismatch,

    #[error("message arrived out of order")]
    OutOfOrder,

    #[error("nonce generation failed: {0}")]
    Entropy(String),
}

/// A handshake failure, tagged with the step at which it happened.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("handshake failed at {step}: {kind}")]
pub struct HandshakeError {
    pub step: HandshakeStep,
    pub kind: HandshakeErrorKind,
}

impl HandshakeError {
    pub fn new(step: HandshakeStep, kind: HandshakeErrorKind) -> Self {
        Self { step, kind }
    }

    /// True when a signature or echo check failed, as opposed to a framing or
    /// sequencing problem.
    pub fn is_verification_failure(&self) -> bool {
        match &self.kind {
            HandshakeErrorKind::Crypto(e) => e.is_verification_failure(),
            HandshakeErrorKind::EchoMismatch => true,
            _ => false,
        }
    }
}

trait AtStep<T> {
    fn at(self, step: HandshakeStep) -> Result<T, HandshakeError>;
}

impl<T, E: Into<HandshakeErrorKind>> AtStep<T> for Result<T, E> {
    fn at(self, step: HandshakeStep) -> Result<T, HandshakeError> {
        self.map_err(|e| HandshakeError::new(step, e.into()))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Per-attempt random value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Draw a nonce from the OS RNG.
    pub fn random() -> Result<Self, HandshakeErrorKind> {
        let mut bytes = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut bytes).map_err(|e| HandshakeErrorKind::Entropy(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// `public key ‖ nonce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub public_key: PublicKey,
    pub nonce: Nonce,
}

impl HandshakeMessage {
    pub fn new(public_key: PublicKey, nonce: Nonce) -> Self {
        Self { public_key, nonce }
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_LEN] {
        let mut out = [0u8; MESSAGE_LEN];
        out[..PUBLIC_KEY_LEN].copy_from_slice(self.public_key.as_bytes());
        out[PUBLIC_KEY_LEN..].copy_from_slice(self.nonce.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; MESSAGE_LEN]) -> Self {
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        public_key.copy_from_slice(&bytes[..PUBLIC_KEY_LEN]);
        nonce.copy_from_slice(&bytes[PUBLIC_KEY_LEN..]);
        Self {
            public_key: PublicKey::from_bytes(public_key),
            nonce: Nonce(nonce),
        }
    }
}

/// A handshake message followed by a signature over its 36 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedMessage {
    pub message: HandshakeMessage,
    pub signature: Signature,
}

impl SignedMessage {
    /// Sign `message` with `signer`'s private key.
    pub fn sign(message: HandshakeMessage, signer: &KeyPair) -> CryptoResult<Self> {
        let signature = signer.sign(&message.to_bytes())?;
        Ok(Self { message, signature })
    }

    /// Check the signature under `verifier`'s public key.
    pub fn verify(&self, verifier: &KeyPair) -> CryptoResult<()> {
        verifier.verify(&self.message.to_bytes(), &self.signature)
    }

    pub fn to_bytes(&self) -> [u8; SIGNED_MESSAGE_LEN] {
        let mut out = [0u8; SIGNED_MESSAGE_LEN];
        out[..MESSAGE_LEN].copy_from_slice(&self.message.to_bytes());
        out[MESSAGE_LEN..].copy_from_slice(self.signature.as_bytes());
        out
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, HandshakeErrorKind> {
        if bytes.len() != SIGNED_MESSAGE_LEN {
            return Err(HandshakeErrorKind::Length {
                expected: SIGNED_MESSAGE_LEN,
                got: bytes.len(),
            });
        }
        let mut message = [0u8; MESSAGE_LEN];
        message.copy_from_slice(&bytes[..MESSAGE_LEN]);
        Ok(Self {
            message: HandshakeMessage::from_bytes(&message),
            signature: Signature::from_slice(&bytes[MESSAGE_LEN..])?,
        })
    }

    pub fn encode(&self) -> String {
        codec::encode(&self.to_bytes())
    }

    pub fn decode(text: &str) -> Result<Self, HandshakeErrorKind> {
        let bytes = codec::decode(text)?;
        Self::from_slice(&bytes)
    }
}

fn fresh_message(keys: &KeyPair) -> Result<SignedMessage, HandshakeErrorKind> {
    let public_key = keys
        .public_key()
        .ok_or(CryptoError::MissingKeyMaterial(KeyHalf::Public))?;
    let message = HandshakeMessage::new(public_key, Nonce::random()?);
    Ok(SignedMessage::sign(message, keys)?)
}

fn log_failure(role: &str, error: &HandshakeError) {
    warn!(role, step = error.step.number(), error = %error.kind, "handshake aborted");
}

// ============================================================================
// Device
// ============================================================================

#[derive(Debug)]
enum DeviceState {
    Idle,
    AwaitingServerMessage {
        sent: SignedMessage,
    },
    AwaitingEcho {
        sent: SignedMessage,
        server: KeyPair,
        server_message: HandshakeMessage,
    },
    Complete {
        server_key: PublicKey,
    },
    Failed {
        step: HandshakeStep,
    },
}

/// Device side of the key exchange.
#[derive(Debug)]
pub struct DeviceHandshake<'k> {
    keys: &'k KeyPair,
    state: DeviceState,
}

impl<'k> DeviceHandshake<'k> {
    pub fn new(keys: &'k KeyPair) -> Self {
        Self {
            keys,
            state: DeviceState::Idle,
        }
    }

    /// Step 1: produce the device's signed message.
    pub fn start(&mut self) -> Result<String, HandshakeError> {
        let step = HandshakeStep::DeviceMessage;
        match self.take_state(step) {
            DeviceState::Idle => {}
            other => return Err(self.out_of_order(other, step)),
        }

        let sent = fresh_message(self.keys)
            .at(step)
            .inspect_err(|e| log_failure("device", e))?;
        debug!(
            fingerprint = %sent.message.public_key.fingerprint(),
            "sending device message"
        );
        let encoded = sent.encode();
        self.state = DeviceState::AwaitingServerMessage { sent };
        Ok(encoded)
    }

    /// Step 2: accept the server's signed message and its public key.
    pub fn handle_server_message(&mut self, encoded: &str) -> Result<(), HandshakeError> {
        let step = HandshakeStep::ServerMessage;
        let sent = match self.take_state(step) {
            DeviceState::AwaitingServerMessage { sent } => sent,
            other => return Err(self.out_of_order(other, step)),
        };

        let (server, received) = Self::check_server_message(encoded)
            .at(step)
            .inspect_err(|e| log_failure("device", e))?;
        debug!(
            fingerprint = %received.message.public_key.fingerprint(),
            "verified server message"
        );
        self.state = DeviceState::AwaitingEcho {
            sent,
            server,
            server_message: received.message,
        };
        Ok(())
    }

    fn check_server_message(encoded: &str) -> Result<(KeyPair, SignedMessage), HandshakeErrorKind> {
        let received = SignedMessage::decode(encoded)?;
        let server = KeyPair::from_public_key(received.message.public_key.as_bytes())?;
        received.verify(&server)?;
        Ok((server, received))
    }

    /// Step 3, answered by step 4: check that the server echoed and signed
    /// the device message, then return the device's signature over the
    /// server message.
    pub fn handle_server_echo(&mut self, encoded: &str) -> Result<String, HandshakeError> {
        let step = HandshakeStep::EchoedDeviceMessage;
        let (sent, server, server_message) = match self.take_state(step) {
            DeviceState::AwaitingEcho {
                sent,
                server,
                server_message,
            } => (sent, server, server_message),
            other => return Err(self.out_of_order(other, step)),
        };

        check_echo(encoded, &sent.message, &server)
            .at(step)
            .inspect_err(|e| log_failure("device", e))?;

        let step = HandshakeStep::EchoedServerMessage;
        self.state = DeviceState::Failed { step };
        let reply = SignedMessage::sign(server_message, self.keys)
            .at(step)
            .inspect_err(|e| log_failure("device", e))?;

        let server_key = server_message.public_key;
        info!(server = %server_key.fingerprint(), "device handshake complete");
        self.state = DeviceState::Complete { server_key };
        Ok(reply.encode())
    }

    /// The server's public key, once the handshake has completed.
    pub fn server_public_key(&self) -> Option<PublicKey> {
        match &self.state {
            DeviceState::Complete { server_key } => Some(*server_key),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, DeviceState::Complete { .. })
    }

    /// The step at which the handshake failed, if it did.
    pub fn failed_step(&self) -> Option<HandshakeStep> {
        match self.state {
            DeviceState::Failed { step } => Some(step),
            _ => None,
        }
    }

    fn take_state(&mut self, step: HandshakeStep) -> DeviceState {
        std::mem::replace(&mut self.state, DeviceState::Failed { step })
    }

    fn out_of_order(&mut self, previous: DeviceState, step: HandshakeStep) -> HandshakeError {
        if let DeviceState::Failed { .. } = previous {
            self.state = previous;
        }
        let error = HandshakeError::new(step, HandshakeErrorKind::OutOfOrder);
        log_failure("device", &error);
        error
    }
}

/// Decode an echoed message, check that it is exactly `expected` and that
/// `signer` signed it.
fn check_echo(
    encoded: &str,
    expected: &HandshakeMessage,
    signer: &KeyPair,
) -> Result<(), HandshakeErrorKind> {
    let echoed = SignedMessage::decode(encoded)?;
    if !constant_time_compare_array(&echoed.message.to_bytes(), &expected.to_bytes()) {
        return Err(HandshakeErrorKind::EchoMismatch);
    }
    echoed.verify(signer)?;
    Ok(())
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug)]
enum ServerState {
    AwaitingDeviceMessage,
    AwaitingEcho {
        device: KeyPair,
        sent: SignedMessage,
    },
    Complete {
        device_key: PublicKey,
    },
    Failed {
        step: HandshakeStep,
    },
}

/// Server payloads sent in reply to the device message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReply {
    /// Step 2 payload, `B64(M2 ‖ Sig_S(M2))`.
    pub server_message: String,
    /// Step 3 payload, `B64(M1 ‖ Sig_S(M1))`.
    pub device_echo: String,
}

/// Server side of the key exchange. One instance per connection.
#[derive(Debug)]
pub struct ServerHandshake<'k> {
    keys: &'k KeyPair,
    state: ServerState,
}

impl<'k> ServerHandshake<'k> {
    pub fn new(keys: &'k KeyPair) -> Self {
        Self {
            keys,
            state: ServerState::AwaitingDeviceMessage,
        }
    }

    /// Step 1, answered by steps 2 and 3: verify the device message, then
    /// sign a fresh server message and the device message.
    pub fn handle_device_message(&mut self, encoded: &str) -> Result<ServerReply, HandshakeError> {
        let step = HandshakeStep::DeviceMessage;
        match self.take_state(step) {
            ServerState::AwaitingDeviceMessage => {}
            other => return Err(self.out_of_order(other, step)),
        }

        let (device, received) = Self::check_device_message(encoded)
            .at(step)
            .inspect_err(|e| log_failure("server", e))?;
        debug!(
            fingerprint = %received.message.public_key.fingerprint(),
            "verified device message"
        );

        let step = HandshakeStep::ServerMessage;
        self.state = ServerState::Failed { step };
        let sent = fresh_message(self.keys)
            .at(step)
            .inspect_err(|e| log_failure("server", e))?;

        let step = HandshakeStep::EchoedDeviceMessage;
        self.state = ServerState::Failed { step };
        let echo = SignedMessage::sign(received.message, self.keys)
            .at(step)
            .inspect_err(|e| log_failure("server", e))?;

        let reply = ServerReply {
            server_message: sent.encode(),
            device_echo: echo.encode(),
        };
        self.state = ServerState::AwaitingEcho { device, sent };
        Ok(reply)
    }

    fn check_device_message(encoded: &str) -> Result<(KeyPair, SignedMessage), HandshakeErrorKind> {
        let received = SignedMessage::decode(encoded)?;
        let device = KeyPair::from_public_key(received.message.public_key.as_bytes())?;
        received.verify(&device)?;
        Ok((device, received))
    }

    /// Step 4: check that the device echoed and signed the server message.
    pub fn handle_device_echo(&mut self, encoded: &str) -> Result<(), HandshakeError> {
        let step = HandshakeStep::EchoedServerMessage;
        let (device, sent) = match self.take_state(step) {
            ServerState::AwaitingEcho { device, sent } => (device, sent),
            other => return Err(self.out_of_order(other, step)),
        };

        check_echo(encoded, &sent.message, &device)
            .at(step)
            .inspect_err(|e| log_failure("server", e))?;

        let device_key = device
            .public_key()
            .ok_or(CryptoError::MissingKeyMaterial(KeyHalf::Public))
            .at(step)?;
        info!(device = %device_key.fingerprint(), "server handshake complete");
        self.state = ServerState::Complete { device_key };
        Ok(())
    }

    /// The device's public key, once the handshake has completed.
    pub fn device_public_key(&self) -> Option<PublicKey> {
        match &self.state {
            ServerState::Complete { device_key } => Some(*device_key),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, ServerState::Complete { .. })
    }

    pub fn failed_step(&self) -> Option<HandshakeStep> {
        match self.state {
            ServerState::Failed { step } => Some(step),
            _ => None,
        }
    }

    fn take_state(&mut self, step: HandshakeStep) -> ServerState {
        std::mem::replace(&mut self.state, ServerState::Failed { step })
    }

    fn out_of_order(&mut self, previous: ServerState, step: HandshakeStep) -> HandshakeError {
        if let ServerState::Failed { .. } = previous {
            self.state = previous;
        }
        let error = HandshakeError::new(step, HandshakeErrorKind::OutOfOrder);
        log_failure("server", &error);
        error
    }
}
