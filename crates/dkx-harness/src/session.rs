//! Handshake drivers over a key/value channel.
//!
//! The device side runs steps 1 to 4 and then waits for the server's verdict
//! (`serverVerification=SUCCESS` or `error=<reason>`). The server side
//! answers one device per connection, each with its own handshake state and
//! nonce, sharing one long-term key pair.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use dkx_crypto::handshake::{wire, HandshakeError};
use dkx_crypto::{DeviceHandshake, KeyPair, PublicKey, ServerHandshake};

use crate::kv::DEFAULT_SLICE_SIZE;
use crate::transport::{Acceptor, KvChannel, KvTransport, LineTransport, TransportError};

/// Pause after a failed `accept` so a persistent error (EMFILE) doesn't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The peer sent `error=<reason>` instead of the expected value
    #[error("peer reported error: {0}")]
    Remote(String),

    #[error("expected {expected:?}, got {got:?}")]
    UnexpectedKey { expected: &'static str, got: String },

    /// The server did not confirm the handshake
    #[error("server rejected the handshake: {0}")]
    Rejected(String),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Transport(TransportError::Timeout(_)))
    }

    /// True when a signature or echo check failed on either side.
    pub fn is_verification_failure(&self) -> bool {
        match self {
            SessionError::Handshake(e) => e.is_verification_failure(),
            SessionError::Remote(reason) | SessionError::Rejected(reason) => {
                reason == wire::VERIFICATION_FAILED
            }
            _ => false,
        }
    }
}

/// Slice size and receive timeout for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub slice_size: usize,
    pub timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            slice_size: DEFAULT_SLICE_SIZE,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ChannelSettings {
    pub fn channel<T: KvTransport>(&self, transport: T) -> Result<KvChannel<T>, TransportError> {
        KvChannel::new(transport, self.slice_size, self.timeout)
    }
}

/// Reason reported to the peer for a failed handshake.
pub fn failure_reason(error: &HandshakeError) -> String {
    if error.is_verification_failure() {
        wire::VERIFICATION_FAILED.to_string()
    } else {
        error.to_string()
    }
}

async fn expect<T: KvTransport>(
    channel: &mut KvChannel<T>,
    key: &'static str,
) -> Result<String, SessionError> {
    let line = channel.recv().await?;
    if line.key == wire::ERROR {
        return Err(SessionError::Remote(line.value));
    }
    if line.key != key {
        return Err(SessionError::UnexpectedKey {
            expected: key,
            got: line.key,
        });
    }
    Ok(line.value)
}

/// Tell the peer why the handshake stopped. Best effort: the handshake error
/// is what the caller gets either way.
async fn report_failure<T: KvTransport>(channel: &mut KvChannel<T>, error: HandshakeError) -> SessionError {
    if let Err(e) = channel.send(wire::ERROR, &failure_reason(&error)).await {
        debug!(error = %e, "could not report handshake failure to peer");
    }
    SessionError::Handshake(error)
}

/// Run the device side and wait for the server's verdict.
///
/// Returns the server's public key once the server has confirmed success.
pub async fn run_device<T: KvTransport>(
    channel: &mut KvChannel<T>,
    keys: &KeyPair,
) -> Result<PublicKey, SessionError> {
    let mut handshake = DeviceHandshake::new(keys);

    let m1 = handshake.start()?;
    channel.send(wire::DEVICE_SIGNED_DEVICE_MESSAGE, &m1).await?;

    let m2 = expect(channel, wire::SERVER_SIGNED_SERVER_MESSAGE).await?;
    if let Err(e) = handshake.handle_server_message(&m2) {
        return Err(report_failure(channel, e).await);
    }

    let echo = expect(channel, wire::SERVER_SIGNED_DEVICE_MESSAGE).await?;
    let m4 = match handshake.handle_server_echo(&echo) {
        Ok(m4) => m4,
        Err(e) => return Err(report_failure(channel, e).await),
    };
    channel.send(wire::DEVICE_SIGNED_SERVER_MESSAGE, &m4).await?;

    let verdict = channel.recv().await?;
    match verdict.key.as_str() {
        wire::SERVER_VERIFICATION if verdict.value == wire::VERIFICATION_SUCCESS => {}
        wire::SERVER_VERIFICATION | wire::ERROR => return Err(SessionError::Rejected(verdict.value)),
        _ => {
            return Err(SessionError::UnexpectedKey {
                expected: wire::SERVER_VERIFICATION,
                got: verdict.key,
            })
        }
    }

    let server_key = handshake
        .server_public_key()
        .ok_or_else(|| SessionError::Rejected("handshake incomplete".to_string()))?;
    info!(server = %server_key.fingerprint(), "server confirmed handshake");
    Ok(server_key)
}

/// Run the server side for one device and report the verdict.
///
/// Returns the device's public key on success.
pub async fn run_server<T: KvTransport>(
    channel: &mut KvChannel<T>,
    keys: &KeyPair,
) -> Result<PublicKey, SessionError> {
    let mut handshake = ServerHandshake::new(keys);

    let m1 = expect(channel, wire::DEVICE_SIGNED_DEVICE_MESSAGE).await?;
    let reply = match handshake.handle_device_message(&m1) {
        Ok(reply) => reply,
        Err(e) => return Err(report_failure(channel, e).await),
    };
    channel
        .send(wire::SERVER_SIGNED_SERVER_MESSAGE, &reply.server_message)
        .await?;
    channel
        .send(wire::SERVER_SIGNED_DEVICE_MESSAGE, &reply.device_echo)
        .await?;

    let m4 = expect(channel, wire::DEVICE_SIGNED_SERVER_MESSAGE).await?;
    if let Err(e) = handshake.handle_device_echo(&m4) {
        return Err(report_failure(channel, e).await);
    }
    channel
        .send(wire::SERVER_VERIFICATION, wire::VERIFICATION_SUCCESS)
        .await?;

    handshake
        .device_public_key()
        .ok_or_else(|| SessionError::Rejected("handshake incomplete".to_string()))
}

/// Connect to a server over TCP and run the device side.
pub async fn connect(
    addr: SocketAddr,
    keys: &KeyPair,
    settings: ChannelSettings,
) -> Result<PublicKey, SessionError> {
    let stream = TcpStream::connect(addr).await.map_err(TransportError::from)?;
    debug!(%addr, "connected");
    let mut channel = settings.channel(LineTransport::tcp(stream))?;
    run_device(&mut channel, keys).await
}

/// Accept devices on `listener`, one handshake task per connection.
///
/// With `max_sessions` set, stops accepting after that many connections and
/// returns once their handshakes have finished. Failed accepts and individual
/// handshake failures are logged; sessions in flight keep running.
pub async fn serve<A: Acceptor>(
    mut listener: A,
    keys: Arc<KeyPair>,
    settings: ChannelSettings,
    max_sessions: Option<usize>,
) -> Vec<Result<PublicKey, SessionError>> {
    let mut tasks = JoinSet::new();
    let mut accepted = 0usize;

    while max_sessions.map_or(true, |max| accepted < max) {
        let (transport, peer) = match listener.accept().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        accepted += 1;
        debug!(%peer, "accepted connection");

        let keys = Arc::clone(&keys);
        tasks.spawn(async move {
            let result = match settings.channel(transport) {
                Ok(mut channel) => run_server(&mut channel, &keys).await,
                Err(e) => Err(e.into()),
            };
            match &result {
                Ok(device) => info!(%peer, device = %device.fingerprint(), "handshake succeeded"),
                Err(e) => warn!(%peer, error = %e, "handshake failed"),
            }
            result
        });

        // Reap finished sessions so a long-running server doesn't accumulate them.
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "session task panicked");
            }
        }
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!(error = %e, "session task panicked"),
        }
    }
    results
}
