//! dkx harness - drives the four-step key exchange over a line transport
//!
//! This crate provides:
//! - The `{{key;value}}` line codec with value slicing
//! - Line transports over TCP, stdio or in memory
//! - Device and server drivers reporting the server's verdict
//! - The `dkx` command-line interface

pub mod cli;
pub mod config;
pub mod kv;
pub mod session;
pub mod transport;

#[cfg(test)]
mod proptests;

pub use cli::Cli;
pub use config::{CliOverrides, Config};
pub use session::{ChannelSettings, SessionError};

use transport::TransportError;

/// Process exit status of the `dkx` binary. Scripts driving the harness
/// branch on these, so the numbers are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    /// Anything not covered below, including a peer's `error` verdict
    GeneralError = 1,
    /// A signature or echo check failed on either side
    VerificationFailed = 2,
    Timeout = 3,
    /// Connect refused, or the peer hung up mid-handshake
    ConnectionFailed = 4,
    /// Malformed line, bad length or unexpected key
    ProtocolError = 5,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<&SessionError> for ExitCode {
    fn from(error: &SessionError) -> Self {
        if error.is_timeout() {
            return ExitCode::Timeout;
        }
        if error.is_verification_failure() {
            return ExitCode::VerificationFailed;
        }
        match error {
            SessionError::Transport(TransportError::Io(_) | TransportError::Disconnected) => {
                ExitCode::ConnectionFailed
            }
            SessionError::Transport(_)
            | SessionError::Handshake(_)
            | SessionError::UnexpectedKey { .. } => ExitCode::ProtocolError,
            SessionError::Remote(_) | SessionError::Rejected(_) => ExitCode::GeneralError,
        }
    }
}

impl ExitCode {
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Stable upper-case name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::VerificationFailed => "VERIFICATION_FAILED",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::ProtocolError => "PROTOCOL_ERROR",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExitCode::Success => "Handshake completed and confirmed",
            ExitCode::GeneralError => "Handshake did not complete",
            ExitCode::VerificationFailed => "A signature or echo check failed",
            ExitCode::Timeout => "The peer did not answer in time",
            ExitCode::ConnectionFailed => "Could not connect or the peer went away",
            ExitCode::ProtocolError => "Malformed or unexpected message",
        }
    }
}

#[cfg(test)]
mod exit_code_tests {
    use super::*;
    use dkx_crypto::handshake::{wire, HandshakeError, HandshakeErrorKind, HandshakeStep};
    use std::time::Duration;

    #[test]
    fn test_numeric_values_are_stable() {
        assert_eq!(i32::from(ExitCode::Success), 0);
        assert_eq!(i32::from(ExitCode::GeneralError), 1);
        assert_eq!(i32::from(ExitCode::VerificationFailed), 2);
        assert_eq!(i32::from(ExitCode::Timeout), 3);
        assert_eq!(i32::from(ExitCode::ConnectionFailed), 4);
        assert_eq!(i32::from(ExitCode::ProtocolError), 5);
    }

    #[test]
    fn test_names_and_descriptions() {
        assert_eq!(ExitCode::VerificationFailed.name(), "VERIFICATION_FAILED");
        assert_eq!(ExitCode::ProtocolError.name(), "PROTOCOL_ERROR");
        assert!(ExitCode::Timeout.description().contains("in time"));
    }

    #[test]
    fn test_exit_code_from_session_error() {
        let timeout = SessionError::Transport(TransportError::Timeout(Duration::from_secs(1)));
        assert_eq!(ExitCode::from(&timeout), ExitCode::Timeout);

        let gone = SessionError::Transport(TransportError::Disconnected);
        assert_eq!(ExitCode::from(&gone), ExitCode::ConnectionFailed);

        let rejected = SessionError::Rejected(wire::VERIFICATION_FAILED.to_string());
        assert_eq!(ExitCode::from(&rejected), ExitCode::VerificationFailed);

        let echo = SessionError::Handshake(HandshakeError::new(
            HandshakeStep::EchoedDeviceMessage,
            HandshakeErrorKind::EchoMismatch,
        ));
        assert_eq!(ExitCode::from(&echo), ExitCode::VerificationFailed);

        let framing = SessionError::Handshake(HandshakeError::new(
            HandshakeStep::ServerMessage,
            HandshakeErrorKind::Length { expected: 100, got: 12 },
        ));
        assert_eq!(ExitCode::from(&framing), ExitCode::ProtocolError);
    }
}
