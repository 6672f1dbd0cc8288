//! Error kinds used across the broker core.
//!
//! Codec errors split along the line the protocol draws: `Malformed` bytes
//! never get a response, while a `Protocol` violation may be answered with a
//! v5 DISCONNECT before the connection closes.

use thiserror::Error;

/// Errors produced while framing, decoding or encoding control packets.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Bytes do not parse: truncation, reserved-bit violations, bad
    /// variable-byte integers, invalid UTF-8.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// The packet parses but violates protocol semantics (empty SUBSCRIBE
    /// list, zero packet id where one is required, QoS 3).
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Inbound packet exceeds the configured maximum packet size.
    #[error("packet of {size} bytes exceeds maximum of {limit}")]
    PacketTooLarge { size: usize, limit: usize },

    /// CONNECT carried a protocol name/level pair the broker does not speak.
    #[error("unacceptable protocol version: level {0}")]
    UnacceptableVersion(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// True for errors that warrant dropping the connection without any
    /// response packet, regardless of protocol version.
    pub fn is_malformed(&self) -> bool {
        matches!(self, CodecError::Malformed(_))
    }
}

/// Errors surfaced by the session, subscription and retained stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The broker has begun termination; no further mutations are accepted.
    #[error("broker is shutting down")]
    Shutdown,

    /// All 65535 packet identifiers are currently allocated for this
    /// session; the message stays queued until an identifier frees up.
    #[error("packet identifiers exhausted")]
    PacketIdentifiersExhausted,

    /// The session disappeared between lookup and operation (expired or
    /// discarded by a concurrent clean-start connect).
    #[error("no session for client {0}")]
    SessionGone(String),
}

/// Authentication failures reported by the `Authenticator` capability.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("bad user name or password")]
    BadUserNameOrPassword,

    #[error("not authorized")]
    NotAuthorized,
}
