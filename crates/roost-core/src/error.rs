//! Codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding MQTT control packets.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The frame is malformed or carries a property identifier this
    /// implementation does not know (its size cannot be inferred).
    #[error("bad packet: {0}")]
    BadPacket(String),

    /// A CONNECT declared a protocol level other than the one the caller
    /// asked to decode with.
    #[error("protocol level {found} does not match declared version {expected}")]
    VersionMismatch { expected: u8, found: u8 },

    /// The codec was invoked with a version other than 3.1.1 (4) or 5.0 (5).
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The packet body would exceed the 268,435,455 byte limit imposed by
    /// the four byte remaining-length encoding.
    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

impl CodecError {
    pub(crate) fn bad(msg: impl Into<String>) -> Self {
        CodecError::BadPacket(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
