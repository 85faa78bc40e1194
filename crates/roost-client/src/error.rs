//! Client error types.

use std::io;

use thiserror::Error;

use roost_core::CodecError;

use crate::persist::PersistError;

/// Errors surfaced by the client, its connections and its callbacks.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("dial failed for {server}: {reason}")]
    Dial { server: String, reason: String },

    /// Dial or CONNACK wait exceeded the configured dial timeout.
    #[error("connection timeout")]
    Timeout,

    /// The broker answered CONNACK with a non-success code.
    #[error("handshake rejected by {server} with code {code:#04x}")]
    Handshake { server: String, code: u8 },

    #[error("no PINGRESP within the keepalive window")]
    KeepaliveTimeout,

    #[error("persist error: {0}")]
    Persist(#[from] PersistError),

    #[error("tls error: {0}")]
    Tls(String),

    /// All 65535 packet identifiers are in flight.
    #[error("packet identifiers exhausted")]
    IdExhausted,

    /// The client is shutting down or already destroyed.
    #[error("client closed")]
    Closed,

    #[error("no server configured")]
    NoServers,
}

pub type Result<T> = std::result::Result<T, ClientError>;
