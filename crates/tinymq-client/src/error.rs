//! Client error types.

use std::io;

use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] tinymq_core::ProtocolError),

    /// A blocking operation did not finish within its timeout. Never used
    /// for end-of-stream; that is `ConnectionClosed`.
    #[error("Operation timed out")]
    Timeout,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Connection refused: return code {0:#04x}")]
    ConnectionRefused(u8),

    #[error("Not connected")]
    NotConnected,

    /// An incoming acknowledgment matched no pending request.
    #[error("No matching pending request")]
    NoMatchingRequest,

    /// The server answered with a failure reason code.
    #[error("Request rejected with reason code {0:#04x}")]
    Rejected(u8),

    #[error("All packet identifiers are in flight")]
    PacketIdExhausted,

    #[error("Busy: {0}")]
    Busy(&'static str),

    #[error("Packet of {size} bytes exceeds the {max}-byte receive buffer")]
    PacketTooLarge { size: usize, max: usize },

    /// No PINGRESP arrived within the timeout; the session is dead.
    #[error("Keep-alive ping timed out")]
    KeepAliveTimeout,
}

pub type Result<T> = std::result::Result<T, ClientError>;
