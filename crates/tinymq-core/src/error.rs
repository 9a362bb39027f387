//! Protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding MQTT packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Incomplete packet: needed {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Invalid remaining length")]
    InvalidRemainingLength,

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("Invalid reason code: {0:#04x}")]
    InvalidReasonCode(u8),

    #[error("Property {property:#04x} not allowed in {packet} packet")]
    PropertyNotAllowed { property: u8, packet: &'static str },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Bad argument: {0}")]
    BadArg(&'static str),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Packet too large: {size} exceeds {max}")]
    PacketTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
