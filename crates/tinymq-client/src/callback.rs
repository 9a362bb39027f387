//! Incremental message delivery.
//!
//! Incoming PUBLISH payloads are handed to the application in chunks: a
//! packet larger than the receive buffer is delivered across several
//! `on_payload` calls as its bytes arrive, so the full payload never has to
//! fit in memory at once.

use tinymq_core::packet::QoS;
use tinymq_core::property::PropertyList;

/// Metadata for a message being delivered.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub properties: Option<PropertyList>,
    /// Total payload length declared by the packet.
    pub total_payload_len: usize,
    /// Payload bytes delivered so far, including the current chunk.
    pub received_len: usize,
}

/// Handler trait for incoming messages and connection events.
///
/// All methods have default implementations that do nothing.
pub trait MessageHandler: Send {
    /// Called once per message, after the topic and headers are decoded and
    /// before any payload bytes.
    #[allow(unused_variables)]
    fn on_message_begin(&mut self, msg: &IncomingMessage) {}

    /// Called one or more times with consecutive payload chunks, in order.
    /// `msg.received_len` reflects progress through
    /// `msg.total_payload_len`.
    #[allow(unused_variables)]
    fn on_payload(&mut self, msg: &IncomingMessage, chunk: &[u8]) {}

    /// Called once after the final payload chunk.
    #[allow(unused_variables)]
    fn on_message_end(&mut self, msg: &IncomingMessage) {}

    /// Called when the server closes the session with a DISCONNECT packet.
    #[allow(unused_variables)]
    fn on_disconnect(&mut self, reason_code: u8) {}
}
