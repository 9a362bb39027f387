//! tinymq-client - Multithreaded blocking MQTT client.
//!
//! An MQTT 3.1.1 / 5.0 client built for resource-constrained environments:
//! every blocking operation carries a timeout, incoming payloads larger
//! than the receive buffer are delivered in chunks, and several threads may
//! share one session. One thread at a time drains the socket; the
//! pending-response registry routes each acknowledgment to the thread that
//! asked for it, so requests issued from different threads interleave
//! freely on the wire.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tinymq_client::{Client, ClientConfig, QoS, TcpTransport};
//!
//! let transport = TcpTransport::connect("localhost:1883", Duration::from_secs(5))?;
//! let client = Client::new(transport, ClientConfig::new("sensor-17"));
//!
//! client.connect()?;
//! client.subscribe(&[("commands/sensor-17", QoS::AtLeastOnce)])?;
//! client.publish("status/sensor-17", b"online", QoS::AtLeastOnce, true)?;
//!
//! loop {
//!     client.keep_alive()?;
//!     match client.poll_message(Duration::from_millis(500)) {
//!         Ok(()) | Err(tinymq_client::ClientError::Timeout) => {}
//!         Err(e) => break Err(e),
//!     }
//! }
//! ```

mod callback;
mod client;
mod config;
mod error;
mod packet_id;
mod pending;
mod state;
mod transport;

pub use callback::{IncomingMessage, MessageHandler};
pub use client::{AuthHandler, Client};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use packet_id::PacketIdAllocator;
pub use pending::{PendingHandle, PendingRegistry};
pub use state::{MsgState, MsgStatus};
pub use transport::{TcpTransport, Transport};

// Re-export the wire-level types applications interact with
pub use tinymq_core::packet::{
    reason_code, Auth, Connack, Disconnect, Packet, PacketType, PubResp, Publish, QoS,
    SubscriptionOptions, Topic, Will,
};
pub use tinymq_core::property::{Property, PropertyList, PropertyType, PropertyValue};
