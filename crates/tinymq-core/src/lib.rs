//! tinymq-core - Core MQTT wire-format types and codecs.
//!
//! This crate provides packet encoding/decoding for MQTT 3.1.1 and MQTT 5.0
//! from the client's perspective: fixed-width and length-prefixed primitives,
//! variable byte integers, the v5 typed property list, and one encode/decode
//! pair per control packet type. It performs no I/O; the `tinymq-client`
//! crate drives these codecs over a transport.

pub mod codec;
pub mod error;
pub mod packet;
pub mod property;
pub mod varint;

pub use error::{ProtocolError, Result};
pub use packet::*;
pub use property::{DataKind, Property, PropertyList, PropertyType, PropertyValue};
