//! MQTT packet types and codecs for MQTT 3.1.1 and MQTT 5.0.
//!
//! One encode/decode pair per control packet type, written from the
//! client's perspective but covering both directions so the codecs can be
//! exercised against each other. Encoders build the variable header and
//! payload in a pre-pass buffer, then emit the fixed header once the
//! remaining length is known. Decoders return `Ok(None)` while a packet is
//! only partially buffered.

use bytes::Bytes;

use crate::codec::{self, Decoder};
use crate::error::{ProtocolError, Result};
use crate::property::PropertyList;
use crate::varint;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            15 => Ok(PacketType::Auth),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

impl PacketType {
    /// Wire name, used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Connect => "CONNECT",
            PacketType::Connack => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::Puback => "PUBACK",
            PacketType::Pubrec => "PUBREC",
            PacketType::Pubrel => "PUBREL",
            PacketType::Pubcomp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::Suback => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::Unsuback => "UNSUBACK",
            PacketType::Pingreq => "PINGREQ",
            PacketType::Pingresp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
            PacketType::Auth => "AUTH",
        }
    }

    /// Required fixed-header flags, or `None` when the flags carry data
    /// (PUBLISH).
    fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::Subscribe | PacketType::Unsubscribe | PacketType::Pubrel => Some(0x02),
            _ => Some(0x00),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

/// CONNACK return codes (MQTT 3.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

/// MQTT v5 Reason Codes (used in CONNACK, PUBACK, SUBACK, DISCONNECT, etc.).
/// These are constants rather than enum values since some codes have the same
/// numeric value with different semantic meanings depending on context.
pub mod reason_code {
    pub const SUCCESS: u8 = 0x00;
    pub const NORMAL_DISCONNECTION: u8 = 0x00;
    pub const GRANTED_QOS_0: u8 = 0x00;
    pub const GRANTED_QOS_1: u8 = 0x01;
    pub const GRANTED_QOS_2: u8 = 0x02;
    pub const DISCONNECT_WITH_WILL: u8 = 0x04;
    pub const NO_MATCHING_SUBSCRIBERS: u8 = 0x10;
    pub const NO_SUBSCRIPTION_EXISTED: u8 = 0x11;
    pub const CONTINUE_AUTHENTICATION: u8 = 0x18;
    pub const RE_AUTHENTICATE: u8 = 0x19;
    pub const UNSPECIFIED_ERROR: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const IMPLEMENTATION_SPECIFIC_ERROR: u8 = 0x83;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u8 = 0x84;
    pub const CLIENT_IDENTIFIER_NOT_VALID: u8 = 0x85;
    pub const BAD_USER_NAME_OR_PASSWORD: u8 = 0x86;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const SERVER_UNAVAILABLE: u8 = 0x88;
    pub const SERVER_BUSY: u8 = 0x89;
    pub const BANNED: u8 = 0x8A;
    pub const SERVER_SHUTTING_DOWN: u8 = 0x8B;
    pub const BAD_AUTHENTICATION_METHOD: u8 = 0x8C;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const SESSION_TAKEN_OVER: u8 = 0x8E;
    pub const TOPIC_FILTER_INVALID: u8 = 0x8F;
    pub const TOPIC_NAME_INVALID: u8 = 0x90;
    pub const PACKET_IDENTIFIER_IN_USE: u8 = 0x91;
    pub const PACKET_IDENTIFIER_NOT_FOUND: u8 = 0x92;
    pub const RECEIVE_MAXIMUM_EXCEEDED: u8 = 0x93;
    pub const TOPIC_ALIAS_INVALID: u8 = 0x94;
    pub const PACKET_TOO_LARGE: u8 = 0x95;
    pub const MESSAGE_RATE_TOO_HIGH: u8 = 0x96;
    pub const QUOTA_EXCEEDED: u8 = 0x97;
    pub const ADMINISTRATIVE_ACTION: u8 = 0x98;
    pub const PAYLOAD_FORMAT_INVALID: u8 = 0x99;
    pub const RETAIN_NOT_SUPPORTED: u8 = 0x9A;
    pub const QOS_NOT_SUPPORTED: u8 = 0x9B;
    pub const USE_ANOTHER_SERVER: u8 = 0x9C;
    pub const SERVER_MOVED: u8 = 0x9D;
    pub const SHARED_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0x9E;
    pub const CONNECTION_RATE_EXCEEDED: u8 = 0x9F;
    pub const MAXIMUM_CONNECT_TIME: u8 = 0xA0;
    pub const SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED: u8 = 0xA1;
    pub const WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0xA2;

    /// Whether `code` appears in the published 5.0 reason-code table.
    pub fn is_valid(code: u8) -> bool {
        matches!(code, 0x00 | 0x01 | 0x02 | 0x04 | 0x10 | 0x11 | 0x18 | 0x19)
            || (0x80..=0xA2).contains(&code)
    }
}

/// Maximum topics in one SUBSCRIBE/UNSUBSCRIBE packet.
pub const MAX_TOPICS: usize = 12;

/// Fixed packet header: type/flags byte plus the variable-length
/// remaining-length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_len: usize,
}

impl FixedHeader {
    /// Decode a fixed header from the start of `buf`.
    ///
    /// Returns `Ok(Some((header, header_len)))` once the type byte and the
    /// full remaining-length field are buffered, `Ok(None)` until then.
    /// Reserved flag patterns are validated here.
    pub fn decode(buf: &[u8]) -> Result<Option<(FixedHeader, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let packet_type = PacketType::try_from(buf[0] >> 4)?;
        let flags = buf[0] & 0x0F;

        if let Some(required) = packet_type.required_flags() {
            if flags != required {
                return Err(ProtocolError::MalformedPacket(format!(
                    "{} fixed header flags must be {:#04x}, got {:#04x}",
                    packet_type.name(),
                    required,
                    flags
                )));
            }
        }

        let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
            return Ok(None);
        };

        Ok(Some((
            FixedHeader {
                packet_type,
                flags,
                remaining_len: remaining_len as usize,
            },
            1 + len_bytes,
        )))
    }

    /// Append a fixed header for `body_len` bytes of variable header and
    /// payload.
    pub fn encode(packet_type: PacketType, flags: u8, body_len: usize, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(((packet_type as u8) << 4) | (flags & 0x0F));
        if body_len > varint::VARINT_MAX as usize {
            return Err(ProtocolError::PacketTooLarge {
                size: body_len,
                max: varint::VARINT_MAX as usize,
            });
        }
        varint::encode(body_len as u32, buf)?;
        Ok(())
    }
}

/// Append a complete packet: fixed header for `body`, then `body` itself.
fn finish_packet(packet_type: PacketType, flags: u8, body: &[u8], buf: &mut Vec<u8>) -> Result<()> {
    FixedHeader::encode(packet_type, flags, body.len(), buf)?;
    buf.extend_from_slice(body);
    Ok(())
}

/// Encode an optional property list, or the mandatory zero length marker.
fn write_properties(
    properties: Option<&PropertyList>,
    packet: PacketType,
    buf: &mut Vec<u8>,
) -> Result<()> {
    match properties {
        Some(props) => {
            props.validate_for(packet)?;
            props.encode(buf)
        }
        None => {
            buf.push(0);
            Ok(())
        }
    }
}

fn reject_properties_below_v5(properties: Option<&PropertyList>, version: u8) -> Result<()> {
    if version != 5 && properties.is_some() {
        return Err(ProtocolError::BadArg(
            "properties require protocol version 5",
        ));
    }
    Ok(())
}

/// Will message configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    /// MQTT v5 will properties (None for v3.1.1)
    pub properties: Option<PropertyList>,
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    /// Protocol level: 4 = MQTT 3.1.1, 5 = MQTT 5.0
    pub protocol_version: u8,
    pub clean_session: bool,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    /// MQTT v5 properties (None for v3.1.1)
    pub properties: Option<PropertyList>,
}

/// CONNACK packet data.
///
/// `code` is a 3.1.1 return code (0-5) or a 5.0 reason code depending on the
/// session's protocol version.
#[derive(Debug, Clone, PartialEq)]
pub struct Connack {
    pub session_present: bool,
    pub code: u8,
    pub properties: Option<PropertyList>,
}

impl Connack {
    pub fn is_accepted(&self) -> bool {
        self.code == 0
    }
}

/// PUBLISH packet data. The packet id is present only when QoS > 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: Option<PropertyList>,
}

/// Shared shape of PUBACK, PUBREC, PUBREL and PUBCOMP.
#[derive(Debug, Clone, PartialEq)]
pub struct PubResp {
    pub packet_id: u16,
    pub reason_code: u8,
    pub properties: Option<PropertyList>,
}

impl PubResp {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: reason_code::SUCCESS,
            properties: None,
        }
    }
}

/// MQTT v5 subscription options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl SubscriptionOptions {
    /// Parse from a SUBSCRIBE options byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        let qos = QoS::try_from(byte & 0x03)?;
        let no_local = (byte & 0x04) != 0;
        let retain_as_published = (byte & 0x08) != 0;
        let retain_handling = (byte >> 4) & 0x03;
        Ok(Self {
            qos,
            no_local,
            retain_as_published,
            retain_handling,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.qos as u8)
            | if self.no_local { 0x04 } else { 0 }
            | if self.retain_as_published { 0x08 } else { 0 }
            | (self.retain_handling << 4)
    }
}

/// A topic filter with its requested options.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub filter: String,
    pub options: SubscriptionOptions,
    /// MQTT v5 topic alias bookkeeping slot; not transmitted in SUBSCRIBE.
    pub alias: Option<u16>,
}

impl Topic {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            options: SubscriptionOptions {
                qos,
                ..Default::default()
            },
            alias: None,
        }
    }
}

/// SUBSCRIBE packet data: a bounded, ordered topic sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<Topic>,
    pub properties: Option<PropertyList>,
}

/// SUBACK packet data: exactly one return code per requested topic, in
/// request order.
#[derive(Debug, Clone, PartialEq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
    pub properties: Option<PropertyList>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
    pub properties: Option<PropertyList>,
}

/// UNSUBACK packet data. Reason codes are v5 only; a 3.1.1 UNSUBACK carries
/// none.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsuback {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
    pub properties: Option<PropertyList>,
}

/// DISCONNECT packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    pub reason_code: u8,
    pub properties: Option<PropertyList>,
}

impl Default for Disconnect {
    fn default() -> Self {
        Self {
            reason_code: reason_code::NORMAL_DISCONNECTION,
            properties: None,
        }
    }
}

/// AUTH packet data (MQTT 5.0).
#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    pub reason_code: u8,
    pub properties: Option<PropertyList>,
}

/// MQTT packets, one case per control packet type.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(PubResp),
    Pubrec(PubResp),
    Pubrel(PubResp),
    Pubcomp(PubResp),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(Unsuback),
    Pingreq,
    Pingresp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback(_) => PacketType::Puback,
            Packet::Pubrec(_) => PacketType::Pubrec,
            Packet::Pubrel(_) => PacketType::Pubrel,
            Packet::Pubcomp(_) => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback(_) => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Auth(_) => PacketType::Auth,
        }
    }

    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::Puback(r) | Packet::Pubrec(r) | Packet::Pubrel(r) | Packet::Pubcomp(r) => {
                Some(r.packet_id)
            }
            Packet::Subscribe(s) => Some(s.packet_id),
            Packet::Suback(s) => Some(s.packet_id),
            Packet::Unsubscribe(u) => Some(u.packet_id),
            Packet::Unsuback(u) => Some(u.packet_id),
            _ => None,
        }
    }
}

// === Encoders ===

/// Encode a CONNECT packet. The protocol version comes from the struct.
pub fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) -> Result<()> {
    let version = connect.protocol_version;
    if version != 4 && version != 5 {
        return Err(ProtocolError::UnsupportedProtocolVersion(version));
    }
    reject_properties_below_v5(connect.properties.as_ref(), version)?;
    if version != 5 && connect.username.is_none() && connect.password.is_some() {
        return Err(ProtocolError::BadArg(
            "password requires username before protocol version 5",
        ));
    }

    let mut body = Vec::new();

    // Protocol name and level
    codec::write_string(&mut body, "MQTT")?;
    body.push(version);

    // Connect flags
    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);

    // Keep alive
    codec::write_u16(&mut body, connect.keep_alive);

    if version == 5 {
        write_properties(connect.properties.as_ref(), PacketType::Connect, &mut body)?;
    }

    codec::write_string(&mut body, &connect.client_id)?;

    if let Some(ref will) = connect.will {
        if version == 5 {
            match will.properties.as_ref() {
                Some(props) => {
                    props.validate_for_will()?;
                    props.encode(&mut body)?;
                }
                None => body.push(0),
            }
        } else if will.properties.is_some() {
            return Err(ProtocolError::BadArg(
                "properties require protocol version 5",
            ));
        }
        codec::write_string(&mut body, &will.topic)?;
        codec::write_binary(&mut body, &will.message)?;
    }

    if let Some(ref username) = connect.username {
        codec::write_string(&mut body, username)?;
    }
    if let Some(ref password) = connect.password {
        codec::write_binary(&mut body, password)?;
    }

    finish_packet(PacketType::Connect, 0, &body, buf)
}

/// Encode a CONNACK packet.
pub fn encode_connack(connack: &Connack, version: u8, buf: &mut Vec<u8>) -> Result<()> {
    reject_properties_below_v5(connack.properties.as_ref(), version)?;
    let mut body = Vec::new();
    body.push(if connack.session_present { 1 } else { 0 });
    body.push(connack.code);
    if version == 5 {
        write_properties(connack.properties.as_ref(), PacketType::Connack, &mut body)?;
    }
    finish_packet(PacketType::Connack, 0, &body, buf)
}

/// Encode a PUBLISH packet.
pub fn encode_publish(publish: &Publish, version: u8, buf: &mut Vec<u8>) -> Result<()> {
    reject_properties_below_v5(publish.properties.as_ref(), version)?;
    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, Some(_)) => {
            return Err(ProtocolError::BadArg("QoS 0 publish must not carry a packet id"))
        }
        (QoS::AtLeastOnce | QoS::ExactlyOnce, None | Some(0)) => {
            return Err(ProtocolError::BadArg(
                "QoS > 0 publish requires a non-zero packet id",
            ))
        }
        _ => {}
    }

    let mut flags = 0u8;
    if publish.dup {
        flags |= 0x08;
    }
    flags |= (publish.qos as u8) << 1;
    if publish.retain {
        flags |= 0x01;
    }

    let mut body = Vec::new();
    codec::write_string(&mut body, &publish.topic)?;
    if let Some(id) = publish.packet_id {
        codec::write_u16(&mut body, id);
    }
    if version == 5 {
        write_properties(publish.properties.as_ref(), PacketType::Publish, &mut body)?;
    }
    body.extend_from_slice(&publish.payload);

    finish_packet(PacketType::Publish, flags, &body, buf)
}

/// Encode a PUBACK/PUBREC/PUBREL/PUBCOMP packet.
///
/// For v5 a success code with no properties collapses to the 2-byte form.
pub fn encode_pub_resp(
    packet_type: PacketType,
    resp: &PubResp,
    version: u8,
    buf: &mut Vec<u8>,
) -> Result<()> {
    if !matches!(
        packet_type,
        PacketType::Puback | PacketType::Pubrec | PacketType::Pubrel | PacketType::Pubcomp
    ) {
        return Err(ProtocolError::BadArg("not a publish response type"));
    }
    if resp.packet_id == 0 {
        return Err(ProtocolError::BadArg("packet id must be non-zero"));
    }
    reject_properties_below_v5(resp.properties.as_ref(), version)?;

    let flags = if packet_type == PacketType::Pubrel { 0x02 } else { 0 };
    let mut body = Vec::new();
    codec::write_u16(&mut body, resp.packet_id);

    let has_props = resp.properties.as_ref().is_some_and(|p| !p.is_empty());
    if version == 5 && (resp.reason_code != reason_code::SUCCESS || has_props) {
        if !reason_code::is_valid(resp.reason_code) {
            return Err(ProtocolError::InvalidReasonCode(resp.reason_code));
        }
        body.push(resp.reason_code);
        write_properties(resp.properties.as_ref(), packet_type, &mut body)?;
    }

    finish_packet(packet_type, flags, &body, buf)
}

/// Encode a SUBSCRIBE packet with its bounded, ordered topic sequence.
pub fn encode_subscribe(subscribe: &Subscribe, version: u8, buf: &mut Vec<u8>) -> Result<()> {
    check_topic_count(subscribe.topics.len())?;
    if subscribe.packet_id == 0 {
        return Err(ProtocolError::BadArg("packet id must be non-zero"));
    }
    reject_properties_below_v5(subscribe.properties.as_ref(), version)?;

    let mut body = Vec::new();
    codec::write_u16(&mut body, subscribe.packet_id);
    if version == 5 {
        write_properties(subscribe.properties.as_ref(), PacketType::Subscribe, &mut body)?;
    }
    for topic in &subscribe.topics {
        check_topic_filter(&topic.filter)?;
        codec::write_string(&mut body, &topic.filter)?;
        body.push(topic.options.to_byte());
    }

    finish_packet(PacketType::Subscribe, 0x02, &body, buf)
}

/// Encode a SUBACK packet.
pub fn encode_suback(suback: &Suback, version: u8, buf: &mut Vec<u8>) -> Result<()> {
    if suback.return_codes.is_empty() {
        return Err(ProtocolError::BadArg("SUBACK requires at least one return code"));
    }
    reject_properties_below_v5(suback.properties.as_ref(), version)?;

    let mut body = Vec::new();
    codec::write_u16(&mut body, suback.packet_id);
    if version == 5 {
        write_properties(suback.properties.as_ref(), PacketType::Suback, &mut body)?;
    }
    body.extend_from_slice(&suback.return_codes);

    finish_packet(PacketType::Suback, 0, &body, buf)
}

/// Encode an UNSUBSCRIBE packet.
pub fn encode_unsubscribe(unsubscribe: &Unsubscribe, version: u8, buf: &mut Vec<u8>) -> Result<()> {
    check_topic_count(unsubscribe.topics.len())?;
    if unsubscribe.packet_id == 0 {
        return Err(ProtocolError::BadArg("packet id must be non-zero"));
    }
    reject_properties_below_v5(unsubscribe.properties.as_ref(), version)?;

    let mut body = Vec::new();
    codec::write_u16(&mut body, unsubscribe.packet_id);
    if version == 5 {
        write_properties(
            unsubscribe.properties.as_ref(),
            PacketType::Unsubscribe,
            &mut body,
        )?;
    }
    for topic in &unsubscribe.topics {
        check_topic_filter(topic)?;
        codec::write_string(&mut body, topic)?;
    }

    finish_packet(PacketType::Unsubscribe, 0x02, &body, buf)
}

/// Encode an UNSUBACK packet.
pub fn encode_unsuback(unsuback: &Unsuback, version: u8, buf: &mut Vec<u8>) -> Result<()> {
    reject_properties_below_v5(unsuback.properties.as_ref(), version)?;
    let mut body = Vec::new();
    codec::write_u16(&mut body, unsuback.packet_id);
    if version == 5 {
        write_properties(unsuback.properties.as_ref(), PacketType::Unsuback, &mut body)?;
        body.extend_from_slice(&unsuback.reason_codes);
    }
    finish_packet(PacketType::Unsuback, 0, &body, buf)
}

/// Encode a PINGREQ packet.
pub fn encode_pingreq(buf: &mut Vec<u8>) {
    buf.push((PacketType::Pingreq as u8) << 4);
    buf.push(0);
}

/// Encode a PINGRESP packet.
pub fn encode_pingresp(buf: &mut Vec<u8>) {
    buf.push((PacketType::Pingresp as u8) << 4);
    buf.push(0);
}

/// Encode a DISCONNECT packet.
pub fn encode_disconnect(disconnect: &Disconnect, version: u8, buf: &mut Vec<u8>) -> Result<()> {
    reject_properties_below_v5(disconnect.properties.as_ref(), version)?;
    let has_props = disconnect.properties.as_ref().is_some_and(|p| !p.is_empty());
    let mut body = Vec::new();
    if version == 5 && (disconnect.reason_code != reason_code::NORMAL_DISCONNECTION || has_props) {
        if !reason_code::is_valid(disconnect.reason_code) {
            return Err(ProtocolError::InvalidReasonCode(disconnect.reason_code));
        }
        body.push(disconnect.reason_code);
        write_properties(
            disconnect.properties.as_ref(),
            PacketType::Disconnect,
            &mut body,
        )?;
    }
    finish_packet(PacketType::Disconnect, 0, &body, buf)
}

/// Encode an AUTH packet (MQTT 5.0 only).
pub fn encode_auth(auth: &Auth, version: u8, buf: &mut Vec<u8>) -> Result<()> {
    if version != 5 {
        return Err(ProtocolError::BadArg("AUTH requires protocol version 5"));
    }
    check_auth_reason(auth.reason_code)?;
    let has_props = auth.properties.as_ref().is_some_and(|p| !p.is_empty());
    let mut body = Vec::new();
    if auth.reason_code != reason_code::SUCCESS || has_props {
        body.push(auth.reason_code);
        write_properties(auth.properties.as_ref(), PacketType::Auth, &mut body)?;
    }
    finish_packet(PacketType::Auth, 0, &body, buf)
}

/// Encode any packet through one entry point.
pub fn encode_packet(packet: &Packet, version: u8, buf: &mut Vec<u8>) -> Result<()> {
    match packet {
        Packet::Connect(c) => encode_connect(c, buf),
        Packet::Connack(c) => encode_connack(c, version, buf),
        Packet::Publish(p) => encode_publish(p, version, buf),
        Packet::Puback(r) => encode_pub_resp(PacketType::Puback, r, version, buf),
        Packet::Pubrec(r) => encode_pub_resp(PacketType::Pubrec, r, version, buf),
        Packet::Pubrel(r) => encode_pub_resp(PacketType::Pubrel, r, version, buf),
        Packet::Pubcomp(r) => encode_pub_resp(PacketType::Pubcomp, r, version, buf),
        Packet::Subscribe(s) => encode_subscribe(s, version, buf),
        Packet::Suback(s) => encode_suback(s, version, buf),
        Packet::Unsubscribe(u) => encode_unsubscribe(u, version, buf),
        Packet::Unsuback(u) => encode_unsuback(u, version, buf),
        Packet::Pingreq => {
            encode_pingreq(buf);
            Ok(())
        }
        Packet::Pingresp => {
            encode_pingresp(buf);
            Ok(())
        }
        Packet::Disconnect(d) => encode_disconnect(d, version, buf),
        Packet::Auth(a) => encode_auth(a, version, buf),
    }
}

fn check_topic_count(count: usize) -> Result<()> {
    if count == 0 {
        return Err(ProtocolError::BadArg("at least one topic required"));
    }
    if count > MAX_TOPICS {
        return Err(ProtocolError::BadArg("too many topics in one packet"));
    }
    Ok(())
}

fn check_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(ProtocolError::BadArg("topic filter must not be empty"));
    }
    if filter.contains('\0') {
        return Err(ProtocolError::BadArg(
            "topic filter must not contain null character",
        ));
    }
    Ok(())
}

fn check_auth_reason(code: u8) -> Result<()> {
    match code {
        reason_code::SUCCESS
        | reason_code::CONTINUE_AUTHENTICATION
        | reason_code::RE_AUTHENTICATE => Ok(()),
        other => Err(ProtocolError::InvalidReasonCode(other)),
    }
}

// === Decoders ===

/// Try to decode a complete packet from the buffer.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` on success, `Ok(None)` if
/// more data is needed, or `Err` on wire-format violations.
/// `version`: 4 = MQTT 3.1.1, 5 = MQTT 5.0.
pub fn decode_packet(buf: &[u8], version: u8) -> Result<Option<(Packet, usize)>> {
    let Some((header, header_len)) = FixedHeader::decode(buf)? else {
        return Ok(None);
    };
    let total = header_len + header.remaining_len;
    if buf.len() < total {
        return Ok(None);
    }
    let body = &buf[header_len..total];

    let packet = match header.packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(body)?),
        PacketType::Connack => Packet::Connack(decode_connack(body, version)?),
        PacketType::Publish => Packet::Publish(decode_publish(header.flags, body, version)?),
        PacketType::Puback => Packet::Puback(decode_pub_resp(body, version)?),
        PacketType::Pubrec => Packet::Pubrec(decode_pub_resp(body, version)?),
        PacketType::Pubrel => Packet::Pubrel(decode_pub_resp(body, version)?),
        PacketType::Pubcomp => Packet::Pubcomp(decode_pub_resp(body, version)?),
        PacketType::Subscribe => Packet::Subscribe(decode_subscribe(body, version)?),
        PacketType::Suback => Packet::Suback(decode_suback(body, version)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(decode_unsubscribe(body, version)?),
        PacketType::Unsuback => Packet::Unsuback(decode_unsuback(body, version)?),
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => Packet::Disconnect(decode_disconnect(body, version)?),
        PacketType::Auth => {
            if version != 5 {
                return Err(ProtocolError::ProtocolViolation(
                    "AUTH requires protocol version 5".into(),
                ));
            }
            Packet::Auth(decode_auth(body)?)
        }
    };

    Ok(Some((packet, total)))
}

fn decode_connect(body: &[u8]) -> Result<Connect> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    if protocol_name != "MQTT" {
        return Err(ProtocolError::MalformedPacket(format!(
            "Invalid protocol name: {}",
            protocol_name
        )));
    }

    let protocol_version = dec.read_u8()?;
    if protocol_version != 4 && protocol_version != 5 {
        return Err(ProtocolError::UnsupportedProtocolVersion(protocol_version));
    }
    let is_v5 = protocol_version == 5;

    let flags = dec.read_u8()?;
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::MalformedPacket(
            "CONNECT reserved flag must be 0".into(),
        ));
    }
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::MalformedPacket(
            "will qos/retain require the will flag".into(),
        ));
    }
    if !is_v5 && !username_flag && password_flag {
        return Err(ProtocolError::MalformedPacket(
            "password flag requires username flag before protocol version 5".into(),
        ));
    }

    let keep_alive = dec.read_u16()?;

    let properties = if is_v5 {
        let props = PropertyList::decode(&mut dec)?;
        props.validate_for(PacketType::Connect)?;
        if props.is_empty() { None } else { Some(props) }
    } else {
        None
    };

    let client_id = dec.read_string()?;

    let will = if will_flag {
        let will_properties = if is_v5 {
            let props = PropertyList::decode(&mut dec)?;
            props.validate_for_will()?;
            if props.is_empty() { None } else { Some(props) }
        } else {
            None
        };
        let topic = dec.read_string()?;
        let message = dec.read_binary()?;
        Some(Will {
            topic,
            message,
            qos: will_qos,
            retain: will_retain,
            properties: will_properties,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Connect {
        protocol_version,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
        properties,
    })
}

fn decode_connack(body: &[u8], version: u8) -> Result<Connack> {
    let mut dec = Decoder::new(body);

    let ack_flags = dec.read_u8()?;
    if (ack_flags & 0xFE) != 0 {
        return Err(ProtocolError::MalformedPacket(
            "CONNACK flags bits 1-7 must be 0".into(),
        ));
    }
    let session_present = (ack_flags & 0x01) != 0;
    let code = dec.read_u8()?;

    let properties = if version == 5 {
        if !reason_code::is_valid(code) {
            return Err(ProtocolError::InvalidReasonCode(code));
        }
        if dec.remaining() > 0 {
            let props = PropertyList::decode(&mut dec)?;
            props.validate_for(PacketType::Connack)?;
            if props.is_empty() {
                None
            } else {
                Some(props)
            }
        } else {
            None
        }
    } else {
        if code > ConnackCode::NotAuthorized as u8 {
            return Err(ProtocolError::InvalidReasonCode(code));
        }
        None
    };

    Ok(Connack {
        session_present,
        code,
        properties,
    })
}

/// Decode the variable header of a PUBLISH packet from a possibly partial
/// body.
///
/// `remaining_len` is the packet's declared remaining length; `body` holds
/// however much of it is buffered so far. Returns `Ok(None)` while the
/// variable header is incomplete. On success the returned `Publish` carries
/// an empty payload and the second tuple element is the variable-header
/// length; the payload occupies the rest of the remaining length and may be
/// consumed in chunks.
pub fn decode_publish_header(
    flags: u8,
    body: &[u8],
    remaining_len: usize,
    version: u8,
) -> Result<Option<(Publish, usize)>> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(body);
    let parsed = parse_publish_variable_header(&mut dec, qos, version);
    match parsed {
        Ok((topic, packet_id, properties)) => {
            let header_len = dec.pos();
            if header_len > remaining_len {
                return Err(ProtocolError::MalformedPacket(
                    "PUBLISH variable header exceeds remaining length".into(),
                ));
            }
            Ok(Some((
                Publish {
                    dup,
                    qos,
                    retain,
                    topic,
                    packet_id,
                    payload: Bytes::new(),
                    properties,
                },
                header_len,
            )))
        }
        // The header may simply not be fully buffered yet
        Err(ProtocolError::IncompletePacket { .. }) if body.len() < remaining_len => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_publish_variable_header(
    dec: &mut Decoder<'_>,
    qos: QoS,
    version: u8,
) -> Result<(String, Option<u16>, Option<PropertyList>)> {
    let topic = dec.read_string()?;
    let packet_id = if qos != QoS::AtMostOnce {
        let id = dec.read_u16()?;
        if id == 0 {
            return Err(ProtocolError::MalformedPacket(
                "packet id must be non-zero".into(),
            ));
        }
        Some(id)
    } else {
        None
    };
    let properties = if version == 5 {
        let props = PropertyList::decode(dec)?;
        props.validate_for(PacketType::Publish)?;
        if props.is_empty() {
            None
        } else {
            Some(props)
        }
    } else {
        None
    };
    Ok((topic, packet_id, properties))
}

fn decode_publish(flags: u8, body: &[u8], version: u8) -> Result<Publish> {
    match decode_publish_header(flags, body, body.len(), version)? {
        Some((mut publish, header_len)) => {
            publish.payload = Bytes::copy_from_slice(&body[header_len..]);
            Ok(publish)
        }
        // decode_publish_header never returns None when body holds the whole
        // remaining length
        None => Err(ProtocolError::MalformedPacket(
            "truncated PUBLISH variable header".into(),
        )),
    }
}

fn decode_pub_resp(body: &[u8], version: u8) -> Result<PubResp> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;
    if packet_id == 0 {
        return Err(ProtocolError::MalformedPacket(
            "packet id must be non-zero".into(),
        ));
    }

    let mut resp = PubResp::new(packet_id);
    if version == 5 && dec.remaining() > 0 {
        let code = dec.read_u8()?;
        if !reason_code::is_valid(code) {
            return Err(ProtocolError::InvalidReasonCode(code));
        }
        resp.reason_code = code;
        if dec.remaining() > 0 {
            let props = PropertyList::decode(&mut dec)?;
            resp.properties = if props.is_empty() { None } else { Some(props) };
        }
    }
    Ok(resp)
}

fn decode_subscribe(body: &[u8], version: u8) -> Result<Subscribe> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let properties = if version == 5 {
        let props = PropertyList::decode(&mut dec)?;
        props.validate_for(PacketType::Subscribe)?;
        if props.is_empty() {
            None
        } else {
            Some(props)
        }
    } else {
        None
    };

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "topic filter must not be empty".into(),
            ));
        }
        let options = SubscriptionOptions::from_byte(dec.read_u8()?)?;
        topics.push(Topic {
            filter,
            options,
            alias: None,
        });
    }
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBSCRIBE with no topics".into(),
        ));
    }

    Ok(Subscribe {
        packet_id,
        topics,
        properties,
    })
}

fn decode_suback(body: &[u8], version: u8) -> Result<Suback> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let properties = if version == 5 {
        let props = PropertyList::decode(&mut dec)?;
        props.validate_for(PacketType::Suback)?;
        if props.is_empty() {
            None
        } else {
            Some(props)
        }
    } else {
        None
    };

    let return_codes = dec.read_bytes(dec.remaining())?.to_vec();
    if return_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBACK with no return codes".into(),
        ));
    }
    for &code in &return_codes {
        if !reason_code::is_valid(code) {
            return Err(ProtocolError::InvalidReasonCode(code));
        }
    }

    Ok(Suback {
        packet_id,
        return_codes,
        properties,
    })
}

fn decode_unsubscribe(body: &[u8], version: u8) -> Result<Unsubscribe> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let properties = if version == 5 {
        let props = PropertyList::decode(&mut dec)?;
        props.validate_for(PacketType::Unsubscribe)?;
        if props.is_empty() {
            None
        } else {
            Some(props)
        }
    } else {
        None
    };

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "topic filter must not be empty".into(),
            ));
        }
        topics.push(filter);
    }
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBSCRIBE with no topics".into(),
        ));
    }

    Ok(Unsubscribe {
        packet_id,
        topics,
        properties,
    })
}

fn decode_unsuback(body: &[u8], version: u8) -> Result<Unsuback> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let (properties, reason_codes) = if version == 5 {
        let props = PropertyList::decode(&mut dec)?;
        props.validate_for(PacketType::Unsuback)?;
        let codes = dec.read_bytes(dec.remaining())?.to_vec();
        for &code in &codes {
            if !reason_code::is_valid(code) {
                return Err(ProtocolError::InvalidReasonCode(code));
            }
        }
        (if props.is_empty() { None } else { Some(props) }, codes)
    } else {
        (None, Vec::new())
    };

    Ok(Unsuback {
        packet_id,
        reason_codes,
        properties,
    })
}

fn decode_disconnect(body: &[u8], version: u8) -> Result<Disconnect> {
    if version != 5 || body.is_empty() {
        return Ok(Disconnect::default());
    }

    let mut dec = Decoder::new(body);
    let reason_code = dec.read_u8()?;
    if !reason_code::is_valid(reason_code) {
        return Err(ProtocolError::InvalidReasonCode(reason_code));
    }
    let properties = if dec.remaining() > 0 {
        let props = PropertyList::decode(&mut dec)?;
        props.validate_for(PacketType::Disconnect)?;
        if props.is_empty() {
            None
        } else {
            Some(props)
        }
    } else {
        None
    };

    Ok(Disconnect {
        reason_code,
        properties,
    })
}

fn decode_auth(body: &[u8]) -> Result<Auth> {
    if body.is_empty() {
        return Ok(Auth {
            reason_code: reason_code::SUCCESS,
            properties: None,
        });
    }

    let mut dec = Decoder::new(body);
    let code = dec.read_u8()?;
    check_auth_reason(code)?;
    let properties = if dec.remaining() > 0 {
        let props = PropertyList::decode(&mut dec)?;
        props.validate_for(PacketType::Auth)?;
        if props.is_empty() {
            None
        } else {
            Some(props)
        }
    } else {
        None
    };

    Ok(Auth {
        reason_code: code,
        properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{PropertyType, PropertyValue};

    fn roundtrip(packet: Packet, version: u8) -> Packet {
        let mut buf = Vec::new();
        encode_packet(&packet, version, &mut buf).unwrap();
        let (decoded, consumed) = decode_packet(&buf, version).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        decoded
    }

    #[test]
    fn test_connect_v4_wire_bytes() {
        let connect = Connect {
            protocol_version: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: "c1".into(),
            will: None,
            username: None,
            password: None,
            properties: None,
        };
        let mut buf = Vec::new();
        encode_connect(&connect, &mut buf).unwrap();
        assert_eq!(
            buf,
            vec![
                0x10, 14, // CONNECT, remaining length
                0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
                0x04, // protocol level
                0x02, // clean session
                0x00, 0x3C, // keep alive
                0x00, 0x02, b'c', b'1', // client id
            ]
        );
    }

    #[test]
    fn test_connect_roundtrip_v5_full() {
        let mut props = PropertyList::new();
        props
            .push(
                PropertyType::SessionExpiryInterval,
                PropertyValue::FourByteInt(120),
            )
            .unwrap();
        let mut will_props = PropertyList::new();
        will_props
            .push(
                PropertyType::WillDelayInterval,
                PropertyValue::FourByteInt(5),
            )
            .unwrap();
        let connect = Connect {
            protocol_version: 5,
            clean_session: false,
            keep_alive: 30,
            client_id: "dev-7".into(),
            will: Some(Will {
                topic: "status/dev-7".into(),
                message: b"offline".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: true,
                properties: Some(will_props),
            }),
            username: Some("user".into()),
            password: Some(b"secret".to_vec()),
            properties: Some(props),
        };
        let decoded = roundtrip(Packet::Connect(connect.clone()), 5);
        assert_eq!(decoded, Packet::Connect(connect));
    }

    #[test]
    fn test_connect_v4_password_without_username() {
        let connect = Connect {
            protocol_version: 4,
            clean_session: true,
            keep_alive: 0,
            client_id: "c".into(),
            will: None,
            username: None,
            password: Some(b"p".to_vec()),
            properties: None,
        };
        let mut buf = Vec::new();
        assert!(encode_connect(&connect, &mut buf).is_err());
    }

    #[test]
    fn test_connack_v4() {
        let connack = Connack {
            session_present: true,
            code: ConnackCode::Accepted as u8,
            properties: None,
        };
        let decoded = roundtrip(Packet::Connack(connack.clone()), 4);
        assert_eq!(decoded, Packet::Connack(connack));

        // Refused code out of the 3.1.1 table
        let buf = [0x20, 0x02, 0x00, 0x06];
        assert!(decode_packet(&buf, 4).is_err());
    }

    #[test]
    fn test_connack_v5_with_properties() {
        let mut props = PropertyList::new();
        props
            .push(PropertyType::ServerKeepAlive, PropertyValue::TwoByteInt(45))
            .unwrap();
        props
            .push(PropertyType::ReceiveMaximum, PropertyValue::TwoByteInt(20))
            .unwrap();
        let connack = Connack {
            session_present: false,
            code: reason_code::SUCCESS,
            properties: Some(props),
        };
        let decoded = roundtrip(Packet::Connack(connack.clone()), 5);
        assert_eq!(decoded, Packet::Connack(connack));
    }

    #[test]
    fn test_publish_qos0_roundtrip() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: "a/b".into(),
            packet_id: None,
            payload: Bytes::from_static(b"hello"),
            properties: None,
        };
        let decoded = roundtrip(Packet::Publish(publish.clone()), 4);
        assert_eq!(decoded, Packet::Publish(publish));
    }

    #[test]
    fn test_publish_qos2_v5_roundtrip() {
        let mut props = PropertyList::new();
        props
            .push(PropertyType::TopicAlias, PropertyValue::TwoByteInt(3))
            .unwrap();
        props.push_user_property("k", "v");
        let publish = Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "sensors/+/temp".into(),
            packet_id: Some(777),
            payload: Bytes::from_static(&[1, 2, 3, 4]),
            properties: Some(props),
        };
        let decoded = roundtrip(Packet::Publish(publish.clone()), 5);
        assert_eq!(decoded, Packet::Publish(publish));
    }

    #[test]
    fn test_publish_flags_encoding() {
        let publish = Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "t".into(),
            packet_id: Some(1),
            payload: Bytes::new(),
            properties: None,
        };
        let mut buf = Vec::new();
        encode_publish(&publish, 4, &mut buf).unwrap();
        // DUP (bit 3) | QoS 1 (bits 1-2) | RETAIN (bit 0)
        assert_eq!(buf[0], 0x30 | 0x08 | 0x02 | 0x01);
    }

    #[test]
    fn test_publish_qos_without_id_rejected() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "t".into(),
            packet_id: None,
            payload: Bytes::new(),
            properties: None,
        };
        let mut buf = Vec::new();
        assert!(encode_publish(&publish, 4, &mut buf).is_err());
    }

    #[test]
    fn test_publish_invalid_qos3() {
        // Flags 0x06 = QoS 3
        let buf = [0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
        assert!(decode_packet(&buf, 4).is_err());
    }

    #[test]
    fn test_publish_header_partial_then_complete() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "chunky/topic".into(),
            packet_id: Some(9),
            payload: Bytes::from(vec![0xAB; 100]),
            properties: None,
        };
        let mut buf = Vec::new();
        encode_publish(&publish, 4, &mut buf).unwrap();
        let (header, header_len) = FixedHeader::decode(&buf).unwrap().unwrap();
        let body = &buf[header_len..];

        // Only 4 bytes of the variable header buffered: incomplete
        assert!(decode_publish_header(header.flags, &body[..4], header.remaining_len, 4)
            .unwrap()
            .is_none());

        // Full variable header buffered: payload length is implicit
        let (decoded, var_len) =
            decode_publish_header(header.flags, body, header.remaining_len, 4)
                .unwrap()
                .unwrap();
        assert_eq!(decoded.topic, "chunky/topic");
        assert_eq!(decoded.packet_id, Some(9));
        assert_eq!(header.remaining_len - var_len, 100);
    }

    #[test]
    fn test_pub_resp_v4_wire_bytes() {
        let mut buf = Vec::new();
        encode_pub_resp(PacketType::Puback, &PubResp::new(5), 4, &mut buf).unwrap();
        assert_eq!(buf, vec![0x40, 0x02, 0x00, 0x05]);

        buf.clear();
        encode_pub_resp(PacketType::Pubrel, &PubResp::new(5), 4, &mut buf).unwrap();
        assert_eq!(buf, vec![0x62, 0x02, 0x00, 0x05]);
    }

    #[test]
    fn test_pub_resp_v5_success_collapses() {
        let mut buf = Vec::new();
        encode_pub_resp(PacketType::Pubrec, &PubResp::new(8), 5, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);
        let (decoded, _) = decode_packet(&buf, 5).unwrap().unwrap();
        assert_eq!(decoded, Packet::Pubrec(PubResp::new(8)));
    }

    #[test]
    fn test_pub_resp_v5_with_reason() {
        let resp = PubResp {
            packet_id: 3,
            reason_code: reason_code::NO_MATCHING_SUBSCRIBERS,
            properties: None,
        };
        let decoded = roundtrip(Packet::Puback(resp.clone()), 5);
        assert_eq!(decoded, Packet::Puback(resp));
    }

    #[test]
    fn test_pubrel_bad_flags() {
        // PUBREL with flags 0x00 instead of 0x02
        let buf = [0x60, 0x02, 0x00, 0x01];
        assert!(decode_packet(&buf, 4).is_err());
    }

    #[test]
    fn test_subscribe_roundtrip_order() {
        let subscribe = Subscribe {
            packet_id: 11,
            topics: vec![
                Topic::new("a/#", QoS::AtMostOnce),
                Topic::new("b/+", QoS::AtLeastOnce),
                Topic::new("c", QoS::ExactlyOnce),
            ],
            properties: None,
        };
        let decoded = roundtrip(Packet::Subscribe(subscribe.clone()), 4);
        let Packet::Subscribe(decoded) = decoded else {
            panic!("wrong packet type");
        };
        let filters: Vec<_> = decoded.topics.iter().map(|t| t.filter.as_str()).collect();
        assert_eq!(filters, ["a/#", "b/+", "c"]);
    }

    #[test]
    fn test_subscribe_v5_subscription_id() {
        let mut props = PropertyList::new();
        props
            .push(
                PropertyType::SubscriptionIdentifier,
                PropertyValue::VarInt(42),
            )
            .unwrap();
        let subscribe = Subscribe {
            packet_id: 2,
            topics: vec![Topic::new("x", QoS::AtMostOnce)],
            properties: Some(props.clone()),
        };
        let decoded = roundtrip(Packet::Subscribe(subscribe), 5);
        let Packet::Subscribe(decoded) = decoded else {
            panic!("wrong packet type");
        };
        assert_eq!(decoded.properties, Some(props));
    }

    #[test]
    fn test_subscribe_topic_bound() {
        let topics: Vec<_> = (0..MAX_TOPICS + 1)
            .map(|i| Topic::new(format!("t/{}", i), QoS::AtMostOnce))
            .collect();
        let subscribe = Subscribe {
            packet_id: 1,
            topics,
            properties: None,
        };
        let mut buf = Vec::new();
        assert!(encode_subscribe(&subscribe, 4, &mut buf).is_err());
    }

    #[test]
    fn test_suback_one_code_per_topic() {
        let suback = Suback {
            packet_id: 11,
            return_codes: vec![0, 1, 2],
            properties: None,
        };
        let decoded = roundtrip(Packet::Suback(suback.clone()), 4);
        assert_eq!(decoded, Packet::Suback(suback));
    }

    #[test]
    fn test_suback_invalid_code() {
        // Return code 0x42 is in no table
        let buf = [0x90, 0x03, 0x00, 0x01, 0x42];
        assert!(decode_packet(&buf, 4).is_err());
    }

    #[test]
    fn test_unsubscribe_roundtrip() {
        let unsubscribe = Unsubscribe {
            packet_id: 4,
            topics: vec!["a".into(), "b/c".into()],
            properties: None,
        };
        let decoded = roundtrip(Packet::Unsubscribe(unsubscribe.clone()), 4);
        assert_eq!(decoded, Packet::Unsubscribe(unsubscribe));
    }

    #[test]
    fn test_unsuback_v5_reason_codes() {
        let unsuback = Unsuback {
            packet_id: 4,
            reason_codes: vec![
                reason_code::SUCCESS,
                reason_code::NO_SUBSCRIPTION_EXISTED,
            ],
            properties: None,
        };
        let decoded = roundtrip(Packet::Unsuback(unsuback.clone()), 5);
        assert_eq!(decoded, Packet::Unsuback(unsuback));
    }

    #[test]
    fn test_ping_roundtrip() {
        assert_eq!(roundtrip(Packet::Pingreq, 4), Packet::Pingreq);
        assert_eq!(roundtrip(Packet::Pingresp, 4), Packet::Pingresp);
    }

    #[test]
    fn test_disconnect_v4_is_bare() {
        let mut buf = Vec::new();
        encode_disconnect(&Disconnect::default(), 4, &mut buf).unwrap();
        assert_eq!(buf, vec![0xE0, 0x00]);
    }

    #[test]
    fn test_disconnect_v5_reason() {
        let disconnect = Disconnect {
            reason_code: reason_code::DISCONNECT_WITH_WILL,
            properties: None,
        };
        let decoded = roundtrip(Packet::Disconnect(disconnect.clone()), 5);
        assert_eq!(decoded, Packet::Disconnect(disconnect));
    }

    #[test]
    fn test_auth_roundtrip() {
        let mut props = PropertyList::new();
        props
            .push(
                PropertyType::AuthenticationMethod,
                PropertyValue::Utf8String("SCRAM-SHA-1".into()),
            )
            .unwrap();
        let auth = Auth {
            reason_code: reason_code::CONTINUE_AUTHENTICATION,
            properties: Some(props),
        };
        let decoded = roundtrip(Packet::Auth(auth.clone()), 5);
        assert_eq!(decoded, Packet::Auth(auth));
    }

    #[test]
    fn test_auth_rejects_other_reasons() {
        let auth = Auth {
            reason_code: reason_code::NOT_AUTHORIZED,
            properties: None,
        };
        let mut buf = Vec::new();
        assert!(encode_auth(&auth, 5, &mut buf).is_err());
    }

    #[test]
    fn test_decode_incomplete_returns_none() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".into(),
            packet_id: None,
            payload: Bytes::from_static(b"abcdef"),
            properties: None,
        };
        let mut buf = Vec::new();
        encode_publish(&publish, 4, &mut buf).unwrap();

        for cut in 0..buf.len() {
            assert!(decode_packet(&buf[..cut], 4).unwrap().is_none());
        }
        assert!(decode_packet(&buf, 4).unwrap().is_some());
    }

    #[test]
    fn test_properties_rejected_below_v5() {
        let mut props = PropertyList::new();
        props.push_user_property("k", "v");
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".into(),
            packet_id: None,
            payload: Bytes::new(),
            properties: Some(props),
        };
        let mut buf = Vec::new();
        assert!(encode_publish(&publish, 4, &mut buf).is_err());
    }

    #[test]
    fn test_property_whitelist_enforced_by_codec() {
        // TopicAlias is a PUBLISH property, not a SUBSCRIBE property
        let mut props = PropertyList::new();
        props
            .push(PropertyType::TopicAlias, PropertyValue::TwoByteInt(1))
            .unwrap();
        let subscribe = Subscribe {
            packet_id: 1,
            topics: vec![Topic::new("t", QoS::AtMostOnce)],
            properties: Some(props),
        };
        let mut buf = Vec::new();
        assert!(encode_subscribe(&subscribe, 5, &mut buf).is_err());
    }
}
