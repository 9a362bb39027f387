//! MQTT v5 property list codec.
//!
//! Every property is a typed key/value record: a variable-byte-integer
//! identifier followed by exactly one value shape determined by that
//! identifier. A packet carries its properties as a length-delimited
//! sequence; insertion order is preserved on both encode and decode, and
//! some identifiers (user properties, subscription identifiers) may repeat.
//!
//! Which identifiers are legal in which packet type is a property of the
//! packet codec, not of this serializer; callers enforce it through
//! [`PropertyList::validate_for`].

use crate::codec::{self, Decoder};
use crate::error::{ProtocolError, Result};
use crate::packet::PacketType;
use crate::varint;

/// MQTT v5 property identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PropertyType {
    PayloadFormatIndicator = 1,
    MessageExpiryInterval = 2,
    ContentType = 3,
    ResponseTopic = 8,
    CorrelationData = 9,
    SubscriptionIdentifier = 11,
    SessionExpiryInterval = 17,
    AssignedClientIdentifier = 18,
    ServerKeepAlive = 19,
    AuthenticationMethod = 21,
    AuthenticationData = 22,
    RequestProblemInformation = 23,
    WillDelayInterval = 24,
    RequestResponseInformation = 25,
    ResponseInformation = 26,
    ServerReference = 28,
    ReasonString = 31,
    ReceiveMaximum = 33,
    TopicAliasMaximum = 34,
    TopicAlias = 35,
    MaximumQos = 36,
    RetainAvailable = 37,
    UserProperty = 38,
    MaximumPacketSize = 39,
    WildcardSubscriptionAvailable = 40,
    SubscriptionIdentifierAvailable = 41,
    SharedSubscriptionAvailable = 42,
}

impl TryFrom<u32> for PropertyType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        use PropertyType::*;
        Ok(match value {
            1 => PayloadFormatIndicator,
            2 => MessageExpiryInterval,
            3 => ContentType,
            8 => ResponseTopic,
            9 => CorrelationData,
            11 => SubscriptionIdentifier,
            17 => SessionExpiryInterval,
            18 => AssignedClientIdentifier,
            19 => ServerKeepAlive,
            21 => AuthenticationMethod,
            22 => AuthenticationData,
            23 => RequestProblemInformation,
            24 => WillDelayInterval,
            25 => RequestResponseInformation,
            26 => ResponseInformation,
            28 => ServerReference,
            31 => ReasonString,
            33 => ReceiveMaximum,
            34 => TopicAliasMaximum,
            35 => TopicAlias,
            36 => MaximumQos,
            37 => RetainAvailable,
            38 => UserProperty,
            39 => MaximumPacketSize,
            40 => WildcardSubscriptionAvailable,
            41 => SubscriptionIdentifierAvailable,
            42 => SharedSubscriptionAvailable,
            _ => {
                return Err(ProtocolError::MalformedPacket(format!(
                    "Unknown property identifier: {}",
                    value
                )))
            }
        })
    }
}

/// The value shape a property identifier carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Byte,
    TwoByteInt,
    FourByteInt,
    VarInt,
    Utf8String,
    Binary,
    StringPair,
}

impl PropertyType {
    /// The one value shape this identifier carries.
    pub fn data_kind(self) -> DataKind {
        use PropertyType::*;
        match self {
            PayloadFormatIndicator | RequestProblemInformation | RequestResponseInformation
            | MaximumQos | RetainAvailable | WildcardSubscriptionAvailable
            | SubscriptionIdentifierAvailable | SharedSubscriptionAvailable => DataKind::Byte,
            ServerKeepAlive | ReceiveMaximum | TopicAliasMaximum | TopicAlias => {
                DataKind::TwoByteInt
            }
            MessageExpiryInterval | SessionExpiryInterval | WillDelayInterval
            | MaximumPacketSize => DataKind::FourByteInt,
            SubscriptionIdentifier => DataKind::VarInt,
            ContentType | ResponseTopic | AssignedClientIdentifier | AuthenticationMethod
            | ResponseInformation | ServerReference | ReasonString => DataKind::Utf8String,
            CorrelationData | AuthenticationData => DataKind::Binary,
            UserProperty => DataKind::StringPair,
        }
    }

    /// Whether this identifier may appear more than once in a list.
    pub fn can_repeat(self) -> bool {
        matches!(
            self,
            PropertyType::UserProperty | PropertyType::SubscriptionIdentifier
        )
    }

    /// Whether this identifier is legal in the given packet type.
    pub fn allowed_in(self, packet: PacketType) -> bool {
        use PacketType::*;
        use PropertyType::*;
        match self {
            PayloadFormatIndicator | MessageExpiryInterval | ContentType | ResponseTopic
            | CorrelationData => matches!(packet, Publish),
            SubscriptionIdentifier => matches!(packet, Publish | Subscribe),
            SessionExpiryInterval => matches!(packet, Connect | Connack | Disconnect),
            AssignedClientIdentifier | ServerKeepAlive | ResponseInformation | MaximumQos
            | RetainAvailable | WildcardSubscriptionAvailable | SubscriptionIdentifierAvailable
            | SharedSubscriptionAvailable => matches!(packet, Connack),
            AuthenticationMethod | AuthenticationData => matches!(packet, Connect | Connack | Auth),
            RequestProblemInformation | RequestResponseInformation => matches!(packet, Connect),
            ServerReference => matches!(packet, Connack | Disconnect),
            ReasonString => matches!(
                packet,
                Connack | Puback | Pubrec | Pubrel | Pubcomp | Suback | Unsuback | Disconnect
                    | Auth
            ),
            ReceiveMaximum | TopicAliasMaximum | MaximumPacketSize => {
                matches!(packet, Connect | Connack)
            }
            TopicAlias => matches!(packet, Publish),
            UserProperty => true,
            WillDelayInterval => false,
        }
    }

    /// Whether this identifier is legal in a CONNECT will block.
    pub fn allowed_in_will(self) -> bool {
        use PropertyType::*;
        matches!(
            self,
            WillDelayInterval
                | PayloadFormatIndicator
                | MessageExpiryInterval
                | ContentType
                | ResponseTopic
                | CorrelationData
                | UserProperty
        )
    }
}

/// A property value of exactly one shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByteInt(u16),
    FourByteInt(u32),
    VarInt(u32),
    Utf8String(String),
    Binary(Vec<u8>),
    StringPair(String, String),
}

impl PropertyValue {
    fn data_kind(&self) -> DataKind {
        match self {
            PropertyValue::Byte(_) => DataKind::Byte,
            PropertyValue::TwoByteInt(_) => DataKind::TwoByteInt,
            PropertyValue::FourByteInt(_) => DataKind::FourByteInt,
            PropertyValue::VarInt(_) => DataKind::VarInt,
            PropertyValue::Utf8String(_) => DataKind::Utf8String,
            PropertyValue::Binary(_) => DataKind::Binary,
            PropertyValue::StringPair(_, _) => DataKind::StringPair,
        }
    }
}

/// One typed key/value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub ptype: PropertyType,
    pub value: PropertyValue,
}

impl Property {
    /// Create a property, rejecting a value whose shape does not match the
    /// identifier.
    pub fn new(ptype: PropertyType, value: PropertyValue) -> Result<Self> {
        if ptype.data_kind() != value.data_kind() {
            return Err(ProtocolError::BadArg("property value shape mismatch"));
        }
        Ok(Self { ptype, value })
    }

    fn encoded_len(&self) -> usize {
        let value_len = match &self.value {
            PropertyValue::Byte(_) => 1,
            PropertyValue::TwoByteInt(_) => 2,
            PropertyValue::FourByteInt(_) => 4,
            PropertyValue::VarInt(v) => varint::encoded_len(*v),
            PropertyValue::Utf8String(s) => 2 + s.len(),
            PropertyValue::Binary(b) => 2 + b.len(),
            PropertyValue::StringPair(k, v) => 2 + k.len() + 2 + v.len(),
        };
        varint::encoded_len(self.ptype as u32) + value_len
    }
}

/// An ordered sequence of properties. Repeats are allowed where the
/// identifier permits them; order is preserved end to end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyList {
    entries: Vec<Property>,
}

impl PropertyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a property, preserving insertion order.
    pub fn push(&mut self, ptype: PropertyType, value: PropertyValue) -> Result<()> {
        self.entries.push(Property::new(ptype, value)?);
        Ok(())
    }

    /// Append a user property key/value pair.
    pub fn push_user_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Property {
            ptype: PropertyType::UserProperty,
            value: PropertyValue::StringPair(key.into(), value.into()),
        });
    }

    /// First value for the given identifier, if any.
    pub fn first(&self, ptype: PropertyType) -> Option<&PropertyValue> {
        self.entries
            .iter()
            .find(|p| p.ptype == ptype)
            .map(|p| &p.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check every entry against the identifier whitelist for `packet`.
    pub fn validate_for(&self, packet: PacketType) -> Result<()> {
        for prop in &self.entries {
            if !prop.ptype.allowed_in(packet) {
                return Err(ProtocolError::PropertyNotAllowed {
                    property: prop.ptype as u8,
                    packet: packet.name(),
                });
            }
        }
        Ok(())
    }

    /// Check every entry against the will-block whitelist.
    pub fn validate_for_will(&self) -> Result<()> {
        for prop in &self.entries {
            if !prop.ptype.allowed_in_will() {
                return Err(ProtocolError::PropertyNotAllowed {
                    property: prop.ptype as u8,
                    packet: "CONNECT will",
                });
            }
        }
        Ok(())
    }

    /// Total encoded size: the length varint plus every entry.
    pub fn encoded_len(&self) -> usize {
        let entries: usize = self.entries.iter().map(Property::encoded_len).sum();
        varint::encoded_len(entries as u32) + entries
    }

    /// Encode the list: total entry length as a varint, then each entry in
    /// insertion order.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut entry_buf = Vec::new();
        for prop in &self.entries {
            codec::write_varint(&mut entry_buf, prop.ptype as u32)?;
            match &prop.value {
                PropertyValue::Byte(v) => codec::write_u8(&mut entry_buf, *v),
                PropertyValue::TwoByteInt(v) => codec::write_u16(&mut entry_buf, *v),
                PropertyValue::FourByteInt(v) => codec::write_u32(&mut entry_buf, *v),
                PropertyValue::VarInt(v) => {
                    codec::write_varint(&mut entry_buf, *v)?;
                }
                PropertyValue::Utf8String(s) => codec::write_string(&mut entry_buf, s)?,
                PropertyValue::Binary(b) => codec::write_binary(&mut entry_buf, b)?,
                PropertyValue::StringPair(k, v) => {
                    codec::write_string(&mut entry_buf, k)?;
                    codec::write_string(&mut entry_buf, v)?;
                }
            }
        }
        codec::write_varint(buf, entry_buf.len() as u32)?;
        buf.extend_from_slice(&entry_buf);
        Ok(())
    }

    /// Decode a list from the declared-length sequence at the decoder's
    /// position, consuming exactly the declared length.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<PropertyList> {
        let declared = dec.read_varint()? as usize;
        if declared > dec.remaining() {
            return Err(ProtocolError::MalformedPacket(format!(
                "property length {} exceeds remaining {} bytes",
                declared,
                dec.remaining()
            )));
        }
        let end = dec.pos() + declared;

        let mut list = PropertyList::new();
        while dec.pos() < end {
            let id = dec.read_varint()?;
            let ptype = PropertyType::try_from(id)?;
            let value = match ptype.data_kind() {
                DataKind::Byte => PropertyValue::Byte(dec.read_u8()?),
                DataKind::TwoByteInt => PropertyValue::TwoByteInt(dec.read_u16()?),
                DataKind::FourByteInt => PropertyValue::FourByteInt(dec.read_u32()?),
                DataKind::VarInt => PropertyValue::VarInt(dec.read_varint()?),
                DataKind::Utf8String => PropertyValue::Utf8String(dec.read_string()?),
                DataKind::Binary => PropertyValue::Binary(dec.read_binary()?),
                DataKind::StringPair => {
                    let key = dec.read_string()?;
                    let value = dec.read_string()?;
                    PropertyValue::StringPair(key, value)
                }
            };
            if dec.pos() > end {
                return Err(ProtocolError::MalformedPacket(
                    "property value overruns declared length".into(),
                ));
            }
            list.entries.push(Property { ptype, value });
        }
        Ok(list)
    }
}
