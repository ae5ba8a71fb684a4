//! MQTT 5 property table: ordered `(identifier, typed value)` pairs.
//!
//! Each packet type admits a whitelist of identifiers; decoding checks
//! the whitelist itself (see `decode`), keeping the set of "legal here"
//! identifiers next to the packet that enforces it rather than scattered
//! through the decode logic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::varint;

/// A single property value, typed by its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByteInt(u16),
    FourByteInt(u32),
    VariableInt(u32),
    Utf8String(String),
    BinaryData(Bytes),
    Utf8StringPair(String, String),
}

/// Closed set of MQTT 5 property identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
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
    MaximumQoS = 36,
    RetainAvailable = 37,
    UserProperty = 38,
    MaximumPacketSize = 39,
    WildcardSubscriptionAvailable = 40,
    SubscriptionIdentifierAvailable = 41,
    SharedSubscriptionAvailable = 42,
}

impl PropertyId {
    pub fn from_u8(byte: u8) -> Result<Self> {
        use PropertyId::*;
        Ok(match byte {
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
            36 => MaximumQoS,
            37 => RetainAvailable,
            38 => UserProperty,
            39 => MaximumPacketSize,
            40 => WildcardSubscriptionAvailable,
            41 => SubscriptionIdentifierAvailable,
            42 => SharedSubscriptionAvailable,
            other => {
                return Err(Error::Malformed(format!("unknown property identifier {other}")));
            }
        })
    }

    fn decode_value(self, buf: &mut impl Buf) -> Result<PropertyValue> {
        use PropertyId::*;
        Ok(match self {
            PayloadFormatIndicator | RequestProblemInformation | RequestResponseInformation
            | MaximumQoS | RetainAvailable | WildcardSubscriptionAvailable
            | SubscriptionIdentifierAvailable | SharedSubscriptionAvailable => {
                PropertyValue::Byte(read_u8(buf)?)
            }
            ServerKeepAlive | ReceiveMaximum | TopicAliasMaximum | TopicAlias => {
                PropertyValue::TwoByteInt(read_u16(buf)?)
            }
            MessageExpiryInterval | SessionExpiryInterval | WillDelayInterval
            | MaximumPacketSize => PropertyValue::FourByteInt(read_u32(buf)?),
            SubscriptionIdentifier => PropertyValue::VariableInt(
                varint::read(buf)?.ok_or_else(|| Error::Malformed("truncated subscription identifier".into()))?,
            ),
            ContentType | ResponseTopic | AssignedClientIdentifier | AuthenticationMethod
            | ResponseInformation | ServerReference | ReasonString => {
                PropertyValue::Utf8String(read_string(buf)?)
            }
            CorrelationData | AuthenticationData => PropertyValue::BinaryData(read_binary(buf)?),
            UserProperty => {
                let key = read_string(buf)?;
                let value = read_string(buf)?;
                PropertyValue::Utf8StringPair(key, value)
            }
        })
    }

    fn encode_value(self, value: &PropertyValue, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u8(self as u8);
        match value {
            PropertyValue::Byte(b) => buf.put_u8(*b),
            PropertyValue::TwoByteInt(v) => buf.put_u16(*v),
            PropertyValue::FourByteInt(v) => buf.put_u32(*v),
            PropertyValue::VariableInt(v) => varint::write(buf, *v)?,
            PropertyValue::Utf8String(s) => write_string(buf, s),
            PropertyValue::BinaryData(b) => write_binary(buf, b),
            PropertyValue::Utf8StringPair(k, v) => {
                write_string(buf, k);
                write_string(buf, v);
            }
        }
        Ok(())
    }
}

fn read_u8(buf: &mut impl Buf) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::Malformed("truncated property (u8)".into()));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut impl Buf) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::Malformed("truncated property (u16)".into()));
    }
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut impl Buf) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::Malformed("truncated property (u32)".into()));
    }
    Ok(buf.get_u32())
}

pub(crate) fn read_string(buf: &mut impl Buf) -> Result<String> {
    let bytes = read_binary(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::Malformed(format!("invalid utf-8 string: {e}")))
}

pub(crate) fn read_binary(buf: &mut impl Buf) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(Error::Malformed("truncated length-prefixed field".into()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(Error::Malformed("truncated length-prefixed field".into()));
    }
    Ok(buf.copy_to_bytes(len))
}

pub(crate) fn write_string(buf: &mut impl BufMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn write_binary(buf: &mut impl BufMut, b: &[u8]) {
    buf.put_u16(b.len() as u16);
    buf.put_slice(b);
}

/// An ordered property table. Insertion order is preserved for encoding;
/// `UserProperty` is the only identifier expected to repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(pub Vec<(PropertyId, PropertyValue)>);

impl Properties {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, id: PropertyId, value: PropertyValue) {
        self.0.push((id, value));
    }

    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.0.iter().find(|(pid, _)| *pid == id).map(|(_, v)| v)
    }

    pub fn get_u8(&self, id: PropertyId) -> Option<u8> {
        match self.get(id) {
            Some(PropertyValue::Byte(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_u16(&self, id: PropertyId) -> Option<u16> {
        match self.get(id) {
            Some(PropertyValue::TwoByteInt(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u32(&self, id: PropertyId) -> Option<u32> {
        match self.get(id) {
            Some(PropertyValue::FourByteInt(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, id: PropertyId) -> Option<&str> {
        match self.get(id) {
            Some(PropertyValue::Utf8String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn contains(&self, id: PropertyId) -> bool {
        self.get(id).is_some()
    }

    /// Encode the whole table, including its own length prefix.
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        let mut body = BytesMut::new();
        for (id, value) in &self.0 {
            id.encode_value(value, &mut body)?;
        }
        varint::write(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }

    pub fn encoded_len(&self) -> Result<usize> {
        let mut body = BytesMut::new();
        for (id, value) in &self.0 {
            id.encode_value(value, &mut body)?;
        }
        Ok(varint::encoded_len(body.len() as u32) + body.len())
    }

    /// Decode a length-prefixed property table, rejecting any identifier
    /// not present in `whitelist`.
    pub fn decode(buf: &mut impl Buf, whitelist: &[PropertyId]) -> Result<Self> {
        let len = varint::read(buf)?
            .ok_or_else(|| Error::Malformed("truncated property length".into()))? as usize;
        if buf.remaining() < len {
            return Err(Error::Malformed("truncated property table".into()));
        }
        let mut body = buf.copy_to_bytes(len);
        let mut props = Properties::new();
        while body.has_remaining() {
            let id_byte = read_u8(&mut body)?;
            let id = PropertyId::from_u8(id_byte)?;
            if !whitelist.contains(&id) {
                return Err(Error::Malformed(format!(
                    "property {id:?} not allowed for this packet type"
                )));
            }
            let value = id.decode_value(&mut body)?;
            props.push(id, value);
        }
        Ok(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn empty_table_roundtrips() {
        let props = Properties::new();
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00]);
        let mut cursor = &buf[..];
        let decoded = Properties::decode(&mut cursor, &[]).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn user_property_repeats() {
        let mut props = Properties::new();
        props.push(
            PropertyId::UserProperty,
            PropertyValue::Utf8StringPair("a".into(), "1".into()),
        );
        props.push(
            PropertyId::UserProperty,
            PropertyValue::Utf8StringPair("b".into(), "2".into()),
        );
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        let mut cursor = &buf[..];
        let decoded = Properties::decode(&mut cursor, &[PropertyId::UserProperty]).unwrap();
        assert_eq!(decoded.0.len(), 2);
    }

    #[test]
    fn rejects_identifier_outside_whitelist() {
        let mut props = Properties::new();
        props.push(PropertyId::TopicAlias, PropertyValue::TwoByteInt(3));
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        let mut cursor = &buf[..];
        assert!(Properties::decode(&mut cursor, &[PropertyId::UserProperty]).is_err());
    }

    #[test]
    fn session_expiry_roundtrip() {
        let mut props = Properties::new();
        props.push(PropertyId::SessionExpiryInterval, PropertyValue::FourByteInt(7200));
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        let mut cursor = &buf[..];
        let decoded =
            Properties::decode(&mut cursor, &[PropertyId::SessionExpiryInterval]).unwrap();
        assert_eq!(decoded.get_u32(PropertyId::SessionExpiryInterval), Some(7200));
    }
}
