//! MQTT 5 control packets: byte-exact encode/decode for every packet type.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::properties::{self, PropertyId, Properties, PropertyValue};
use crate::reason::{
    AuthReasonCode, ConnectReasonCode, DisconnectReasonCode, PubackReasonCode, PubcompReasonCode,
    PubrecReasonCode, PubrelReasonCode, SubackReasonCode, UnsubackReasonCode,
};
use crate::varint;

/// Control packet type, the high nibble of the fixed header's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    pub fn from_u8(nibble: u8) -> Result<Self> {
        use PacketType::*;
        Ok(match nibble {
            1 => Connect,
            2 => ConnAck,
            3 => Publish,
            4 => PubAck,
            5 => PubRec,
            6 => PubRel,
            7 => PubComp,
            8 => Subscribe,
            9 => SubAck,
            10 => Unsubscribe,
            11 => UnsubAck,
            12 => PingReq,
            13 => PingResp,
            14 => Disconnect,
            15 => Auth,
            other => return Err(Error::Malformed(format!("unknown packet type {other}"))),
        })
    }
}

/// QoS as carried on the wire. The broker only ever advertises/grants 0;
/// the codec still represents the full range so the crate remains a
/// complete MQTT 5 codec for clients speaking to other brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(Error::Malformed(format!("invalid QoS bits {bits:#04b}"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

#[derive(Debug, Clone)]
pub struct Connect {
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub user_name: Option<String>,
    pub password: Option<Bytes>,
    pub properties: Properties,
}

const CONNECT_PROPS: &[PropertyId] = &[
    PropertyId::SessionExpiryInterval,
    PropertyId::AuthenticationMethod,
    PropertyId::AuthenticationData,
    PropertyId::RequestProblemInformation,
    PropertyId::RequestResponseInformation,
    PropertyId::ReceiveMaximum,
    PropertyId::TopicAliasMaximum,
    PropertyId::UserProperty,
    PropertyId::MaximumPacketSize,
];

const WILL_PROPS: &[PropertyId] = &[
    PropertyId::WillDelayInterval,
    PropertyId::PayloadFormatIndicator,
    PropertyId::MessageExpiryInterval,
    PropertyId::ContentType,
    PropertyId::ResponseTopic,
    PropertyId::UserProperty,
];

impl Connect {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let protocol_name = properties::read_string(buf)?;
        if protocol_name != "MQTT" {
            return Err(Error::Malformed(format!("bad protocol name {protocol_name:?}")));
        }
        if buf.remaining() < 1 {
            return Err(Error::Malformed("truncated CONNECT".into()));
        }
        let level = buf.get_u8();
        if level != 5 {
            return Err(Error::Malformed(format!("unsupported protocol level {level}")));
        }
        if buf.remaining() < 3 {
            return Err(Error::Malformed("truncated CONNECT flags".into()));
        }
        let flags = buf.get_u8();
        let keep_alive = buf.get_u16();

        let clean_start = flags & 0x02 != 0;
        let has_will = flags & 0x04 != 0;
        let will_qos = QoS::from_bits((flags >> 3) & 0x03)?;
        let will_retain = flags & 0x20 != 0;
        let has_password = flags & 0x40 != 0;
        let has_user_name = flags & 0x80 != 0;

        let properties = Properties::decode(buf, CONNECT_PROPS)?;
        let client_id = properties::read_string(buf)?;

        let will = if has_will {
            let will_properties = Properties::decode(buf, WILL_PROPS)?;
            let topic = properties::read_string(buf)?;
            let payload = properties::read_binary(buf)?;
            Some(Will {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let user_name = if has_user_name {
            Some(properties::read_string(buf)?)
        } else {
            None
        };
        let password = if has_password {
            Some(properties::read_binary(buf)?)
        } else {
            None
        };

        Ok(Connect {
            clean_start,
            keep_alive,
            client_id,
            will,
            user_name,
            password,
            properties,
        })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        properties::write_string(buf, "MQTT");
        buf.put_u8(5);

        let mut flags = 0u8;
        if self.clean_start {
            flags |= 0x02;
        }
        if let Some(w) = &self.will {
            flags |= 0x04;
            flags |= (w.qos as u8) << 3;
            if w.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.user_name.is_some() {
            flags |= 0x80;
        }
        buf.put_u8(flags);
        buf.put_u16(self.keep_alive);

        self.properties.encode(buf)?;
        properties::write_string(buf, &self.client_id);

        if let Some(w) = &self.will {
            w.properties.encode(buf)?;
            properties::write_string(buf, &w.topic);
            properties::write_binary(buf, &w.payload);
        }
        if let Some(u) = &self.user_name {
            properties::write_string(buf, u);
        }
        if let Some(p) = &self.password {
            properties::write_binary(buf, p);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason: ConnectReasonCode,
    pub properties: Properties,
}

const CONNACK_PROPS: &[PropertyId] = &[
    PropertyId::SessionExpiryInterval,
    PropertyId::AssignedClientIdentifier,
    PropertyId::ServerKeepAlive,
    PropertyId::AuthenticationMethod,
    PropertyId::AuthenticationData,
    PropertyId::ResponseInformation,
    PropertyId::ServerReference,
    PropertyId::ReasonString,
    PropertyId::ReceiveMaximum,
    PropertyId::TopicAliasMaximum,
    PropertyId::MaximumQoS,
    PropertyId::RetainAvailable,
    PropertyId::UserProperty,
    PropertyId::MaximumPacketSize,
    PropertyId::WildcardSubscriptionAvailable,
    PropertyId::SubscriptionIdentifierAvailable,
    PropertyId::SharedSubscriptionAvailable,
];

impl ConnAck {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(Error::Malformed("truncated CONNACK".into()));
        }
        let flags = buf.get_u8();
        let reason = ConnectReasonCode::from_u8(buf.get_u8())?;
        let properties = Properties::decode(buf, CONNACK_PROPS)?;
        Ok(ConnAck {
            session_present: flags & 0x01 != 0,
            reason,
            properties,
        })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u8(if self.session_present { 0x01 } else { 0x00 });
        buf.put_u8(self.reason.to_u8());
        self.properties.encode(buf)
    }
}

#[derive(Debug, Clone)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub properties: Properties,
    pub payload: Bytes,
}

const PUBLISH_PROPS: &[PropertyId] = &[
    PropertyId::PayloadFormatIndicator,
    PropertyId::MessageExpiryInterval,
    PropertyId::ContentType,
    PropertyId::ResponseTopic,
    PropertyId::CorrelationData,
    PropertyId::SubscriptionIdentifier,
    PropertyId::TopicAlias,
    PropertyId::UserProperty,
];

impl Publish {
    fn decode(buf: &mut impl Buf, flags: u8) -> Result<Self> {
        let dup = flags & 0x08 != 0;
        let qos = QoS::from_bits((flags >> 1) & 0x03)?;
        let retain = flags & 0x01 != 0;

        let topic = properties::read_string(buf)?;
        if topic.contains('+') || topic.contains('#') {
            return Err(Error::Malformed("PUBLISH topic may not contain wildcards".into()));
        }
        let packet_id = if matches!(qos, QoS::AtMostOnce) {
            None
        } else {
            if buf.remaining() < 2 {
                return Err(Error::Malformed("truncated PUBLISH packet identifier".into()));
            }
            Some(buf.get_u16())
        };
        let properties = Properties::decode(buf, PUBLISH_PROPS)?;
        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Publish {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            properties,
            payload,
        })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<u8> {
        properties::write_string(buf, &self.topic);
        if !matches!(self.qos, QoS::AtMostOnce) {
            let pid = self
                .packet_id
                .ok_or_else(|| Error::Protocol("PUBLISH with QoS>0 needs a packet identifier".into()))?;
            buf.put_u16(pid);
        }
        self.properties.encode(buf)?;
        buf.put_slice(&self.payload);

        let mut flags = 0u8;
        if self.dup {
            flags |= 0x08;
        }
        flags |= (self.qos as u8) << 1;
        if self.retain {
            flags |= 0x01;
        }
        Ok(flags)
    }
}

/// Shared shape for PUBACK/PUBREC/PUBREL/PUBCOMP: packet id, then an
/// optional reason byte and property table (both omitted when the
/// reason is success and there are no properties, per the spec's
/// "short form" allowance).
fn decode_ack_body<R>(
    buf: &mut impl Buf,
    whitelist: &[PropertyId],
    from_u8: impl FnOnce(u8) -> Result<R>,
    success: R,
) -> Result<(u16, R, Properties)>
where
    R: Copy,
{
    if buf.remaining() < 2 {
        return Err(Error::Malformed("truncated acknowledgement packet identifier".into()));
    }
    let packet_id = buf.get_u16();
    if !buf.has_remaining() {
        return Ok((packet_id, success, Properties::new()));
    }
    let reason = from_u8(buf.get_u8())?;
    let properties = if buf.has_remaining() {
        Properties::decode(buf, whitelist)?
    } else {
        Properties::new()
    };
    Ok((packet_id, reason, properties))
}

fn encode_ack_body(
    buf: &mut impl BufMut,
    packet_id: u16,
    reason: u8,
    properties: &Properties,
) -> Result<()> {
    buf.put_u16(packet_id);
    if reason == 0 && properties.0.is_empty() {
        return Ok(());
    }
    buf.put_u8(reason);
    if !properties.0.is_empty() {
        properties.encode(buf)?;
    }
    Ok(())
}

const ACK_PROPS: &[PropertyId] = &[PropertyId::ReasonString, PropertyId::UserProperty];

#[derive(Debug, Clone)]
pub struct PubAck {
    pub packet_id: u16,
    pub reason: PubackReasonCode,
    pub properties: Properties,
}

impl PubAck {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let (packet_id, reason, properties) =
            decode_ack_body(buf, ACK_PROPS, PubackReasonCode::from_u8, PubackReasonCode::Success)?;
        Ok(PubAck { packet_id, reason, properties })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        encode_ack_body(buf, self.packet_id, self.reason.to_u8(), &self.properties)
    }
}

#[derive(Debug, Clone)]
pub struct PubRec {
    pub packet_id: u16,
    pub reason: PubrecReasonCode,
    pub properties: Properties,
}

impl PubRec {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let (packet_id, reason, properties) =
            decode_ack_body(buf, ACK_PROPS, PubrecReasonCode::from_u8, PubrecReasonCode::Success)?;
        Ok(PubRec { packet_id, reason, properties })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        encode_ack_body(buf, self.packet_id, self.reason.to_u8(), &self.properties)
    }
}

#[derive(Debug, Clone)]
pub struct PubRel {
    pub packet_id: u16,
    pub reason: PubrelReasonCode,
    pub properties: Properties,
}

impl PubRel {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let (packet_id, reason, properties) =
            decode_ack_body(buf, ACK_PROPS, PubrelReasonCode::from_u8, PubrelReasonCode::Success)?;
        Ok(PubRel { packet_id, reason, properties })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        encode_ack_body(buf, self.packet_id, self.reason.to_u8(), &self.properties)
    }
}

#[derive(Debug, Clone)]
pub struct PubComp {
    pub packet_id: u16,
    pub reason: PubcompReasonCode,
    pub properties: Properties,
}

impl PubComp {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        let (packet_id, reason, properties) =
            decode_ack_body(buf, ACK_PROPS, PubcompReasonCode::from_u8, PubcompReasonCode::Success)?;
        Ok(PubComp { packet_id, reason, properties })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        encode_ack_body(buf, self.packet_id, self.reason.to_u8(), &self.properties)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    pub max_qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl SubscribeOptions {
    fn from_byte(byte: u8) -> Result<Self> {
        Ok(SubscribeOptions {
            max_qos: QoS::from_bits(byte & 0x03)?,
            no_local: byte & 0x04 != 0,
            retain_as_published: byte & 0x08 != 0,
            retain_handling: (byte >> 4) & 0x03,
        })
    }

    fn to_byte(self) -> u8 {
        let mut b = self.max_qos as u8;
        if self.no_local {
            b |= 0x04;
        }
        if self.retain_as_published {
            b |= 0x08;
        }
        b |= (self.retain_handling & 0x03) << 4;
        b
    }
}

#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    pub properties: Properties,
    pub filters: Vec<(String, SubscribeOptions)>,
}

const SUBSCRIBE_PROPS: &[PropertyId] = &[PropertyId::SubscriptionIdentifier, PropertyId::UserProperty];

impl Subscribe {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(Error::Malformed("truncated SUBSCRIBE packet identifier".into()));
        }
        let packet_id = buf.get_u16();
        let properties = Properties::decode(buf, SUBSCRIBE_PROPS)?;
        let mut filters = Vec::new();
        while buf.has_remaining() {
            let topic = properties::read_string(buf)?;
            if buf.remaining() < 1 {
                return Err(Error::Malformed("truncated SUBSCRIBE options byte".into()));
            }
            let options = SubscribeOptions::from_byte(buf.get_u8())?;
            filters.push((topic, options));
        }
        if filters.is_empty() {
            return Err(Error::Malformed("SUBSCRIBE with no filters".into()));
        }
        Ok(Subscribe { packet_id, properties, filters })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u16(self.packet_id);
        self.properties.encode(buf)?;
        for (topic, options) in &self.filters {
            properties::write_string(buf, topic);
            buf.put_u8(options.to_byte());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SubAck {
    pub packet_id: u16,
    pub properties: Properties,
    pub reasons: Vec<SubackReasonCode>,
}

const SUBACK_PROPS: &[PropertyId] = &[PropertyId::ReasonString, PropertyId::UserProperty];

impl SubAck {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(Error::Malformed("truncated SUBACK packet identifier".into()));
        }
        let packet_id = buf.get_u16();
        let properties = Properties::decode(buf, SUBACK_PROPS)?;
        let mut reasons = Vec::new();
        while buf.has_remaining() {
            reasons.push(SubackReasonCode::from_u8(buf.get_u8())?);
        }
        Ok(SubAck { packet_id, properties, reasons })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u16(self.packet_id);
        self.properties.encode(buf)?;
        for r in &self.reasons {
            buf.put_u8(r.to_u8());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub properties: Properties,
    pub filters: Vec<String>,
}

const UNSUBSCRIBE_PROPS: &[PropertyId] = &[PropertyId::UserProperty];

impl Unsubscribe {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(Error::Malformed("truncated UNSUBSCRIBE packet identifier".into()));
        }
        let packet_id = buf.get_u16();
        let properties = Properties::decode(buf, UNSUBSCRIBE_PROPS)?;
        let mut filters = Vec::new();
        while buf.has_remaining() {
            filters.push(properties::read_string(buf)?);
        }
        if filters.is_empty() {
            return Err(Error::Malformed("UNSUBSCRIBE with no filters".into()));
        }
        Ok(Unsubscribe { packet_id, properties, filters })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u16(self.packet_id);
        self.properties.encode(buf)?;
        for f in &self.filters {
            properties::write_string(buf, f);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub properties: Properties,
    pub reasons: Vec<UnsubackReasonCode>,
}

const UNSUBACK_PROPS: &[PropertyId] = &[PropertyId::ReasonString, PropertyId::UserProperty];

impl UnsubAck {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(Error::Malformed("truncated UNSUBACK packet identifier".into()));
        }
        let packet_id = buf.get_u16();
        let properties = Properties::decode(buf, UNSUBACK_PROPS)?;
        let mut reasons = Vec::new();
        while buf.has_remaining() {
            reasons.push(UnsubackReasonCode::from_u8(buf.get_u8())?);
        }
        Ok(UnsubAck { packet_id, properties, reasons })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u16(self.packet_id);
        self.properties.encode(buf)?;
        for r in &self.reasons {
            buf.put_u8(r.to_u8());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Disconnect {
    pub reason: DisconnectReasonCode,
    pub properties: Properties,
}

impl Default for DisconnectReasonCode {
    fn default() -> Self {
        DisconnectReasonCode::NormalDisconnection
    }
}

const DISCONNECT_PROPS: &[PropertyId] = &[
    PropertyId::SessionExpiryInterval,
    PropertyId::ServerReference,
    PropertyId::ReasonString,
    PropertyId::UserProperty,
];

impl Disconnect {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if !buf.has_remaining() {
            return Ok(Disconnect::default());
        }
        let reason = DisconnectReasonCode::from_u8(buf.get_u8())?;
        let properties = if buf.has_remaining() {
            Properties::decode(buf, DISCONNECT_PROPS)?
        } else {
            Properties::new()
        };
        Ok(Disconnect { reason, properties })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        if matches!(self.reason, DisconnectReasonCode::NormalDisconnection) && self.properties.0.is_empty() {
            return Ok(());
        }
        buf.put_u8(self.reason.to_u8());
        if !self.properties.0.is_empty() {
            self.properties.encode(buf)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub reason: AuthReasonCode,
    pub properties: Properties,
}

impl Default for AuthReasonCode {
    fn default() -> Self {
        AuthReasonCode::Success
    }
}

const AUTH_PROPS: &[PropertyId] = &[
    PropertyId::AuthenticationMethod,
    PropertyId::AuthenticationData,
    PropertyId::ReasonString,
    PropertyId::UserProperty,
];

impl Auth {
    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if !buf.has_remaining() {
            return Ok(Auth::default());
        }
        let reason = AuthReasonCode::from_u8(buf.get_u8())?;
        let properties = if buf.has_remaining() {
            Properties::decode(buf, AUTH_PROPS)?
        } else {
            Properties::new()
        };
        Ok(Auth { reason, properties })
    }

    fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u8(self.reason.to_u8());
        if !self.properties.0.is_empty() {
            self.properties.encode(buf)?;
        }
        Ok(())
    }
}

/// Any decoded MQTT 5 control packet.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Auth(_) => PacketType::Auth,
        }
    }

    /// Decode one full packet from `ty`/`flags` (the fixed header) plus
    /// the exact-length payload that followed it.
    pub fn decode(ty: PacketType, flags: u8, mut payload: Bytes) -> Result<Self> {
        let buf = &mut payload;
        Ok(match ty {
            PacketType::Connect => Packet::Connect(Connect::decode(buf)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::decode(buf)?),
            PacketType::Publish => Packet::Publish(Publish::decode(buf, flags)?),
            PacketType::PubAck => Packet::PubAck(PubAck::decode(buf)?),
            PacketType::PubRec => Packet::PubRec(PubRec::decode(buf)?),
            PacketType::PubRel => {
                if flags != 0x02 {
                    return Err(Error::Malformed("PUBREL flags must be 0x2".into()));
                }
                Packet::PubRel(PubRel::decode(buf)?)
            }
            PacketType::PubComp => Packet::PubComp(PubComp::decode(buf)?),
            PacketType::Subscribe => {
                if flags != 0x02 {
                    return Err(Error::Malformed("SUBSCRIBE flags must be 0x2".into()));
                }
                Packet::Subscribe(Subscribe::decode(buf)?)
            }
            PacketType::SubAck => Packet::SubAck(SubAck::decode(buf)?),
            PacketType::Unsubscribe => {
                if flags != 0x02 {
                    return Err(Error::Malformed("UNSUBSCRIBE flags must be 0x2".into()));
                }
                Packet::Unsubscribe(Unsubscribe::decode(buf)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::decode(buf)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect(Disconnect::decode(buf)?),
            PacketType::Auth => Packet::Auth(Auth::decode(buf)?),
        })
    }

    /// Encode the full packet (fixed header + payload) into `out`.
    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        let flags = match self {
            Packet::Connect(p) => {
                p.encode(&mut body)?;
                0x00
            }
            Packet::ConnAck(p) => {
                p.encode(&mut body)?;
                0x00
            }
            Packet::Publish(p) => p.encode(&mut body)?,
            Packet::PubAck(p) => {
                p.encode(&mut body)?;
                0x00
            }
            Packet::PubRec(p) => {
                p.encode(&mut body)?;
                0x00
            }
            Packet::PubRel(p) => {
                p.encode(&mut body)?;
                0x02
            }
            Packet::PubComp(p) => {
                p.encode(&mut body)?;
                0x00
            }
            Packet::Subscribe(p) => {
                p.encode(&mut body)?;
                0x02
            }
            Packet::SubAck(p) => {
                p.encode(&mut body)?;
                0x00
            }
            Packet::Unsubscribe(p) => {
                p.encode(&mut body)?;
                0x02
            }
            Packet::UnsubAck(p) => {
                p.encode(&mut body)?;
                0x00
            }
            Packet::PingReq | Packet::PingResp => 0x00,
            Packet::Disconnect(p) => {
                p.encode(&mut body)?;
                0x00
            }
            Packet::Auth(p) => {
                p.encode(&mut body)?;
                0x00
            }
        };

        let header_byte = ((self.packet_type() as u8) << 4) | flags;
        out.put_u8(header_byte);
        varint::write(out, body.len() as u32)?;
        out.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) -> Packet {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        let header = buf[0];
        let ty = PacketType::from_u8(header >> 4).unwrap();
        let flags = header & 0x0F;
        let mut rest = &buf[1..];
        let len = varint::read(&mut rest).unwrap().unwrap() as usize;
        assert_eq!(rest.len(), len);
        Packet::decode(ty, flags, Bytes::copy_from_slice(rest)).unwrap()
    }

    #[test]
    fn connect_roundtrip() {
        let packet = Packet::Connect(Connect {
            clean_start: true,
            keep_alive: 60,
            client_id: "bar".into(),
            will: None,
            user_name: None,
            password: None,
            properties: Properties::new(),
        });
        match roundtrip(packet) {
            Packet::Connect(c) => {
                assert_eq!(c.client_id, "bar");
                assert_eq!(c.keep_alive, 60);
                assert!(c.clean_start);
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn connect_with_will_roundtrip() {
        let mut will_props = Properties::new();
        will_props.push(PropertyId::WillDelayInterval, PropertyValue::FourByteInt(5));
        let packet = Packet::Connect(Connect {
            clean_start: false,
            keep_alive: 30,
            client_id: "willclient".into(),
            will: Some(Will {
                topic: "foo".into(),
                payload: Bytes::from_static(b"bar"),
                qos: QoS::AtMostOnce,
                retain: false,
                properties: will_props,
            }),
            user_name: Some("alice".into()),
            password: Some(Bytes::from_static(b"secret")),
            properties: Properties::new(),
        });
        match roundtrip(packet) {
            Packet::Connect(c) => {
                let will = c.will.unwrap();
                assert_eq!(will.topic, "foo");
                assert_eq!(&will.payload[..], b"bar");
                assert_eq!(c.user_name.as_deref(), Some("alice"));
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn connack_roundtrip() {
        let mut props = Properties::new();
        props.push(PropertyId::MaximumQoS, PropertyValue::Byte(0));
        let packet = Packet::ConnAck(ConnAck {
            session_present: false,
            reason: ConnectReasonCode::Success,
            properties: props,
        });
        match roundtrip(packet) {
            Packet::ConnAck(c) => {
                assert_eq!(c.reason, ConnectReasonCode::Success);
                assert!(!c.session_present);
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn publish_qos0_roundtrip() {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: "/a/b".into(),
            packet_id: None,
            properties: Properties::new(),
            payload: Bytes::from_static(b"apa"),
        });
        match roundtrip(packet) {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "/a/b");
                assert!(p.retain);
                assert_eq!(&p.payload[..], b"apa");
                assert!(p.packet_id.is_none());
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn publish_rejects_wildcard_topic() {
        let mut buf = BytesMut::new();
        properties::write_string(&mut buf, "a/+/b");
        Properties::new().encode(&mut buf).unwrap();
        let result = Publish::decode(&mut &buf[..], 0x00);
        assert!(result.is_err());
    }

    #[test]
    fn subscribe_suback_roundtrip() {
        let packet = Packet::Subscribe(Subscribe {
            packet_id: 1,
            properties: Properties::new(),
            filters: vec![("/a/b".into(), SubscribeOptions::default())],
        });
        match roundtrip(packet) {
            Packet::Subscribe(s) => {
                assert_eq!(s.packet_id, 1);
                assert_eq!(s.filters[0].0, "/a/b");
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }

        let suback = Packet::SubAck(SubAck {
            packet_id: 1,
            properties: Properties::new(),
            reasons: vec![SubackReasonCode::GrantedQoS0],
        });
        match roundtrip(suback) {
            Packet::SubAck(s) => assert_eq!(s.reasons, vec![SubackReasonCode::GrantedQoS0]),
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn puback_short_form_omits_reason_and_properties() {
        let packet = Packet::PubAck(PubAck {
            packet_id: 9,
            reason: PubackReasonCode::Success,
            properties: Properties::new(),
        });
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        // header(1) + remaining-length(1) + packet id(2) == 4, no reason byte
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn disconnect_empty_body_roundtrip() {
        let packet = Packet::Disconnect(Disconnect::default());
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0xE0, 0x00]);
    }

    #[test]
    fn pingreq_pingresp_are_header_only() {
        let mut buf = BytesMut::new();
        Packet::PingReq.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0xC0, 0x00]);
        buf.clear();
        Packet::PingResp.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0xD0, 0x00]);
    }
}
