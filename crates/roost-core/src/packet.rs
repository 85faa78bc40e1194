//! MQTT control packet types and codec for MQTT 3.1.1 and MQTT 5.0.
//!
//! Encoding and decoding always take an explicit [`ProtocolVersion`]; the
//! MQTT 5 variants insert a property block between the variable header and
//! the payload. [`decode_packet`] is a streaming decoder: it returns
//! `Ok(None)` until the buffer holds one complete frame.

use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::properties::{
    AckProperties, AuthProperties, ConnackProperties, ConnectProperties, DisconnectProperties,
    PublishProperties, SubscribeProperties, UnsubscribeProperties, WillProperties,
};
use crate::varint;

/// Protocol name bytes carried by every CONNECT: length-prefixed "MQTT".
const PROTOCOL_NAME: [u8; 6] = [0x00, 0x04, b'M', b'Q', b'T', b'T'];

/// MQTT protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT 3.1.1, protocol level 4.
    V311 = 4,
    /// MQTT 5.0, protocol level 5.
    V5 = 5,
}

impl ProtocolVersion {
    /// The protocol level byte carried in CONNECT.
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn is_v5(self) -> bool {
        self == ProtocolVersion::V5
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            4 => Ok(ProtocolVersion::V311),
            5 => Ok(ProtocolVersion::V5),
            other => Err(CodecError::UnsupportedVersion(other)),
        }
    }
}

/// MQTT control packet types (the high nibble of the fixed header).
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
    type Error = CodecError;

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
            other => Err(CodecError::bad(format!("invalid packet type {other}"))),
        }
    }
}

/// Quality of service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once (PUBACK).
    AtLeastOnce = 1,
    /// Exactly once (PUBREC, PUBREL, PUBCOMP).
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CodecError::bad(format!("invalid QoS {other}"))),
        }
    }
}

/// A topic filter with its requested QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub qos: QoS,
}

impl Topic {
    pub fn new(name: impl Into<String>, qos: QoS) -> Self {
        Self {
            name: name.into(),
            qos,
        }
    }
}

/// Reason codes shared by MQTT 5 packets, plus the MQTT 3.1.1 CONNACK
/// return codes. Constants rather than an enum: several codes share a
/// numeric value with packet-dependent meaning.
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
    /// SUBACK per-filter failure marker, both protocol versions.
    pub const SUB_FAIL: u8 = 0x80;
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

    /// MQTT 3.1.1 CONNACK: connection refused, unacceptable protocol version.
    pub const V311_UNACCEPTABLE_PROTOCOL_VERSION: u8 = 0x01;
}

/// Will message registered in CONNECT and published by the broker on an
/// ungraceful disconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// MQTT 5 will properties (ignored when encoding for 3.1.1).
    pub properties: Option<WillProperties>,
}

impl Will {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: None,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// CONNECT packet fields. The protocol name is always "MQTT" and the level
/// byte comes from the version the packet is encoded with.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Connect {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub properties: Option<ConnectProperties>,
}

/// CONNACK packet fields. `code` holds the 3.1.1 return code or the MQTT 5
/// reason code depending on the session version.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Connack {
    pub session_present: bool,
    pub code: u8,
    pub properties: Option<ConnackProperties>,
}

/// PUBLISH packet fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present exactly when `qos > 0`.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: Option<PublishProperties>,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
            properties: None,
        }
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Shared shape of PUBACK, PUBREC, PUBREL and PUBCOMP. In MQTT 5 the
/// reason code and properties may be omitted on the wire when the exchange
/// succeeded; decoding then defaults `reason_code` to success.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub packet_id: u16,
    pub reason_code: u8,
    pub properties: Option<AckProperties>,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: reason_code::SUCCESS,
            properties: None,
        }
    }
}

/// SUBSCRIBE packet fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<Topic>,
    pub properties: Option<SubscribeProperties>,
}

/// SUBACK packet fields. One code per requested filter: granted QoS
/// 0/1/2 or [`reason_code::SUB_FAIL`].
#[derive(Debug, Clone, PartialEq)]
pub struct Suback {
    pub packet_id: u16,
    pub codes: Vec<u8>,
    pub properties: Option<AckProperties>,
}

/// UNSUBSCRIBE packet fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Option<UnsubscribeProperties>,
}

/// UNSUBACK packet fields. `codes` is empty for 3.1.1.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsuback {
    pub packet_id: u16,
    pub codes: Vec<u8>,
    pub properties: Option<AckProperties>,
}

/// DISCONNECT packet fields; 3.1.1 carries neither code nor properties.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Disconnect {
    pub reason_code: u8,
    pub properties: Option<DisconnectProperties>,
}

/// AUTH packet fields (MQTT 5 only).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Auth {
    pub reason_code: u8,
    pub properties: Option<AuthProperties>,
}

/// An MQTT control packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(Ack),
    Pubrec(Ack),
    Pubrel(Ack),
    Pubcomp(Ack),
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
}

// === Decoding ===

/// Byte cursor over one packet body.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(CodecError::bad("truncated packet"));
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(CodecError::bad("truncated packet"));
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        if self.remaining() < 4 {
            return Err(CodecError::bad("truncated packet"));
        }
        let v = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(CodecError::bad("length prefix out of bounds"));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Length-prefixed UTF-8 string. The codec does not enforce UTF-8
    /// validity of topic content beyond what `String` requires.
    pub(crate) fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::bad("invalid UTF-8 string"))
    }

    /// Length-prefixed opaque bytes.
    pub(crate) fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub(crate) fn read_varint(&mut self) -> Result<usize> {
        match varint::decode(&self.buf[self.pos..])? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(CodecError::bad("truncated variable integer")),
        }
    }

    pub(crate) fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

/// Try to decode one complete packet from the front of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` when a full frame is
/// available, `Ok(None)` when more data is needed, or an error for a
/// malformed frame.
pub fn decode_packet(buf: &[u8], version: ProtocolVersion) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed = buf[0];
    let Some((remaining, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let total = 1 + len_bytes + remaining;
    if buf.len() < total {
        return Ok(None);
    }

    let body = &buf[1 + len_bytes..total];
    let packet = decode_body(fixed, body, version)?;
    Ok(Some((packet, total)))
}

fn decode_body(fixed: u8, body: &[u8], version: ProtocolVersion) -> Result<Packet> {
    let packet_type = PacketType::try_from(fixed >> 4)?;
    let flags = fixed & 0x0F;

    // Zero remaining length is only valid for the ping pair and for a
    // 3.1.1 DISCONNECT.
    if body.is_empty() {
        return match packet_type {
            PacketType::Pingreq => Ok(Packet::Pingreq),
            PacketType::Pingresp => Ok(Packet::Pingresp),
            PacketType::Disconnect if version == ProtocolVersion::V311 => {
                Ok(Packet::Disconnect(Disconnect::default()))
            }
            other => Err(CodecError::bad(format!(
                "{other:?} with zero remaining length"
            ))),
        };
    }

    // SUBSCRIBE, UNSUBSCRIBE and PUBREL carry mandatory flag bits 0010.
    match packet_type {
        PacketType::Subscribe | PacketType::Unsubscribe | PacketType::Pubrel => {
            if flags != 0x02 {
                return Err(CodecError::bad(format!(
                    "{packet_type:?} flags must be 0x02, got {flags:#04x}"
                )));
            }
        }
        _ => {}
    }

    let mut r = Reader::new(body);
    match packet_type {
        PacketType::Connect => decode_connect(&mut r, version),
        PacketType::Connack => decode_connack(&mut r, version),
        PacketType::Publish => decode_publish(flags, &mut r, version),
        PacketType::Puback => Ok(Packet::Puback(decode_ack(&mut r, version)?)),
        PacketType::Pubrec => Ok(Packet::Pubrec(decode_ack(&mut r, version)?)),
        PacketType::Pubrel => Ok(Packet::Pubrel(decode_ack(&mut r, version)?)),
        PacketType::Pubcomp => Ok(Packet::Pubcomp(decode_ack(&mut r, version)?)),
        PacketType::Subscribe => decode_subscribe(&mut r, version),
        PacketType::Suback => decode_suback(&mut r, version),
        PacketType::Unsubscribe => decode_unsubscribe(&mut r, version),
        PacketType::Unsuback => decode_unsuback(&mut r, version),
        PacketType::Pingreq => Ok(Packet::Pingreq),
        PacketType::Pingresp => Ok(Packet::Pingresp),
        PacketType::Disconnect => decode_disconnect(&mut r, version),
        PacketType::Auth => decode_auth(&mut r, version),
    }
}

fn decode_connect(r: &mut Reader, version: ProtocolVersion) -> Result<Packet> {
    let name = r.read_string()?;
    if name != "MQTT" {
        return Err(CodecError::bad(format!("invalid protocol name {name:?}")));
    }

    let level = r.read_u8()?;
    if level != version.level() {
        return Err(CodecError::VersionMismatch {
            expected: version.level(),
            found: level,
        });
    }

    let flags = r.read_u8()?;
    if flags & 0x01 != 0 {
        return Err(CodecError::bad("reserved connect flag set"));
    }
    let clean_session = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = flags & 0x20 != 0;
    let password_flag = flags & 0x40 != 0;
    let username_flag = flags & 0x80 != 0;

    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(CodecError::bad("will qos/retain set without will flag"));
    }
    // MQTT 5 permits a password without a username; 3.1.1 does not.
    if version == ProtocolVersion::V311 && password_flag && !username_flag {
        return Err(CodecError::bad("password flag set without username flag"));
    }

    let keep_alive = r.read_u16()?;

    let properties = if version.is_v5() {
        ConnectProperties::decode(r)?
    } else {
        None
    };

    let client_id = r.read_string()?;

    let will = if will_flag {
        let will_properties = if version.is_v5() {
            WillProperties::decode(r)?
        } else {
            None
        };
        let topic = r.read_string()?;
        let payload = Bytes::from(r.read_binary()?);
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

    let username = if username_flag {
        Some(r.read_string()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(r.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
        properties,
    }))
}

fn decode_connack(r: &mut Reader, version: ProtocolVersion) -> Result<Packet> {
    let session_present = r.read_u8()? & 0x01 != 0;
    let code = r.read_u8()?;
    let properties = if version.is_v5() {
        ConnackProperties::decode(r)?
    } else {
        None
    };
    Ok(Packet::Connack(Connack {
        session_present,
        code,
        properties,
    }))
}

fn decode_publish(flags: u8, r: &mut Reader, version: ProtocolVersion) -> Result<Packet> {
    // A frame with DUP set and QoS 0 is unusual but still decoded.
    let dup = flags & 0x08 != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = flags & 0x01 != 0;

    let topic = r.read_string()?;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = r.read_u16()?;
        if id == 0 {
            return Err(CodecError::bad("PUBLISH with QoS > 0 and packet id 0"));
        }
        Some(id)
    } else {
        None
    };

    // MQTT 5 properties sit between the packet id and the payload.
    let properties = if version.is_v5() {
        PublishProperties::decode(r)?
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(r.take_rest());

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
        properties,
    }))
}

fn decode_ack(r: &mut Reader, version: ProtocolVersion) -> Result<Ack> {
    let packet_id = r.read_u16()?;
    let mut ack = Ack::new(packet_id);
    // Remaining length of exactly 2 omits the reason code and defaults it
    // to success.
    if version.is_v5() && r.remaining() > 0 {
        ack.reason_code = r.read_u8()?;
        if r.remaining() > 0 {
            ack.properties = AckProperties::decode(r)?;
        }
    }
    Ok(ack)
}

fn decode_subscribe(r: &mut Reader, version: ProtocolVersion) -> Result<Packet> {
    let packet_id = r.read_u16()?;
    let properties = if version.is_v5() {
        SubscribeProperties::decode(r)?
    } else {
        None
    };

    let mut topics = Vec::new();
    while r.remaining() > 0 {
        let name = r.read_string()?;
        if name.is_empty() {
            return Err(CodecError::bad("empty topic filter"));
        }
        let options = r.read_u8()?;
        topics.push(Topic {
            name,
            qos: QoS::try_from(options & 0x03)?,
        });
    }
    if topics.is_empty() {
        return Err(CodecError::bad("SUBSCRIBE with no topic filters"));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        topics,
        properties,
    }))
}

fn decode_suback(r: &mut Reader, version: ProtocolVersion) -> Result<Packet> {
    let packet_id = r.read_u16()?;
    let properties = if version.is_v5() {
        AckProperties::decode(r)?
    } else {
        None
    };
    let codes = r.take_rest().to_vec();
    Ok(Packet::Suback(Suback {
        packet_id,
        codes,
        properties,
    }))
}

fn decode_unsubscribe(r: &mut Reader, version: ProtocolVersion) -> Result<Packet> {
    let packet_id = r.read_u16()?;
    let properties = if version.is_v5() {
        UnsubscribeProperties::decode(r)?
    } else {
        None
    };

    let mut filters = Vec::new();
    while r.remaining() > 0 {
        let name = r.read_string()?;
        if name.is_empty() {
            return Err(CodecError::bad("empty topic filter"));
        }
        filters.push(name);
    }
    if filters.is_empty() {
        return Err(CodecError::bad("UNSUBSCRIBE with no topic filters"));
    }

    Ok(Packet::Unsubscribe(Unsubscribe {
        packet_id,
        filters,
        properties,
    }))
}

fn decode_unsuback(r: &mut Reader, version: ProtocolVersion) -> Result<Packet> {
    let packet_id = r.read_u16()?;
    let (properties, codes) = if version.is_v5() {
        let properties = AckProperties::decode(r)?;
        (properties, r.take_rest().to_vec())
    } else {
        (None, Vec::new())
    };
    Ok(Packet::Unsuback(Unsuback {
        packet_id,
        codes,
        properties,
    }))
}

fn decode_disconnect(r: &mut Reader, version: ProtocolVersion) -> Result<Packet> {
    // The zero-length 3.1.1 form is handled before the body is read; a
    // 3.1.1 DISCONNECT with a body is malformed.
    if version == ProtocolVersion::V311 {
        return Err(CodecError::bad("DISCONNECT with payload in MQTT 3.1.1"));
    }
    let reason_code = r.read_u8()?;
    let properties = if r.remaining() > 0 {
        DisconnectProperties::decode(r)?
    } else {
        None
    };
    Ok(Packet::Disconnect(Disconnect {
        reason_code,
        properties,
    }))
}

fn decode_auth(r: &mut Reader, version: ProtocolVersion) -> Result<Packet> {
    if version == ProtocolVersion::V311 {
        return Err(CodecError::bad("AUTH requires MQTT 5"));
    }
    let reason_code = r.read_u8()?;
    let properties = if r.remaining() > 0 {
        AuthProperties::decode(r)?
    } else {
        None
    };
    Ok(Packet::Auth(Auth {
        reason_code,
        properties,
    }))
}

// === Encoding ===

/// Encode `packet` for `version`, appending the frame to `buf`.
pub fn encode_packet(packet: &Packet, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
    match packet {
        Packet::Connect(p) => encode_connect(p, version, buf),
        Packet::Connack(p) => encode_connack(p, version, buf),
        Packet::Publish(p) => encode_publish(p, version, buf),
        Packet::Puback(p) => encode_ack(PacketType::Puback, p, version, buf),
        Packet::Pubrec(p) => encode_ack(PacketType::Pubrec, p, version, buf),
        Packet::Pubrel(p) => encode_ack(PacketType::Pubrel, p, version, buf),
        Packet::Pubcomp(p) => encode_ack(PacketType::Pubcomp, p, version, buf),
        Packet::Subscribe(p) => encode_subscribe(p, version, buf),
        Packet::Suback(p) => encode_suback(p, version, buf),
        Packet::Unsubscribe(p) => encode_unsubscribe(p, version, buf),
        Packet::Unsuback(p) => encode_unsuback(p, version, buf),
        Packet::Pingreq => {
            buf.push((PacketType::Pingreq as u8) << 4);
            buf.push(0x00);
            Ok(())
        }
        Packet::Pingresp => {
            buf.push((PacketType::Pingresp as u8) << 4);
            buf.push(0x00);
            Ok(())
        }
        Packet::Disconnect(p) => encode_disconnect(p, version, buf),
        Packet::Auth(p) => encode_auth(p, version, buf),
    }
}

/// Append the fixed header and a fully built body.
fn frame(packet_type: PacketType, flags: u8, body: Vec<u8>, buf: &mut Vec<u8>) -> Result<()> {
    if body.len() > varint::MAX {
        return Err(CodecError::PacketTooLarge(body.len()));
    }
    buf.push(((packet_type as u8) << 4) | flags);
    varint::encode_to_vec(body.len(), buf);
    buf.extend_from_slice(&body);
    Ok(())
}

fn put_str(body: &mut Vec<u8>, value: &str) {
    body.extend_from_slice(&(value.len() as u16).to_be_bytes());
    body.extend_from_slice(value.as_bytes());
}

fn put_bin(body: &mut Vec<u8>, value: &[u8]) {
    body.extend_from_slice(&(value.len() as u16).to_be_bytes());
    body.extend_from_slice(value);
}

fn encode_connect(p: &Connect, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&PROTOCOL_NAME);
    body.push(version.level());

    let mut flags = 0u8;
    // An empty client id forces a clean session.
    if p.clean_session || p.client_id.is_empty() {
        flags |= 0x02;
    }
    if let Some(ref will) = p.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if p.password.is_some() {
        flags |= 0x40;
    }
    if p.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);

    body.extend_from_slice(&p.keep_alive.to_be_bytes());

    if version.is_v5() {
        match p.properties {
            Some(ref props) => props.encode(&mut body),
            None => body.push(0x00),
        }
    }

    put_str(&mut body, &p.client_id);

    if let Some(ref will) = p.will {
        if version.is_v5() {
            match will.properties {
                Some(ref props) => props.encode(&mut body),
                None => body.push(0x00),
            }
        }
        put_str(&mut body, &will.topic);
        put_bin(&mut body, &will.payload);
    }

    if let Some(ref username) = p.username {
        put_str(&mut body, username);
    }
    if let Some(ref password) = p.password {
        put_bin(&mut body, password);
    }

    frame(PacketType::Connect, 0, body, buf)
}

fn encode_connack(p: &Connack, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    body.push(p.session_present as u8);
    body.push(p.code);
    if version.is_v5() {
        match p.properties {
            Some(ref props) => props.encode(&mut body),
            None => body.push(0x00),
        }
    }
    frame(PacketType::Connack, 0, body, buf)
}

fn encode_publish(p: &Publish, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
    let mut flags = 0u8;
    if p.dup {
        flags |= 0x08;
    }
    flags |= (p.qos as u8) << 1;
    if p.retain {
        flags |= 0x01;
    }

    let mut body = Vec::new();
    put_str(&mut body, &p.topic);

    if p.qos != QoS::AtMostOnce {
        match p.packet_id {
            Some(id) if id != 0 => body.extend_from_slice(&id.to_be_bytes()),
            _ => {
                return Err(CodecError::bad(
                    "PUBLISH with QoS > 0 requires a non-zero packet id",
                ))
            }
        }
    }

    if version.is_v5() {
        match p.properties {
            Some(ref props) => props.encode(&mut body),
            None => body.push(0x00),
        }
    }

    body.extend_from_slice(&p.payload);
    frame(PacketType::Publish, flags, body, buf)
}

fn encode_ack(
    packet_type: PacketType,
    p: &Ack,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<()> {
    let flags = if packet_type == PacketType::Pubrel {
        0x02
    } else {
        0x00
    };

    let mut body = Vec::new();
    body.extend_from_slice(&p.packet_id.to_be_bytes());

    if version.is_v5() {
        match p.properties {
            Some(ref props) => {
                body.push(p.reason_code);
                props.encode(&mut body);
            }
            // Success without properties uses the two byte short form.
            None if p.reason_code != reason_code::SUCCESS => body.push(p.reason_code),
            None => {}
        }
    }

    frame(packet_type, flags, body, buf)
}

fn encode_subscribe(p: &Subscribe, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&p.packet_id.to_be_bytes());

    if version.is_v5() {
        match p.properties {
            Some(ref props) => props.encode(&mut body),
            None => body.push(0x00),
        }
    }

    for topic in &p.topics {
        put_str(&mut body, &topic.name);
        body.push(topic.qos as u8);
    }

    frame(PacketType::Subscribe, 0x02, body, buf)
}

fn encode_suback(p: &Suback, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&p.packet_id.to_be_bytes());
    if version.is_v5() {
        match p.properties {
            Some(ref props) => props.encode(&mut body),
            None => body.push(0x00),
        }
    }
    body.extend_from_slice(&p.codes);
    frame(PacketType::Suback, 0, body, buf)
}

fn encode_unsubscribe(p: &Unsubscribe, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&p.packet_id.to_be_bytes());
    if version.is_v5() {
        match p.properties {
            Some(ref props) => props.encode(&mut body),
            None => body.push(0x00),
        }
    }
    for filter in &p.filters {
        put_str(&mut body, filter);
    }
    frame(PacketType::Unsubscribe, 0x02, body, buf)
}

fn encode_unsuback(p: &Unsuback, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&p.packet_id.to_be_bytes());
    if version.is_v5() {
        match p.properties {
            Some(ref props) => props.encode(&mut body),
            None => body.push(0x00),
        }
        body.extend_from_slice(&p.codes);
    }
    frame(PacketType::Unsuback, 0, body, buf)
}

fn encode_disconnect(p: &Disconnect, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
    if version == ProtocolVersion::V311 {
        buf.push((PacketType::Disconnect as u8) << 4);
        buf.push(0x00);
        return Ok(());
    }

    let mut body = Vec::new();
    body.push(p.reason_code);
    match p.properties {
        Some(ref props) => props.encode(&mut body),
        None => body.push(0x00),
    }
    frame(PacketType::Disconnect, 0, body, buf)
}

fn encode_auth(p: &Auth, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<()> {
    if version == ProtocolVersion::V311 {
        return Err(CodecError::bad("AUTH requires MQTT 5"));
    }
    let mut body = Vec::new();
    body.push(p.reason_code);
    match p.properties {
        Some(ref props) => props.encode(&mut body),
        None => body.push(0x00),
    }
    frame(PacketType::Auth, 0, body, buf)
}
