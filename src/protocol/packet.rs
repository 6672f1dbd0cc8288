//! Control packet types and their version-aware codec.
//!
//! Decoding takes the fixed-header byte plus the already-framed body;
//! encoding builds the variable header and payload into a buffer first and
//! then frames it, so the remaining length is always exact. Decode output
//! is normalized: an empty v5 property block becomes `None`, and
//! `decode(encode(p))` reproduces `p` for every normalized packet.

use crate::error::CodecError;
use crate::protocol::primitives::{
    read_binary, read_string, read_u16, read_u8, read_variable_int_stream, variable_int_len,
    write_binary, write_string, write_u16, write_variable_int,
};
use crate::protocol::properties::{
    AckProperties, AuthProperties, ConnAckProperties, ConnectProperties, DisconnectProperties,
    PublishProperties, SubscribeProperties, UnsubscribeProperties, WillProperties,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PROTOCOL_NAME_V3_1: &str = "MQIsdp";
const PROTOCOL_NAME: &str = "MQTT";

/// Fixed-header flags mandated for packet types with reserved flag bits.
const FLAGS_RESERVED: u8 = 0b0000;
const FLAGS_PUBREL_SUBSCRIBE: u8 = 0b0010;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V3_1,
    V3_1_1,
    V5,
}

impl ProtocolVersion {
    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V3_1 => 3,
            ProtocolVersion::V3_1_1 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProtocolVersion::V3_1 => PROTOCOL_NAME_V3_1,
            _ => PROTOCOL_NAME,
        }
    }

    pub fn is_v5(self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }

    fn from_wire(name: &str, level: u8) -> Result<Self, CodecError> {
        match (name, level) {
            (PROTOCOL_NAME_V3_1, 3) => Ok(ProtocolVersion::V3_1),
            (PROTOCOL_NAME, 4) => Ok(ProtocolVersion::V3_1_1),
            (PROTOCOL_NAME, 5) => Ok(ProtocolVersion::V5),
            (PROTOCOL_NAME | PROTOCOL_NAME_V3_1, level) => {
                Err(CodecError::UnacceptableVersion(level))
            }
            _ => Err(CodecError::Malformed("unknown protocol name")),
        }
    }
}

/// Quality of service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_bits(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(CodecError::Malformed("QoS 3 is invalid")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
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

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            15 => Ok(PacketType::Auth),
            _ => Err(CodecError::Malformed("invalid packet type")),
        }
    }
}

/// Will message registered at CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Option<WillProperties>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub version: ProtocolVersion,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub properties: Option<ConnectProperties>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connack {
    pub session_present: bool,
    pub code: u8,
    pub properties: Option<ConnAckProperties>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub properties: Option<PublishProperties>,
    pub payload: Bytes,
}

/// Shared shape of PUBACK, PUBREC, PUBREL and PUBCOMP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub packet_id: u16,
    pub reason_code: u8,
    pub properties: Option<AckProperties>,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: 0,
            properties: None,
        }
    }

    pub fn with_reason(packet_id: u16, reason_code: u8) -> Self {
        Self {
            packet_id,
            reason_code,
            properties: None,
        }
    }
}

/// How retained messages are replayed for a new subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RetainHandling {
    #[default]
    SendAtSubscribe = 0,
    SendIfNew = 1,
    DontSend = 2,
}

impl RetainHandling {
    fn from_bits(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(RetainHandling::SendAtSubscribe),
            1 => Ok(RetainHandling::SendIfNew),
            2 => Ok(RetainHandling::DontSend),
            _ => Err(CodecError::Protocol("retain handling 3 is invalid")),
        }
    }
}

/// One (filter, options) pair in a SUBSCRIBE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub filter: String,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionRequest {
    fn decode_options(byte: u8, version: ProtocolVersion) -> Result<(QoS, bool, bool, RetainHandling), CodecError> {
        let qos = QoS::from_bits(byte & 0b0000_0011).map_err(|_| {
            CodecError::Protocol("subscription QoS 3 is invalid")
        })?;
        if version.is_v5() {
            if byte & 0b1100_0000 != 0 {
                return Err(CodecError::Malformed("reserved subscription option bits"));
            }
            let no_local = byte & 0b0000_0100 != 0;
            let rap = byte & 0b0000_1000 != 0;
            let rh = RetainHandling::from_bits((byte >> 4) & 0b0000_0011)?;
            Ok((qos, no_local, rap, rh))
        } else {
            if byte & 0b1111_1100 != 0 {
                return Err(CodecError::Malformed("reserved subscription option bits"));
            }
            Ok((qos, false, false, RetainHandling::SendAtSubscribe))
        }
    }

    fn options_byte(&self, version: ProtocolVersion) -> u8 {
        let mut byte = self.qos as u8;
        if version.is_v5() {
            if self.no_local {
                byte |= 0b0000_0100;
            }
            if self.retain_as_published {
                byte |= 0b0000_1000;
            }
            byte |= (self.retain_handling as u8) << 4;
        }
        byte
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub properties: Option<SubscribeProperties>,
    pub filters: Vec<SubscriptionRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub properties: Option<AckProperties>,
    pub codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub properties: Option<UnsubscribeProperties>,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub properties: Option<AckProperties>,
    /// Per-filter reason codes; always empty for 3.x.
    pub codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: u8,
    pub properties: Option<DisconnectProperties>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Auth {
    pub reason_code: u8,
    pub properties: Option<AuthProperties>,
}

/// Every MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
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
            Packet::Connack(_) => PacketType::Connack,
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

    /// Decode a packet from the fixed-header byte and the framed body.
    ///
    /// `version` governs version-conditional payload shapes; CONNECT reads
    /// its version from the body and ignores the argument.
    pub fn decode(first: u8, body: &[u8], version: ProtocolVersion) -> Result<Self, CodecError> {
        let packet_type = PacketType::try_from(first >> 4)?;
        let flags = first & 0x0F;
        let required = match packet_type {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => {
                Some(FLAGS_PUBREL_SUBSCRIBE)
            }
            _ => Some(FLAGS_RESERVED),
        };
        if let Some(required) = required {
            if flags != required {
                return Err(CodecError::Malformed("reserved fixed-header flags"));
            }
        }

        let mut cursor = 0;
        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(decode_connect(body, &mut cursor)?),
            PacketType::Connack => Packet::Connack(decode_connack(body, &mut cursor, version)?),
            PacketType::Publish => {
                return decode_publish(flags, body, version).map(Packet::Publish);
            }
            PacketType::PubAck => Packet::PubAck(decode_ack(body, &mut cursor, version)?),
            PacketType::PubRec => Packet::PubRec(decode_ack(body, &mut cursor, version)?),
            PacketType::PubRel => Packet::PubRel(decode_ack(body, &mut cursor, version)?),
            PacketType::PubComp => Packet::PubComp(decode_ack(body, &mut cursor, version)?),
            PacketType::Subscribe => Packet::Subscribe(decode_subscribe(body, &mut cursor, version)?),
            PacketType::SubAck => Packet::SubAck(decode_suback(body, &mut cursor, version)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(decode_unsubscribe(body, &mut cursor, version)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(decode_unsuback(body, &mut cursor, version)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => {
                Packet::Disconnect(decode_disconnect(body, &mut cursor, version)?)
            }
            PacketType::Auth => {
                if !version.is_v5() {
                    return Err(CodecError::Protocol("AUTH requires MQTT 5"));
                }
                Packet::Auth(decode_auth(body, &mut cursor)?)
            }
        };
        if cursor != body.len() {
            return Err(CodecError::Malformed("trailing bytes after packet"));
        }
        Ok(packet)
    }

    /// Encode into a complete frame: fixed header, remaining length, body.
    pub fn encode(&self, version: ProtocolVersion) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::new();
        let first = match self {
            Packet::Connect(p) => {
                encode_connect(p, &mut body)?;
                (PacketType::Connect as u8) << 4
            }
            Packet::Connack(p) => {
                encode_connack(p, &mut body, version)?;
                (PacketType::Connack as u8) << 4
            }
            Packet::Publish(p) => {
                encode_publish_body(p, &mut body, version)?;
                let mut flags = (p.qos as u8) << 1;
                if p.dup {
                    flags |= 0b1000;
                }
                if p.retain {
                    flags |= 0b0001;
                }
                (PacketType::Publish as u8) << 4 | flags
            }
            Packet::PubAck(p) => {
                encode_ack(p, &mut body, version)?;
                (PacketType::PubAck as u8) << 4
            }
            Packet::PubRec(p) => {
                encode_ack(p, &mut body, version)?;
                (PacketType::PubRec as u8) << 4
            }
            Packet::PubRel(p) => {
                encode_ack(p, &mut body, version)?;
                (PacketType::PubRel as u8) << 4 | FLAGS_PUBREL_SUBSCRIBE
            }
            Packet::PubComp(p) => {
                encode_ack(p, &mut body, version)?;
                (PacketType::PubComp as u8) << 4
            }
            Packet::Subscribe(p) => {
                encode_subscribe(p, &mut body, version)?;
                (PacketType::Subscribe as u8) << 4 | FLAGS_PUBREL_SUBSCRIBE
            }
            Packet::SubAck(p) => {
                encode_suback(p, &mut body, version)?;
                (PacketType::SubAck as u8) << 4
            }
            Packet::Unsubscribe(p) => {
                encode_unsubscribe(p, &mut body, version)?;
                (PacketType::Unsubscribe as u8) << 4 | FLAGS_PUBREL_SUBSCRIBE
            }
            Packet::UnsubAck(p) => {
                encode_unsuback(p, &mut body, version)?;
                (PacketType::UnsubAck as u8) << 4
            }
            Packet::PingReq => (PacketType::PingReq as u8) << 4,
            Packet::PingResp => (PacketType::PingResp as u8) << 4,
            Packet::Disconnect(p) => {
                encode_disconnect(p, &mut body, version)?;
                (PacketType::Disconnect as u8) << 4
            }
            Packet::Auth(p) => {
                if !version.is_v5() {
                    return Err(CodecError::Protocol("AUTH requires MQTT 5"));
                }
                encode_auth(p, &mut body)?;
                (PacketType::Auth as u8) << 4
            }
        };
        let mut frame = Vec::with_capacity(1 + 4 + body.len());
        frame.push(first);
        write_variable_int(&mut frame, body.len() as u32)?;
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

fn decode_connect(body: &[u8], cursor: &mut usize) -> Result<Connect, CodecError> {
    let name = read_string(body, cursor)?;
    let level = read_u8(body, cursor)?;
    let version = ProtocolVersion::from_wire(&name, level)?;

    let flags = read_u8(body, cursor)?;
    if flags & 0b0000_0001 != 0 {
        return Err(CodecError::Malformed("connect reserved flag set"));
    }
    let clean_start = flags & 0b0000_0010 != 0;
    let will_flag = flags & 0b0000_0100 != 0;
    let will_qos_bits = (flags >> 3) & 0b0000_0011;
    let will_retain = flags & 0b0010_0000 != 0;
    let password_flag = flags & 0b0100_0000 != 0;
    let username_flag = flags & 0b1000_0000 != 0;
    if !will_flag && (will_qos_bits != 0 || will_retain) {
        return Err(CodecError::Malformed("will flags without will"));
    }
    let will_qos = QoS::from_bits(will_qos_bits)?;
    if password_flag && !username_flag && !version.is_v5() {
        return Err(CodecError::Malformed("password without username"));
    }

    let keep_alive = read_u16(body, cursor)?;
    let properties = if version.is_v5() {
        normalized(ConnectProperties::decode(body, cursor)?, ConnectProperties::default())
    } else {
        None
    };

    let client_id = read_string(body, cursor)?;
    let will = if will_flag {
        let will_properties = if version.is_v5() {
            normalized(WillProperties::decode(body, cursor)?, WillProperties::default())
        } else {
            None
        };
        let topic = read_string(body, cursor)?;
        let payload = Bytes::copy_from_slice(read_binary(body, cursor)?);
        Some(LastWill {
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
        Some(read_string(body, cursor)?)
    } else {
        None
    };
    let password = if password_flag {
        Some(Bytes::copy_from_slice(read_binary(body, cursor)?))
    } else {
        None
    };

    Ok(Connect {
        version,
        clean_start,
        keep_alive,
        client_id,
        will,
        username,
        password,
        properties,
    })
}

fn encode_connect(p: &Connect, body: &mut Vec<u8>) -> Result<(), CodecError> {
    write_string(body, p.version.name());
    body.push(p.version.level());

    let mut flags = 0u8;
    if p.clean_start {
        flags |= 0b0000_0010;
    }
    if let Some(will) = &p.will {
        flags |= 0b0000_0100;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0b0010_0000;
        }
    }
    if p.password.is_some() {
        flags |= 0b0100_0000;
    }
    if p.username.is_some() {
        flags |= 0b1000_0000;
    }
    body.push(flags);
    write_u16(body, p.keep_alive);
    if p.version.is_v5() {
        p.properties.clone().unwrap_or_default().encode_into(body)?;
    }

    write_string(body, &p.client_id);
    if let Some(will) = &p.will {
        if p.version.is_v5() {
            will.properties.clone().unwrap_or_default().encode_into(body)?;
        }
        write_string(body, &will.topic);
        write_binary(body, &will.payload);
    }
    if let Some(username) = &p.username {
        write_string(body, username);
    }
    if let Some(password) = &p.password {
        write_binary(body, password);
    }
    Ok(())
}

fn decode_connack(
    body: &[u8],
    cursor: &mut usize,
    version: ProtocolVersion,
) -> Result<Connack, CodecError> {
    let flags = read_u8(body, cursor)?;
    if flags & 0b1111_1110 != 0 {
        return Err(CodecError::Malformed("connack reserved flags"));
    }
    let session_present = flags & 0b0000_0001 != 0;
    let code = read_u8(body, cursor)?;
    let properties = if version.is_v5() {
        normalized(ConnAckProperties::decode(body, cursor)?, ConnAckProperties::default())
    } else {
        None
    };
    Ok(Connack {
        session_present,
        code,
        properties,
    })
}

fn encode_connack(p: &Connack, body: &mut Vec<u8>, version: ProtocolVersion) -> Result<(), CodecError> {
    body.push(u8::from(p.session_present));
    body.push(p.code);
    if version.is_v5() {
        p.properties.clone().unwrap_or_default().encode_into(body)?;
    }
    Ok(())
}

fn decode_publish(flags: u8, body: &[u8], version: ProtocolVersion) -> Result<Publish, CodecError> {
    let retain = flags & 0b0001 != 0;
    let qos = QoS::from_bits((flags >> 1) & 0b0011)?;
    let dup = flags & 0b1000 != 0;
    if dup && qos == QoS::AtMostOnce {
        return Err(CodecError::Malformed("DUP set on QoS 0 publish"));
    }

    let mut cursor = 0;
    let topic = read_string(body, &mut cursor)?;
    if topic.is_empty() && !version.is_v5() {
        return Err(CodecError::Protocol("empty topic name"));
    }
    let packet_id = if qos != QoS::AtMostOnce {
        let pid = read_u16(body, &mut cursor)?;
        if pid == 0 {
            return Err(CodecError::Protocol("zero packet identifier"));
        }
        Some(pid)
    } else {
        None
    };
    let properties = if version.is_v5() {
        normalized(
            PublishProperties::decode(body, &mut cursor)?,
            PublishProperties::default(),
        )
    } else {
        None
    };
    let payload = Bytes::copy_from_slice(&body[cursor..]);
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

fn encode_publish_body(
    p: &Publish,
    body: &mut Vec<u8>,
    version: ProtocolVersion,
) -> Result<(), CodecError> {
    write_string(body, &p.topic);
    if p.qos != QoS::AtMostOnce {
        let pid = p
            .packet_id
            .ok_or(CodecError::Protocol("publish without packet identifier"))?;
        write_u16(body, pid);
    }
    if version.is_v5() {
        p.properties.clone().unwrap_or_default().encode_into(body)?;
    }
    body.extend_from_slice(&p.payload);
    Ok(())
}

fn decode_ack(body: &[u8], cursor: &mut usize, version: ProtocolVersion) -> Result<Ack, CodecError> {
    let packet_id = read_u16(body, cursor)?;
    if packet_id == 0 {
        return Err(CodecError::Protocol("zero packet identifier"));
    }
    let mut ack = Ack::new(packet_id);
    if version.is_v5() && *cursor < body.len() {
        ack.reason_code = read_u8(body, cursor)?;
        if *cursor < body.len() {
            ack.properties = normalized(AckProperties::decode(body, cursor)?, AckProperties::default());
        }
    }
    Ok(ack)
}

fn encode_ack(p: &Ack, body: &mut Vec<u8>, version: ProtocolVersion) -> Result<(), CodecError> {
    write_u16(body, p.packet_id);
    if version.is_v5() {
        match &p.properties {
            Some(props) if !props.is_empty() => {
                body.push(p.reason_code);
                props.encode_into(body)?;
            }
            _ if p.reason_code != 0 => body.push(p.reason_code),
            _ => {}
        }
    }
    Ok(())
}

fn decode_subscribe(
    body: &[u8],
    cursor: &mut usize,
    version: ProtocolVersion,
) -> Result<Subscribe, CodecError> {
    let packet_id = read_u16(body, cursor)?;
    if packet_id == 0 {
        return Err(CodecError::Protocol("zero packet identifier"));
    }
    let properties = if version.is_v5() {
        normalized(
            SubscribeProperties::decode(body, cursor)?,
            SubscribeProperties::default(),
        )
    } else {
        None
    };
    let mut filters = Vec::new();
    while *cursor < body.len() {
        let filter = read_string(body, cursor)?;
        let options = read_u8(body, cursor)?;
        let (qos, no_local, retain_as_published, retain_handling) =
            SubscriptionRequest::decode_options(options, version)?;
        filters.push(SubscriptionRequest {
            filter,
            qos,
            no_local,
            retain_as_published,
            retain_handling,
        });
    }
    if filters.is_empty() {
        return Err(CodecError::Protocol("empty subscription list"));
    }
    Ok(Subscribe {
        packet_id,
        properties,
        filters,
    })
}

fn encode_subscribe(
    p: &Subscribe,
    body: &mut Vec<u8>,
    version: ProtocolVersion,
) -> Result<(), CodecError> {
    write_u16(body, p.packet_id);
    if version.is_v5() {
        p.properties.clone().unwrap_or_default().encode_into(body)?;
    }
    for sub in &p.filters {
        write_string(body, &sub.filter);
        body.push(sub.options_byte(version));
    }
    Ok(())
}

fn decode_suback(
    body: &[u8],
    cursor: &mut usize,
    version: ProtocolVersion,
) -> Result<SubAck, CodecError> {
    let packet_id = read_u16(body, cursor)?;
    let properties = if version.is_v5() {
        normalized(AckProperties::decode(body, cursor)?, AckProperties::default())
    } else {
        None
    };
    let codes = body[*cursor..].to_vec();
    *cursor = body.len();
    if codes.is_empty() {
        return Err(CodecError::Protocol("SUBACK without reason codes"));
    }
    Ok(SubAck {
        packet_id,
        properties,
        codes,
    })
}

fn encode_suback(p: &SubAck, body: &mut Vec<u8>, version: ProtocolVersion) -> Result<(), CodecError> {
    write_u16(body, p.packet_id);
    if version.is_v5() {
        p.properties.clone().unwrap_or_default().encode_into(body)?;
    }
    body.extend_from_slice(&p.codes);
    Ok(())
}

fn decode_unsubscribe(
    body: &[u8],
    cursor: &mut usize,
    version: ProtocolVersion,
) -> Result<Unsubscribe, CodecError> {
    let packet_id = read_u16(body, cursor)?;
    if packet_id == 0 {
        return Err(CodecError::Protocol("zero packet identifier"));
    }
    let properties = if version.is_v5() {
        normalized(
            UnsubscribeProperties::decode(body, cursor)?,
            UnsubscribeProperties::default(),
        )
    } else {
        None
    };
    let mut filters = Vec::new();
    while *cursor < body.len() {
        filters.push(read_string(body, cursor)?);
    }
    if filters.is_empty() {
        return Err(CodecError::Protocol("empty unsubscribe list"));
    }
    Ok(Unsubscribe {
        packet_id,
        properties,
        filters,
    })
}

fn encode_unsubscribe(
    p: &Unsubscribe,
    body: &mut Vec<u8>,
    version: ProtocolVersion,
) -> Result<(), CodecError> {
    write_u16(body, p.packet_id);
    if version.is_v5() {
        p.properties.clone().unwrap_or_default().encode_into(body)?;
    }
    for filter in &p.filters {
        write_string(body, filter);
    }
    Ok(())
}

fn decode_unsuback(
    body: &[u8],
    cursor: &mut usize,
    version: ProtocolVersion,
) -> Result<UnsubAck, CodecError> {
    let packet_id = read_u16(body, cursor)?;
    let (properties, codes) = if version.is_v5() {
        let props = normalized(AckProperties::decode(body, cursor)?, AckProperties::default());
        let codes = body[*cursor..].to_vec();
        *cursor = body.len();
        if codes.is_empty() {
            return Err(CodecError::Protocol("UNSUBACK without reason codes"));
        }
        (props, codes)
    } else {
        (None, Vec::new())
    };
    Ok(UnsubAck {
        packet_id,
        properties,
        codes,
    })
}

fn encode_unsuback(
    p: &UnsubAck,
    body: &mut Vec<u8>,
    version: ProtocolVersion,
) -> Result<(), CodecError> {
    write_u16(body, p.packet_id);
    if version.is_v5() {
        p.properties.clone().unwrap_or_default().encode_into(body)?;
        body.extend_from_slice(&p.codes);
    }
    Ok(())
}

fn decode_disconnect(
    body: &[u8],
    cursor: &mut usize,
    version: ProtocolVersion,
) -> Result<Disconnect, CodecError> {
    let mut packet = Disconnect::default();
    if version.is_v5() && *cursor < body.len() {
        packet.reason_code = read_u8(body, cursor)?;
        if *cursor < body.len() {
            packet.properties = normalized(
                DisconnectProperties::decode(body, cursor)?,
                DisconnectProperties::default(),
            );
        }
    }
    Ok(packet)
}

fn encode_disconnect(
    p: &Disconnect,
    body: &mut Vec<u8>,
    version: ProtocolVersion,
) -> Result<(), CodecError> {
    if version.is_v5() {
        match &p.properties {
            Some(props) => {
                body.push(p.reason_code);
                props.encode_into(body)?;
            }
            None if p.reason_code != 0 => body.push(p.reason_code),
            None => {}
        }
    }
    Ok(())
}

fn decode_auth(body: &[u8], cursor: &mut usize) -> Result<Auth, CodecError> {
    let mut packet = Auth::default();
    if *cursor < body.len() {
        packet.reason_code = read_u8(body, cursor)?;
        if *cursor < body.len() {
            packet.properties =
                normalized(AuthProperties::decode(body, cursor)?, AuthProperties::default());
        }
    }
    Ok(packet)
}

fn encode_auth(p: &Auth, body: &mut Vec<u8>) -> Result<(), CodecError> {
    match &p.properties {
        Some(props) => {
            body.push(p.reason_code);
            props.encode_into(body)?;
        }
        None if p.reason_code != 0 => body.push(p.reason_code),
        None => {}
    }
    Ok(())
}

/// Collapse an empty property block to `None` so decode output is canonical.
fn normalized<T: PartialEq>(decoded: T, empty: T) -> Option<T> {
    if decoded == empty {
        None
    } else {
        Some(decoded)
    }
}

/// Read one framed packet off a stream, enforcing `max_packet_size` before
/// the body is pulled in.
pub async fn read_packet<S: AsyncRead + Unpin>(
    stream: &mut S,
    version: ProtocolVersion,
    max_packet_size: usize,
) -> Result<Packet, CodecError> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;
    let remaining = read_variable_int_stream(stream).await? as usize;
    let total = 1 + variable_int_len(remaining as u32) + remaining;
    if total > max_packet_size {
        return Err(CodecError::PacketTooLarge {
            size: total,
            limit: max_packet_size,
        });
    }
    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await?;
    Packet::decode(first[0], &body, version)
}

/// Encode and write one packet.
pub async fn write_packet<S: AsyncWrite + Unpin>(
    stream: &mut S,
    packet: &Packet,
    version: ProtocolVersion,
) -> Result<(), CodecError> {
    let frame = packet.encode(version)?;
    stream.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet, version: ProtocolVersion) -> Packet {
        let frame = packet.encode(version).unwrap();
        let remaining = frame.len() - 2; // single-byte length in these tests
        assert_eq!(frame[1] as usize, remaining, "remaining length");
        Packet::decode(frame[0], &frame[2..], version).unwrap()
    }

    #[test]
    fn connect_reserved_flag_is_malformed() {
        let mut body = Vec::new();
        write_string(&mut body, "MQTT");
        body.push(4);
        body.push(0b0000_0011); // clean session + reserved bit
        write_u16(&mut body, 30);
        write_string(&mut body, "c1");
        let err = Packet::decode(0x10, &body, ProtocolVersion::V3_1_1).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn connect_unknown_level_is_unacceptable() {
        let mut body = Vec::new();
        write_string(&mut body, "MQTT");
        body.push(6);
        body.push(0b0000_0010);
        write_u16(&mut body, 30);
        write_string(&mut body, "c1");
        match Packet::decode(0x10, &body, ProtocolVersion::V3_1_1) {
            Err(CodecError::UnacceptableVersion(6)) => {}
            other => panic!("expected UnacceptableVersion, got {other:?}"),
        }
    }

    #[test]
    fn connect_round_trip_with_will() {
        let connect = Connect {
            version: ProtocolVersion::V3_1_1,
            clean_start: false,
            keep_alive: 60,
            client_id: "sensor-7".into(),
            will: Some(LastWill {
                topic: "state/sensor-7".into(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
                properties: None,
            }),
            username: Some("u".into()),
            password: Some(Bytes::from_static(b"p")),
            properties: None,
        };
        let decoded = round_trip(Packet::Connect(connect.clone()), ProtocolVersion::V3_1_1);
        assert_eq!(decoded, Packet::Connect(connect));
    }

    #[test]
    fn publish_qos3_is_malformed() {
        let mut body = Vec::new();
        write_string(&mut body, "a");
        // flags 0b0110 = QoS 3
        assert!(Packet::decode(0x36, &body, ProtocolVersion::V3_1_1).is_err());
    }

    #[test]
    fn publish_zero_pid_is_protocol_error() {
        let mut body = Vec::new();
        write_string(&mut body, "a");
        write_u16(&mut body, 0);
        match Packet::decode(0x32, &body, ProtocolVersion::V3_1_1) {
            Err(CodecError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn pubrel_requires_flag_two() {
        let mut body = Vec::new();
        write_u16(&mut body, 9);
        assert!(Packet::decode(0x60, &body, ProtocolVersion::V3_1_1).is_err());
        assert!(Packet::decode(0x62, &body, ProtocolVersion::V3_1_1).is_ok());
    }

    #[test]
    fn subscribe_empty_list_is_protocol_error() {
        let mut body = Vec::new();
        write_u16(&mut body, 5);
        match Packet::decode(0x82, &body, ProtocolVersion::V3_1_1) {
            Err(CodecError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_v5_options_round_trip() {
        let subscribe = Subscribe {
            packet_id: 11,
            properties: Some(SubscribeProperties {
                subscription_identifier: Some(7),
                user_properties: Vec::new(),
            }),
            filters: vec![SubscriptionRequest {
                filter: "a/+".into(),
                qos: QoS::ExactlyOnce,
                no_local: true,
                retain_as_published: true,
                retain_handling: RetainHandling::SendIfNew,
            }],
        };
        let decoded = round_trip(Packet::Subscribe(subscribe.clone()), ProtocolVersion::V5);
        assert_eq!(decoded, Packet::Subscribe(subscribe));
    }

    #[test]
    fn ack_v5_reason_round_trip() {
        let ack = Ack::with_reason(3, 0x10);
        let decoded = round_trip(Packet::PubAck(ack.clone()), ProtocolVersion::V5);
        assert_eq!(decoded, Packet::PubAck(ack));
        // Short form: success with no properties is two bytes.
        let short = Packet::PubAck(Ack::new(3)).encode(ProtocolVersion::V5).unwrap();
        assert_eq!(short.len(), 4);
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut body = Vec::new();
        write_u16(&mut body, 3);
        body.push(0xFF);
        assert!(Packet::decode(0x40, &body, ProtocolVersion::V3_1_1).is_err());
    }

    #[test]
    fn auth_rejected_below_v5() {
        assert!(Packet::decode(0xF0, &[], ProtocolVersion::V3_1_1).is_err());
    }
}
