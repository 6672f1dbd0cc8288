//! MQTT 5 property blocks, one struct per packet context.
//!
//! Every block decodes from a variable-length-prefixed region and encodes
//! back to the identical bytes; duplicate identifiers and identifiers that
//! do not belong to the context are protocol errors.

use crate::error::CodecError;
use crate::protocol::primitives::{
    read_binary, read_string, read_u16, read_u32, read_u8, read_variable_int, write_binary,
    write_string, write_u16, write_u32, write_variable_int,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// Property identifiers (MQTT 5.0 §2.2.2.2).
const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
const CONTENT_TYPE: u8 = 0x03;
const RESPONSE_TOPIC: u8 = 0x08;
const CORRELATION_DATA: u8 = 0x09;
const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
const SERVER_KEEP_ALIVE: u8 = 0x13;
const AUTHENTICATION_METHOD: u8 = 0x15;
const AUTHENTICATION_DATA: u8 = 0x16;
const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
const WILL_DELAY_INTERVAL: u8 = 0x18;
const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
const RESPONSE_INFORMATION: u8 = 0x1A;
const SERVER_REFERENCE: u8 = 0x1C;
const REASON_STRING: u8 = 0x1F;
const RECEIVE_MAXIMUM: u8 = 0x21;
const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
const TOPIC_ALIAS: u8 = 0x23;
const MAXIMUM_QOS: u8 = 0x24;
const RETAIN_AVAILABLE: u8 = 0x25;
const USER_PROPERTY: u8 = 0x26;
const MAXIMUM_PACKET_SIZE: u8 = 0x27;
const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;

/// Carve the property region out of `buf` and hand each (id, region,
/// cursor) to `visit`. Enforces the declared length exactly.
fn walk<F>(buf: &[u8], cursor: &mut usize, mut visit: F) -> Result<(), CodecError>
where
    F: FnMut(u8, &[u8], &mut usize) -> Result<(), CodecError>,
{
    let len = read_variable_int(buf, cursor)? as usize;
    if buf.len() < *cursor + len {
        return Err(CodecError::Malformed("truncated property block"));
    }
    let end = *cursor + len;
    while *cursor < end {
        let id = read_u8(buf, cursor)?;
        visit(id, buf, cursor)?;
        if *cursor > end {
            return Err(CodecError::Malformed("property overruns its block"));
        }
    }
    Ok(())
}

/// Write `fields` as a variable-length-prefixed property block.
fn emit(body: &mut Vec<u8>, fields: Vec<u8>) -> Result<(), CodecError> {
    write_variable_int(body, fields.len() as u32)?;
    body.extend_from_slice(&fields);
    Ok(())
}

fn set_once<T>(slot: &mut Option<T>, value: T) -> Result<(), CodecError> {
    if slot.is_some() {
        return Err(CodecError::Protocol("duplicate property"));
    }
    *slot = Some(value);
    Ok(())
}

fn write_user_properties(fields: &mut Vec<u8>, pairs: &[(String, String)]) {
    for (k, v) in pairs {
        fields.push(USER_PROPERTY);
        write_string(fields, k);
        write_string(fields, v);
    }
}

fn read_user_property(buf: &[u8], cursor: &mut usize) -> Result<(String, String), CodecError> {
    let k = read_string(buf, cursor)?;
    let v = read_string(buf, cursor)?;
    Ok((k, v))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub request_response_information: Option<u8>,
    pub request_problem_information: Option<u8>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
}

impl ConnectProperties {
    pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut p = Self::default();
        walk(buf, cursor, |id, buf, cursor| match id {
            SESSION_EXPIRY_INTERVAL => {
                set_once(&mut p.session_expiry_interval, read_u32(buf, cursor)?)
            }
            RECEIVE_MAXIMUM => set_once(&mut p.receive_maximum, read_u16(buf, cursor)?),
            MAXIMUM_PACKET_SIZE => set_once(&mut p.maximum_packet_size, read_u32(buf, cursor)?),
            TOPIC_ALIAS_MAXIMUM => set_once(&mut p.topic_alias_maximum, read_u16(buf, cursor)?),
            REQUEST_RESPONSE_INFORMATION => {
                set_once(&mut p.request_response_information, read_u8(buf, cursor)?)
            }
            REQUEST_PROBLEM_INFORMATION => {
                set_once(&mut p.request_problem_information, read_u8(buf, cursor)?)
            }
            AUTHENTICATION_METHOD => {
                set_once(&mut p.authentication_method, read_string(buf, cursor)?)
            }
            AUTHENTICATION_DATA => set_once(
                &mut p.authentication_data,
                Bytes::copy_from_slice(read_binary(buf, cursor)?),
            ),
            USER_PROPERTY => {
                p.user_properties.push(read_user_property(buf, cursor)?);
                Ok(())
            }
            _ => Err(CodecError::Protocol("unexpected CONNECT property")),
        })?;
        Ok(p)
    }

    pub fn encode_into(&self, body: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut f = Vec::new();
        if let Some(v) = self.session_expiry_interval {
            f.push(SESSION_EXPIRY_INTERVAL);
            write_u32(&mut f, v);
        }
        if let Some(v) = self.receive_maximum {
            f.push(RECEIVE_MAXIMUM);
            write_u16(&mut f, v);
        }
        if let Some(v) = self.maximum_packet_size {
            f.push(MAXIMUM_PACKET_SIZE);
            write_u32(&mut f, v);
        }
        if let Some(v) = self.topic_alias_maximum {
            f.push(TOPIC_ALIAS_MAXIMUM);
            write_u16(&mut f, v);
        }
        if let Some(v) = self.request_response_information {
            f.push(REQUEST_RESPONSE_INFORMATION);
            f.push(v);
        }
        if let Some(v) = self.request_problem_information {
            f.push(REQUEST_PROBLEM_INFORMATION);
            f.push(v);
        }
        if let Some(v) = &self.authentication_method {
            f.push(AUTHENTICATION_METHOD);
            write_string(&mut f, v);
        }
        if let Some(v) = &self.authentication_data {
            f.push(AUTHENTICATION_DATA);
            write_binary(&mut f, v);
        }
        write_user_properties(&mut f, &self.user_properties);
        emit(body, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillProperties {
    pub will_delay_interval: Option<u32>,
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
}

impl WillProperties {
    pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut p = Self::default();
        walk(buf, cursor, |id, buf, cursor| match id {
            WILL_DELAY_INTERVAL => set_once(&mut p.will_delay_interval, read_u32(buf, cursor)?),
            PAYLOAD_FORMAT_INDICATOR => {
                set_once(&mut p.payload_format_indicator, read_u8(buf, cursor)?)
            }
            MESSAGE_EXPIRY_INTERVAL => {
                set_once(&mut p.message_expiry_interval, read_u32(buf, cursor)?)
            }
            CONTENT_TYPE => set_once(&mut p.content_type, read_string(buf, cursor)?),
            RESPONSE_TOPIC => set_once(&mut p.response_topic, read_string(buf, cursor)?),
            CORRELATION_DATA => set_once(
                &mut p.correlation_data,
                Bytes::copy_from_slice(read_binary(buf, cursor)?),
            ),
            USER_PROPERTY => {
                p.user_properties.push(read_user_property(buf, cursor)?);
                Ok(())
            }
            _ => Err(CodecError::Protocol("unexpected Will property")),
        })?;
        Ok(p)
    }

    pub fn encode_into(&self, body: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut f = Vec::new();
        if let Some(v) = self.will_delay_interval {
            f.push(WILL_DELAY_INTERVAL);
            write_u32(&mut f, v);
        }
        if let Some(v) = self.payload_format_indicator {
            f.push(PAYLOAD_FORMAT_INDICATOR);
            f.push(v);
        }
        if let Some(v) = self.message_expiry_interval {
            f.push(MESSAGE_EXPIRY_INTERVAL);
            write_u32(&mut f, v);
        }
        if let Some(v) = &self.content_type {
            f.push(CONTENT_TYPE);
            write_string(&mut f, v);
        }
        if let Some(v) = &self.response_topic {
            f.push(RESPONSE_TOPIC);
            write_string(&mut f, v);
        }
        if let Some(v) = &self.correlation_data {
            f.push(CORRELATION_DATA);
            write_binary(&mut f, v);
        }
        write_user_properties(&mut f, &self.user_properties);
        emit(body, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnAckProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub maximum_packet_size: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub topic_alias_maximum: Option<u16>,
    pub reason_string: Option<String>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
    pub server_keep_alive: Option<u16>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
}

impl ConnAckProperties {
    pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut p = Self::default();
        walk(buf, cursor, |id, buf, cursor| match id {
            SESSION_EXPIRY_INTERVAL => {
                set_once(&mut p.session_expiry_interval, read_u32(buf, cursor)?)
            }
            RECEIVE_MAXIMUM => set_once(&mut p.receive_maximum, read_u16(buf, cursor)?),
            MAXIMUM_QOS => set_once(&mut p.maximum_qos, read_u8(buf, cursor)?),
            RETAIN_AVAILABLE => set_once(&mut p.retain_available, read_u8(buf, cursor)?),
            MAXIMUM_PACKET_SIZE => set_once(&mut p.maximum_packet_size, read_u32(buf, cursor)?),
            ASSIGNED_CLIENT_IDENTIFIER => {
                set_once(&mut p.assigned_client_identifier, read_string(buf, cursor)?)
            }
            TOPIC_ALIAS_MAXIMUM => set_once(&mut p.topic_alias_maximum, read_u16(buf, cursor)?),
            REASON_STRING => set_once(&mut p.reason_string, read_string(buf, cursor)?),
            WILDCARD_SUBSCRIPTION_AVAILABLE => set_once(
                &mut p.wildcard_subscription_available,
                read_u8(buf, cursor)?,
            ),
            SUBSCRIPTION_IDENTIFIER_AVAILABLE => set_once(
                &mut p.subscription_identifier_available,
                read_u8(buf, cursor)?,
            ),
            SHARED_SUBSCRIPTION_AVAILABLE => {
                set_once(&mut p.shared_subscription_available, read_u8(buf, cursor)?)
            }
            SERVER_KEEP_ALIVE => set_once(&mut p.server_keep_alive, read_u16(buf, cursor)?),
            RESPONSE_INFORMATION => set_once(&mut p.response_information, read_string(buf, cursor)?),
            SERVER_REFERENCE => set_once(&mut p.server_reference, read_string(buf, cursor)?),
            AUTHENTICATION_METHOD => {
                set_once(&mut p.authentication_method, read_string(buf, cursor)?)
            }
            AUTHENTICATION_DATA => set_once(
                &mut p.authentication_data,
                Bytes::copy_from_slice(read_binary(buf, cursor)?),
            ),
            USER_PROPERTY => {
                p.user_properties.push(read_user_property(buf, cursor)?);
                Ok(())
            }
            _ => Err(CodecError::Protocol("unexpected CONNACK property")),
        })?;
        Ok(p)
    }

    pub fn encode_into(&self, body: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut f = Vec::new();
        if let Some(v) = self.session_expiry_interval {
            f.push(SESSION_EXPIRY_INTERVAL);
            write_u32(&mut f, v);
        }
        if let Some(v) = self.receive_maximum {
            f.push(RECEIVE_MAXIMUM);
            write_u16(&mut f, v);
        }
        if let Some(v) = self.maximum_qos {
            f.push(MAXIMUM_QOS);
            f.push(v);
        }
        if let Some(v) = self.retain_available {
            f.push(RETAIN_AVAILABLE);
            f.push(v);
        }
        if let Some(v) = self.maximum_packet_size {
            f.push(MAXIMUM_PACKET_SIZE);
            write_u32(&mut f, v);
        }
        if let Some(v) = &self.assigned_client_identifier {
            f.push(ASSIGNED_CLIENT_IDENTIFIER);
            write_string(&mut f, v);
        }
        if let Some(v) = self.topic_alias_maximum {
            f.push(TOPIC_ALIAS_MAXIMUM);
            write_u16(&mut f, v);
        }
        if let Some(v) = &self.reason_string {
            f.push(REASON_STRING);
            write_string(&mut f, v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            f.push(WILDCARD_SUBSCRIPTION_AVAILABLE);
            f.push(v);
        }
        if let Some(v) = self.subscription_identifier_available {
            f.push(SUBSCRIPTION_IDENTIFIER_AVAILABLE);
            f.push(v);
        }
        if let Some(v) = self.shared_subscription_available {
            f.push(SHARED_SUBSCRIPTION_AVAILABLE);
            f.push(v);
        }
        if let Some(v) = self.server_keep_alive {
            f.push(SERVER_KEEP_ALIVE);
            write_u16(&mut f, v);
        }
        if let Some(v) = &self.response_information {
            f.push(RESPONSE_INFORMATION);
            write_string(&mut f, v);
        }
        if let Some(v) = &self.server_reference {
            f.push(SERVER_REFERENCE);
            write_string(&mut f, v);
        }
        if let Some(v) = &self.authentication_method {
            f.push(AUTHENTICATION_METHOD);
            write_string(&mut f, v);
        }
        if let Some(v) = &self.authentication_data {
            f.push(AUTHENTICATION_DATA);
            write_binary(&mut f, v);
        }
        write_user_properties(&mut f, &self.user_properties);
        emit(body, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    /// May repeat: forwarded publishes carry one per matching subscription.
    pub subscription_identifiers: Vec<u32>,
    pub content_type: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl PublishProperties {
    pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut p = Self::default();
        walk(buf, cursor, |id, buf, cursor| match id {
            PAYLOAD_FORMAT_INDICATOR => {
                set_once(&mut p.payload_format_indicator, read_u8(buf, cursor)?)
            }
            MESSAGE_EXPIRY_INTERVAL => {
                set_once(&mut p.message_expiry_interval, read_u32(buf, cursor)?)
            }
            TOPIC_ALIAS => set_once(&mut p.topic_alias, read_u16(buf, cursor)?),
            RESPONSE_TOPIC => set_once(&mut p.response_topic, read_string(buf, cursor)?),
            CORRELATION_DATA => set_once(
                &mut p.correlation_data,
                Bytes::copy_from_slice(read_binary(buf, cursor)?),
            ),
            SUBSCRIPTION_IDENTIFIER => {
                let v = read_variable_int(buf, cursor)?;
                if v == 0 {
                    return Err(CodecError::Protocol("subscription identifier zero"));
                }
                p.subscription_identifiers.push(v);
                Ok(())
            }
            CONTENT_TYPE => set_once(&mut p.content_type, read_string(buf, cursor)?),
            USER_PROPERTY => {
                p.user_properties.push(read_user_property(buf, cursor)?);
                Ok(())
            }
            _ => Err(CodecError::Protocol("unexpected PUBLISH property")),
        })?;
        Ok(p)
    }

    pub fn encode_into(&self, body: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut f = Vec::new();
        if let Some(v) = self.payload_format_indicator {
            f.push(PAYLOAD_FORMAT_INDICATOR);
            f.push(v);
        }
        if let Some(v) = self.message_expiry_interval {
            f.push(MESSAGE_EXPIRY_INTERVAL);
            write_u32(&mut f, v);
        }
        if let Some(v) = self.topic_alias {
            f.push(TOPIC_ALIAS);
            write_u16(&mut f, v);
        }
        if let Some(v) = &self.response_topic {
            f.push(RESPONSE_TOPIC);
            write_string(&mut f, v);
        }
        if let Some(v) = &self.correlation_data {
            f.push(CORRELATION_DATA);
            write_binary(&mut f, v);
        }
        for id in &self.subscription_identifiers {
            f.push(SUBSCRIPTION_IDENTIFIER);
            write_variable_int(&mut f, *id)?;
        }
        if let Some(v) = &self.content_type {
            f.push(CONTENT_TYPE);
            write_string(&mut f, v);
        }
        write_user_properties(&mut f, &self.user_properties);
        emit(body, f)
    }
}

/// Properties carried by PUBACK/PUBREC/PUBREL/PUBCOMP, SUBACK and UNSUBACK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckProperties {
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl AckProperties {
    pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut p = Self::default();
        walk(buf, cursor, |id, buf, cursor| match id {
            REASON_STRING => set_once(&mut p.reason_string, read_string(buf, cursor)?),
            USER_PROPERTY => {
                p.user_properties.push(read_user_property(buf, cursor)?);
                Ok(())
            }
            _ => Err(CodecError::Protocol("unexpected acknowledgment property")),
        })?;
        Ok(p)
    }

    pub fn encode_into(&self, body: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut f = Vec::new();
        if let Some(v) = &self.reason_string {
            f.push(REASON_STRING);
            write_string(&mut f, v);
        }
        write_user_properties(&mut f, &self.user_properties);
        emit(body, f)
    }

    pub fn is_empty(&self) -> bool {
        self.reason_string.is_none() && self.user_properties.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeProperties {
    pub subscription_identifier: Option<u32>,
    pub user_properties: Vec<(String, String)>,
}

impl SubscribeProperties {
    pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut p = Self::default();
        walk(buf, cursor, |id, buf, cursor| match id {
            SUBSCRIPTION_IDENTIFIER => {
                let v = read_variable_int(buf, cursor)?;
                if v == 0 {
                    return Err(CodecError::Protocol("subscription identifier zero"));
                }
                set_once(&mut p.subscription_identifier, v)
            }
            USER_PROPERTY => {
                p.user_properties.push(read_user_property(buf, cursor)?);
                Ok(())
            }
            _ => Err(CodecError::Protocol("unexpected SUBSCRIBE property")),
        })?;
        Ok(p)
    }

    pub fn encode_into(&self, body: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut f = Vec::new();
        if let Some(v) = self.subscription_identifier {
            f.push(SUBSCRIPTION_IDENTIFIER);
            write_variable_int(&mut f, v)?;
        }
        write_user_properties(&mut f, &self.user_properties);
        emit(body, f)
    }
}

/// UNSUBSCRIBE carries only user properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscribeProperties {
    pub user_properties: Vec<(String, String)>,
}

impl UnsubscribeProperties {
    pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut p = Self::default();
        walk(buf, cursor, |id, buf, cursor| match id {
            USER_PROPERTY => {
                p.user_properties.push(read_user_property(buf, cursor)?);
                Ok(())
            }
            _ => Err(CodecError::Protocol("unexpected UNSUBSCRIBE property")),
        })?;
        Ok(p)
    }

    pub fn encode_into(&self, body: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut f = Vec::new();
        write_user_properties(&mut f, &self.user_properties);
        emit(body, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub reason_string: Option<String>,
    pub server_reference: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl DisconnectProperties {
    pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut p = Self::default();
        walk(buf, cursor, |id, buf, cursor| match id {
            SESSION_EXPIRY_INTERVAL => {
                set_once(&mut p.session_expiry_interval, read_u32(buf, cursor)?)
            }
            REASON_STRING => set_once(&mut p.reason_string, read_string(buf, cursor)?),
            SERVER_REFERENCE => set_once(&mut p.server_reference, read_string(buf, cursor)?),
            USER_PROPERTY => {
                p.user_properties.push(read_user_property(buf, cursor)?);
                Ok(())
            }
            _ => Err(CodecError::Protocol("unexpected DISCONNECT property")),
        })?;
        Ok(p)
    }

    pub fn encode_into(&self, body: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut f = Vec::new();
        if let Some(v) = self.session_expiry_interval {
            f.push(SESSION_EXPIRY_INTERVAL);
            write_u32(&mut f, v);
        }
        if let Some(v) = &self.reason_string {
            f.push(REASON_STRING);
            write_string(&mut f, v);
        }
        if let Some(v) = &self.server_reference {
            f.push(SERVER_REFERENCE);
            write_string(&mut f, v);
        }
        write_user_properties(&mut f, &self.user_properties);
        emit(body, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthProperties {
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl AuthProperties {
    pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Self, CodecError> {
        let mut p = Self::default();
        walk(buf, cursor, |id, buf, cursor| match id {
            AUTHENTICATION_METHOD => {
                set_once(&mut p.authentication_method, read_string(buf, cursor)?)
            }
            AUTHENTICATION_DATA => set_once(
                &mut p.authentication_data,
                Bytes::copy_from_slice(read_binary(buf, cursor)?),
            ),
            REASON_STRING => set_once(&mut p.reason_string, read_string(buf, cursor)?),
            USER_PROPERTY => {
                p.user_properties.push(read_user_property(buf, cursor)?);
                Ok(())
            }
            _ => Err(CodecError::Protocol("unexpected AUTH property")),
        })?;
        Ok(p)
    }

    pub fn encode_into(&self, body: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut f = Vec::new();
        if let Some(v) = &self.authentication_method {
            f.push(AUTHENTICATION_METHOD);
            write_string(&mut f, v);
        }
        if let Some(v) = &self.authentication_data {
            f.push(AUTHENTICATION_DATA);
            write_binary(&mut f, v);
        }
        if let Some(v) = &self.reason_string {
            f.push(REASON_STRING);
            write_string(&mut f, v);
        }
        write_user_properties(&mut f, &self.user_properties);
        emit(body, f)
    }
}
