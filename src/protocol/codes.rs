//! Reason codes and their per-version mapping.
//!
//! MQTT 5 uses one reason-code space across CONNACK, acknowledgments and
//! DISCONNECT; 3.x has a separate CONNACK return-code table and no reason
//! codes elsewhere. Codes are plain constants because several values repeat
//! with context-dependent meanings.

use crate::error::AuthError;
use crate::protocol::ProtocolVersion;

/// MQTT 3.x CONNACK return codes.
pub mod v3_return {
    pub const ACCEPTED: u8 = 0x00;
    pub const UNACCEPTABLE_PROTOCOL_VERSION: u8 = 0x01;
    pub const IDENTIFIER_REJECTED: u8 = 0x02;
    pub const SERVER_UNAVAILABLE: u8 = 0x03;
    pub const BAD_USERNAME_OR_PASSWORD: u8 = 0x04;
    pub const NOT_AUTHORIZED: u8 = 0x05;
}

/// MQTT 5 reason codes.
pub mod v5 {
    pub const SUCCESS: u8 = 0x00;
    pub const NORMAL_DISCONNECTION: u8 = 0x00;
    pub const GRANTED_QOS_0: u8 = 0x00;
    pub const GRANTED_QOS_1: u8 = 0x01;
    pub const GRANTED_QOS_2: u8 = 0x02;
    pub const DISCONNECT_WITH_WILL: u8 = 0x04;
    pub const NO_MATCHING_SUBSCRIBERS: u8 = 0x10;
    pub const NO_SUBSCRIPTION_EXISTED: u8 = 0x11;
    pub const UNSPECIFIED_ERROR: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const IMPLEMENTATION_SPECIFIC_ERROR: u8 = 0x83;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u8 = 0x84;
    pub const CLIENT_IDENTIFIER_NOT_VALID: u8 = 0x85;
    pub const BAD_USER_NAME_OR_PASSWORD: u8 = 0x86;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const SERVER_UNAVAILABLE: u8 = 0x88;
    pub const SERVER_SHUTTING_DOWN: u8 = 0x8B;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const SESSION_TAKEN_OVER: u8 = 0x8E;
    pub const TOPIC_FILTER_INVALID: u8 = 0x8F;
    pub const TOPIC_NAME_INVALID: u8 = 0x90;
    pub const PACKET_IDENTIFIER_NOT_FOUND: u8 = 0x92;
    pub const RECEIVE_MAXIMUM_EXCEEDED: u8 = 0x93;
    pub const TOPIC_ALIAS_INVALID: u8 = 0x94;
    pub const PACKET_TOO_LARGE: u8 = 0x95;
    pub const QUOTA_EXCEEDED: u8 = 0x97;
    pub const RETAIN_NOT_SUPPORTED: u8 = 0x9A;
    pub const QOS_NOT_SUPPORTED: u8 = 0x9B;
    pub const SHARED_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0x9E;
    pub const SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED: u8 = 0xA1;
    pub const WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0xA2;
}

/// CONNACK code for an unsupported protocol level, in the version the
/// client is closest to speaking.
pub fn unacceptable_version(version: ProtocolVersion) -> u8 {
    match version {
        ProtocolVersion::V5 => v5::UNSUPPORTED_PROTOCOL_VERSION,
        _ => v3_return::UNACCEPTABLE_PROTOCOL_VERSION,
    }
}

/// CONNACK code for a rejected client identifier.
pub fn identifier_rejected(version: ProtocolVersion) -> u8 {
    match version {
        ProtocolVersion::V5 => v5::CLIENT_IDENTIFIER_NOT_VALID,
        _ => v3_return::IDENTIFIER_REJECTED,
    }
}

/// CONNACK code for an authentication failure.
pub fn auth_failure(version: ProtocolVersion, err: &AuthError) -> u8 {
    match (version, err) {
        (ProtocolVersion::V5, AuthError::BadUserNameOrPassword) => v5::BAD_USER_NAME_OR_PASSWORD,
        (ProtocolVersion::V5, AuthError::NotAuthorized) => v5::NOT_AUTHORIZED,
        (_, AuthError::BadUserNameOrPassword) => v3_return::BAD_USERNAME_OR_PASSWORD,
        (_, AuthError::NotAuthorized) => v3_return::NOT_AUTHORIZED,
    }
}

/// SUBACK failure code for a filter the broker refuses.
pub fn suback_failure(version: ProtocolVersion, reason: u8) -> u8 {
    match version {
        ProtocolVersion::V5 => reason,
        // 3.x SUBACK has a single failure code.
        _ => 0x80,
    }
}
