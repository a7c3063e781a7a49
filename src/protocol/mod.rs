//! MQTT Protocol definitions and types
//!
//! Defines the MQTT 3.1 message kinds shared by the codec, channels and
//! the session proxy.

mod error;
mod message;

pub use error::{DecodeError, EncodeError};
pub use message::*;

/// Protocol name sent by MQTT 3.1 clients
pub const PROTOCOL_NAME_V31: &str = "MQIsdp";

/// Protocol level sent by MQTT 3.1 clients
pub const PROTOCOL_VERSION_V31: u8 = 3;

/// Largest valid message identifier. Identifier 0 is reserved.
pub const MAX_MESSAGE_ID: u16 = 0xFFFF;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery (decoded, never sent by this crate)
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// MQTT Message Type (upper nibble of the fixed header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
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
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageType::Connect),
            2 => Some(MessageType::ConnAck),
            3 => Some(MessageType::Publish),
            4 => Some(MessageType::PubAck),
            5 => Some(MessageType::PubRec),
            6 => Some(MessageType::PubRel),
            7 => Some(MessageType::PubComp),
            8 => Some(MessageType::Subscribe),
            9 => Some(MessageType::SubAck),
            10 => Some(MessageType::Unsubscribe),
            11 => Some(MessageType::UnsubAck),
            12 => Some(MessageType::PingReq),
            13 => Some(MessageType::PingResp),
            14 => Some(MessageType::Disconnect),
            _ => None,
        }
    }
}

/// CONNACK return codes, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    #[default]
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
    Other = 6,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Some(ConnectReturnCode::IdentifierRejected),
            3 => Some(ConnectReturnCode::ServerUnavailable),
            4 => Some(ConnectReturnCode::BadCredentials),
            5 => Some(ConnectReturnCode::NotAuthorized),
            6 => Some(ConnectReturnCode::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectReturnCode::Accepted => "accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::IdentifierRejected => "identifier rejected",
            ConnectReturnCode::ServerUnavailable => "server unavailable",
            ConnectReturnCode::BadCredentials => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
            ConnectReturnCode::Other => "other",
        };
        f.write_str(s)
    }
}
