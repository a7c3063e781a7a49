//! MQTT Message Definitions
//!
//! One struct per message kind plus the [`Message`] enum that the codec and
//! channels pass around.

use std::sync::Arc;

use bytes::Bytes;

use super::{ConnectReturnCode, MessageType, QoS, PROTOCOL_NAME_V31, PROTOCOL_VERSION_V31};

/// Messages that carry a 16-bit message identifier
pub trait Identifiable {
    fn message_id(&self) -> u16;
    fn set_message_id(&mut self, id: u16);
}

macro_rules! identifiable {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Identifiable for $ty {
                fn message_id(&self) -> u16 {
                    self.message_id
                }

                fn set_message_id(&mut self, id: u16) {
                    self.message_id = id;
                }
            }
        )*
    };
}

identifiable!(Publish, PubAck, PubRec, PubRel, PubComp, Subscribe, SubAck, Unsubscribe, UnsubAck);

macro_rules! into_message {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

into_message!(ConnAck, Publish, PubAck, PubRec, PubRel, PubComp, Subscribe, SubAck, Unsubscribe, UnsubAck);

impl From<Connect> for Message {
    fn from(m: Connect) -> Self {
        Message::Connect(Box::new(m))
    }
}

/// MQTT Message - one complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    Connect(Box<Connect>),
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
    Disconnect,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Connect(_) => MessageType::Connect,
            Message::ConnAck(_) => MessageType::ConnAck,
            Message::Publish(_) => MessageType::Publish,
            Message::PubAck(_) => MessageType::PubAck,
            Message::PubRec(_) => MessageType::PubRec,
            Message::PubRel(_) => MessageType::PubRel,
            Message::PubComp(_) => MessageType::PubComp,
            Message::Subscribe(_) => MessageType::Subscribe,
            Message::SubAck(_) => MessageType::SubAck,
            Message::Unsubscribe(_) => MessageType::Unsubscribe,
            Message::UnsubAck(_) => MessageType::UnsubAck,
            Message::PingReq => MessageType::PingReq,
            Message::PingResp => MessageType::PingResp,
            Message::Disconnect => MessageType::Disconnect,
        }
    }

    /// QoS bits of the fixed header
    pub fn qos(&self) -> QoS {
        match self {
            Message::Publish(p) => p.qos,
            Message::PubRel(_) | Message::Subscribe(_) | Message::Unsubscribe(_) => {
                QoS::AtLeastOnce
            }
            _ => QoS::AtMostOnce,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        match self {
            Message::Publish(p) => p.dup,
            Message::PubRel(p) => p.dup,
            Message::Subscribe(p) => p.dup,
            Message::Unsubscribe(p) => p.dup,
            _ => false,
        }
    }

    /// Set the DUP flag. Kinds without a meaningful DUP flag are left alone.
    pub fn set_duplicate(&mut self, dup: bool) {
        match self {
            Message::Publish(p) => p.dup = dup,
            Message::PubRel(p) => p.dup = dup,
            Message::Subscribe(p) => p.dup = dup,
            Message::Unsubscribe(p) => p.dup = dup,
            _ => {}
        }
    }

    pub fn retain(&self) -> bool {
        matches!(self, Message::Publish(p) if p.retain)
    }

    fn identifiable(&self) -> Option<&dyn Identifiable> {
        match self {
            Message::Publish(p) if p.qos != QoS::AtMostOnce => Some(p),
            Message::PubAck(p) => Some(p),
            Message::PubRec(p) => Some(p),
            Message::PubRel(p) => Some(p),
            Message::PubComp(p) => Some(p),
            Message::Subscribe(p) => Some(p),
            Message::SubAck(p) => Some(p),
            Message::Unsubscribe(p) => Some(p),
            Message::UnsubAck(p) => Some(p),
            _ => None,
        }
    }

    /// Message identifier, for kinds that carry one
    pub fn message_id(&self) -> Option<u16> {
        self.identifiable().map(|m| m.message_id())
    }

    /// Rewrite the message identifier. Returns false if this kind has none.
    pub fn set_message_id(&mut self, id: u16) -> bool {
        let target: &mut dyn Identifiable = match self {
            Message::Publish(p) if p.qos != QoS::AtMostOnce => p,
            Message::PubAck(p) => p,
            Message::PubRec(p) => p,
            Message::PubRel(p) => p,
            Message::PubComp(p) => p,
            Message::Subscribe(p) => p,
            Message::SubAck(p) => p,
            Message::Unsubscribe(p) => p,
            Message::UnsubAck(p) => p,
            _ => return false,
        };
        target.set_message_id(id);
        true
    }

    /// Whether the sender waits for an acknowledgement of this message
    pub fn requires_ack(&self) -> bool {
        match self {
            Message::Publish(p) => p.qos != QoS::AtMostOnce,
            Message::PubRel(_) | Message::Subscribe(_) | Message::Unsubscribe(_) => true,
            _ => false,
        }
    }

    /// Whether this message acknowledges an in-flight message
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            Message::PubAck(_)
                | Message::PubRec(_)
                | Message::PubComp(_)
                | Message::SubAck(_)
                | Message::UnsubAck(_)
        )
    }
}

/// CONNECT message (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub client_id: String,
    pub clean_session: bool,
    /// Keep alive interval in seconds, 0 disables
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_name: PROTOCOL_NAME_V31.to_string(),
            protocol_version: PROTOCOL_VERSION_V31,
            client_id: String::new(),
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
        }
    }
}

/// Will message carried in CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK message (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub fn new(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.return_code == ConnectReturnCode::Accepted
    }
}

/// PUBLISH message (bidirectional)
///
/// The topic uses `Arc<str>` so fan-out copies are O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Arc<str>,
    /// Message identifier, 0 for QoS 0
    pub message_id: u16,
    pub payload: Bytes,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            message_id: 0,
            payload: Bytes::new(),
        }
    }
}

/// PUBACK message (QoS 1 acknowledgement)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub message_id: u16,
}

impl PubAck {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

/// PUBREC message (QoS 2 step 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub message_id: u16,
}

impl PubRec {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

/// PUBREL message (QoS 2 step 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub dup: bool,
    pub message_id: u16,
}

impl PubRel {
    pub fn new(message_id: u16) -> Self {
        Self {
            dup: false,
            message_id,
        }
    }
}

/// PUBCOMP message (QoS 2 step 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub message_id: u16,
}

impl PubComp {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}

/// Topic filter and requested QoS inside SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

/// SUBSCRIBE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub dup: bool,
    pub message_id: u16,
    pub subscriptions: Vec<Subscription>,
}

/// SUBACK message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub message_id: u16,
    /// Granted QoS, one per requested subscription
    pub granted: Vec<QoS>,
}

/// UNSUBSCRIBE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub dup: bool,
    pub message_id: u16,
    pub topics: Vec<String>,
}

/// UNSUBACK message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub message_id: u16,
}

impl UnsubAck {
    pub fn new(message_id: u16) -> Self {
        Self { message_id }
    }
}
