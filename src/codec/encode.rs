//! MQTT Message Encoder
//!
//! Encodes MQTT 3.1 frames. The output buffer is sized exactly from the
//! remaining length so encoding never reallocates.

use bytes::{BufMut, Bytes, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Message, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};

/// MQTT Message Encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a message into a freshly allocated, exactly sized buffer
    pub fn encode(&self, message: &Message) -> Result<Bytes, EncodeError> {
        let remaining_length = self.remaining_length(message)?;
        let total = 1 + variable_int_len(remaining_length as u32) + remaining_length;
        let mut buf = BytesMut::with_capacity(total);
        self.encode_to(message, remaining_length, &mut buf)?;
        debug_assert_eq!(buf.len(), total);
        Ok(buf.freeze())
    }

    /// Size of the variable header plus payload
    pub fn remaining_length(&self, message: &Message) -> Result<usize, EncodeError> {
        let len = match message {
            Message::Connect(p) => connect_length(p),
            Message::ConnAck(_) => 2,
            Message::Publish(p) => publish_length(p),
            Message::PubAck(_)
            | Message::PubRec(_)
            | Message::PubRel(_)
            | Message::PubComp(_)
            | Message::UnsubAck(_) => 2,
            Message::Subscribe(p) => {
                2 + p
                    .subscriptions
                    .iter()
                    .map(|s| 2 + s.topic.len() + 1)
                    .sum::<usize>()
            }
            Message::SubAck(p) => 2 + p.granted.len(),
            Message::Unsubscribe(p) => 2 + p.topics.iter().map(|t| 2 + t.len()).sum::<usize>(),
            Message::PingReq | Message::PingResp | Message::Disconnect => 0,
        };
        if len > super::MAX_REMAINING_LENGTH {
            return Err(EncodeError::MessageTooLarge);
        }
        Ok(len)
    }

    fn encode_to(
        &self,
        message: &Message,
        remaining_length: usize,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u8(fixed_header(message));
        write_variable_int(buf, remaining_length as u32)?;

        match message {
            Message::Connect(p) => encode_connect(p, buf),
            Message::ConnAck(p) => {
                encode_connack(p, buf);
                Ok(())
            }
            Message::Publish(p) => encode_publish(p, buf),
            Message::PubAck(p) => {
                buf.put_u16(p.message_id);
                Ok(())
            }
            Message::PubRec(p) => {
                buf.put_u16(p.message_id);
                Ok(())
            }
            Message::PubRel(p) => {
                buf.put_u16(p.message_id);
                Ok(())
            }
            Message::PubComp(p) => {
                buf.put_u16(p.message_id);
                Ok(())
            }
            Message::Subscribe(p) => encode_subscribe(p, buf),
            Message::SubAck(p) => {
                encode_suback(p, buf);
                Ok(())
            }
            Message::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Message::UnsubAck(p) => {
                buf.put_u16(p.message_id);
                Ok(())
            }
            Message::PingReq | Message::PingResp | Message::Disconnect => Ok(()),
        }
    }
}

/// First byte: type << 4 | dup << 3 | qos << 1 | retain
fn fixed_header(message: &Message) -> u8 {
    let mut byte = (message.message_type() as u8) << 4;
    if message.is_duplicate() {
        byte |= 0x08;
    }
    byte |= (message.qos() as u8) << 1;
    if message.retain() {
        byte |= 0x01;
    }
    byte
}

fn connect_length(p: &Connect) -> usize {
    // Protocol name, version, flags, keep alive
    let mut len = 2 + p.protocol_name.len() + 1 + 1 + 2;
    len += 2 + p.client_id.len();
    if let Some(ref will) = p.will {
        len += 2 + will.topic.len();
        len += 2 + will.message.len();
    }
    if let Some(ref username) = p.username {
        len += 2 + username.len();
    }
    if let Some(ref password) = p.password {
        len += 2 + password.len();
    }
    len
}

fn publish_length(p: &Publish) -> usize {
    let mut len = 2 + p.topic.len() + p.payload.len();
    if p.qos != QoS::AtMostOnce {
        len += 2;
    }
    len
}

fn encode_connect(p: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_string(buf, &p.protocol_name)?;
    buf.put_u8(p.protocol_version);

    let mut connect_flags: u8 = 0;
    if p.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = p.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if p.password.is_some() {
        connect_flags |= 0x40;
    }
    if p.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);
    buf.put_u16(p.keep_alive);

    write_string(buf, &p.client_id)?;

    if let Some(ref will) = p.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.message)?;
    }
    if let Some(ref username) = p.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = p.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_connack(p: &ConnAck, buf: &mut BytesMut) {
    buf.put_u8(if p.session_present { 0x01 } else { 0x00 });
    buf.put_u8(p.return_code as u8);
}

fn encode_publish(p: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_string(buf, &p.topic)?;
    if p.qos != QoS::AtMostOnce {
        buf.put_u16(p.message_id);
    }
    buf.put_slice(&p.payload);
    Ok(())
}

fn encode_subscribe(p: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u16(p.message_id);
    for sub in &p.subscriptions {
        write_string(buf, &sub.topic)?;
        buf.put_u8(sub.qos as u8);
    }
    Ok(())
}

fn encode_suback(p: &SubAck, buf: &mut BytesMut) {
    buf.put_u16(p.message_id);
    for qos in &p.granted {
        buf.put_u8(*qos as u8);
    }
}

fn encode_unsubscribe(p: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u16(p.message_id);
    for topic in &p.topics {
        write_string(buf, topic)?;
    }
    Ok(())
}

