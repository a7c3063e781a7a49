//! MQTT Message Decoder
//!
//! Decodes MQTT 3.1 frames from a contiguous buffer

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Message, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, Subscription, UnsubAck, Unsubscribe, Will,
};

/// MQTT Message Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum remaining length accepted
    max_remaining_length: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_remaining_length: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_remaining_length(mut self, size: usize) -> Self {
        self.max_remaining_length = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a message from the buffer
    ///
    /// Returns `Ok(None)` while the buffer holds less than one full frame;
    /// the caller retries once more bytes arrive.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let message_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_remaining_length {
            return Err(DecodeError::RemainingLengthTooLarge(
                remaining_length as usize,
            ));
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];
        let dup = (flags & 0x08) != 0;

        let message = match message_type {
            1 => decode_connect(body)?,
            2 => decode_connack(body)?,
            3 => decode_publish(flags, body)?,
            4 => Message::PubAck(PubAck::new(read_message_id(body)?)),
            5 => Message::PubRec(PubRec::new(read_message_id(body)?)),
            6 => Message::PubRel(PubRel {
                dup,
                message_id: read_message_id(body)?,
            }),
            7 => Message::PubComp(PubComp::new(read_message_id(body)?)),
            8 => decode_subscribe(dup, body)?,
            9 => decode_suback(body)?,
            10 => decode_unsubscribe(dup, body)?,
            11 => Message::UnsubAck(UnsubAck::new(read_message_id(body)?)),
            12 => Message::PingReq,
            13 => Message::PingResp,
            14 => Message::Disconnect,
            _ => return Err(DecodeError::InvalidMessageType(message_type)),
        };

        Ok(Some((message, total_len)))
    }
}

fn read_message_id(buf: &[u8]) -> Result<u16, DecodeError> {
    let id = read_u16(buf)?;
    if id == 0 {
        return Err(DecodeError::ZeroMessageId);
    }
    Ok(id)
}

fn read_qos(byte: u8) -> Result<QoS, DecodeError> {
    QoS::from_u8(byte).ok_or(DecodeError::InvalidQoS(byte))
}

fn decode_connect(body: &[u8]) -> Result<Message, DecodeError> {
    let mut pos = 0;

    let (protocol_name, len) = read_string(body)?;
    pos += len;

    if body.len() < pos + 4 {
        return Err(DecodeError::InsufficientData);
    }
    let protocol_version = body[pos];
    let connect_flags = body[pos + 1];
    let keep_alive = u16::from_be_bytes([body[pos + 2], body[pos + 3]]);
    pos += 4;

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    let (client_id, len) = read_string(&body[pos..])?;
    pos += len;

    let will = if will_flag {
        let (topic, len) = read_string(&body[pos..])?;
        pos += len;
        let (message, len) = read_binary(&body[pos..])?;
        pos += len;
        Some(Will {
            topic: topic.to_string(),
            message: Bytes::copy_from_slice(message),
            qos: read_qos(will_qos)?,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&body[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (data, _len) = read_binary(&body[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    Ok(Message::Connect(Box::new(Connect {
        protocol_name: protocol_name.to_string(),
        protocol_version,
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(body: &[u8]) -> Result<Message, DecodeError> {
    if body.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }

    let return_code =
        ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;

    Ok(Message::ConnAck(ConnAck {
        session_present: (body[0] & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Message, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let retain = (flags & 0x01) != 0;
    let qos = read_qos((flags >> 1) & 0x03)?;

    let mut pos = 0;
    let (topic, len) = read_string(body)?;
    pos += len;

    let message_id = if qos != QoS::AtMostOnce {
        let id = read_message_id(&body[pos..])?;
        pos += 2;
        id
    } else {
        0
    };

    Ok(Message::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        message_id,
        payload: Bytes::copy_from_slice(&body[pos..]),
    }))
}

fn decode_subscribe(dup: bool, body: &[u8]) -> Result<Message, DecodeError> {
    let message_id = read_message_id(body)?;
    let mut pos = 2;
    let mut subscriptions = Vec::new();

    while pos < body.len() {
        let (topic, len) = read_string(&body[pos..])?;
        pos += len;
        let qos_byte = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        subscriptions.push(Subscription {
            topic: topic.to_string(),
            qos: read_qos(qos_byte)?,
        });
    }

    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedMessage("SUBSCRIBE without topics"));
    }

    Ok(Message::Subscribe(Subscribe {
        dup,
        message_id,
        subscriptions,
    }))
}

fn decode_suback(body: &[u8]) -> Result<Message, DecodeError> {
    let message_id = read_message_id(body)?;
    let granted = body[2..]
        .iter()
        .map(|&b| read_qos(b))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Message::SubAck(SubAck {
        message_id,
        granted,
    }))
}

fn decode_unsubscribe(dup: bool, body: &[u8]) -> Result<Message, DecodeError> {
    let message_id = read_message_id(body)?;
    let mut pos = 2;
    let mut topics = Vec::new();

    while pos < body.len() {
        let (topic, len) = read_string(&body[pos..])?;
        pos += len;
        topics.push(topic.to_string());
    }

    if topics.is_empty() {
        return Err(DecodeError::MalformedMessage("UNSUBSCRIBE without topics"));
    }

    Ok(Message::Unsubscribe(Unsubscribe {
        dup,
        message_id,
        topics,
    }))
}
