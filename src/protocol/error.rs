//! Protocol error types

use std::fmt;

/// Errors that can occur during message decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Invalid message type
    InvalidMessageType(u8),
    /// Remaining length needs a fifth byte
    InvalidRemainingLength,
    /// Remaining length exceeds the configured maximum
    RemainingLengthTooLarge(usize),
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid CONNACK return code
    InvalidReturnCode(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid header or connect flags
    InvalidFlags,
    /// Message identifier 0 where one is required
    ZeroMessageId,
    /// Malformed message
    MalformedMessage(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidMessageType(t) => write!(f, "invalid message type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::RemainingLengthTooLarge(len) => {
                write!(f, "remaining length {} exceeds maximum", len)
            }
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidReturnCode(c) => write!(f, "invalid connect return code: {}", c),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidFlags => write!(f, "invalid flags"),
            Self::ZeroMessageId => write!(f, "message id cannot be 0"),
            Self::MalformedMessage(msg) => write!(f, "malformed message: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during message encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length does not fit in four length bytes
    MessageTooLarge,
    /// String or binary field longer than 65535 bytes
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooLarge => write!(f, "message too large"),
            Self::StringTooLong => write!(f, "string too long"),
        }
    }
}

impl std::error::Error for EncodeError {}
