use std::fmt;
use std::io;
use std::sync::Arc;

use crate::codec::FrameError;
use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError};

/// Channel error types
///
/// Cloneable so one close cause can be handed to every pending waiter.
#[derive(Debug, Clone)]
pub enum ChannelError {
    Io(Arc<io::Error>),
    Decode(DecodeError),
    Encode(EncodeError),
    ProtocolViolation(&'static str),
    ConnectionRefused(ConnectReturnCode),
    KeepAliveTimeout,
    IdsExhausted,
    Closed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Io(e) => write!(f, "IO error: {}", e),
            ChannelError::Decode(e) => write!(f, "Malformed frame: {}", e),
            ChannelError::Encode(e) => write!(f, "Encode error: {}", e),
            ChannelError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            ChannelError::ConnectionRefused(code) => write!(f, "Connection refused: {}", code),
            ChannelError::KeepAliveTimeout => write!(f, "Keep alive timeout"),
            ChannelError::IdsExhausted => write!(f, "All message ids are in flight"),
            ChannelError::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(e) => Some(e.as_ref()),
            ChannelError::Decode(e) => Some(e),
            ChannelError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(Arc::new(e))
    }
}

impl From<DecodeError> for ChannelError {
    fn from(e: DecodeError) -> Self {
        ChannelError::Decode(e)
    }
}

impl From<EncodeError> for ChannelError {
    fn from(e: EncodeError) -> Self {
        ChannelError::Encode(e)
    }
}

impl From<FrameError> for ChannelError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => e.into(),
            FrameError::Decode(e) => e.into(),
        }
    }
}
