//! Partial-read frame assembly
//!
//! Frames arrive in three stages: the two byte fixed header, up to three
//! more remaining-length bytes, then the body. The body buffer is only
//! allocated once the remaining length is fully known.

use std::fmt;
use std::io::{self, Read};

use bytes::{Bytes, BytesMut};

use super::{read_variable_int, MAX_LENGTH_BYTES, MAX_REMAINING_LENGTH};
use crate::protocol::DecodeError;

/// Result of one read attempt
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// A complete frame (fixed header included)
    Frame(Bytes),
    /// The source has no more bytes for now
    WouldBlock,
    /// The peer closed its side of the stream
    Eof,
}

/// Errors raised while assembling a frame
#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    Decode(DecodeError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "IO error: {}", e),
            FrameError::Decode(e) => write!(f, "Decode error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

impl From<DecodeError> for FrameError {
    fn from(e: DecodeError) -> Self {
        FrameError::Decode(e)
    }
}

enum Stage {
    /// Reading the type byte and first length byte
    Header,
    /// Reading continuation bytes of the remaining length
    Length,
    /// Reading the body into an exactly sized buffer
    Body { frame: BytesMut, filled: usize },
}

/// Incremental frame reader for non-blocking streams
pub struct FrameReader {
    header: [u8; 1 + MAX_LENGTH_BYTES],
    header_len: usize,
    stage: Stage,
    max_remaining_length: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            header: [0; 1 + MAX_LENGTH_BYTES],
            header_len: 0,
            stage: Stage::Header,
            max_remaining_length: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_remaining_length(mut self, size: usize) -> Self {
        self.max_remaining_length = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// True when no partial frame is buffered
    pub fn is_idle(&self) -> bool {
        self.header_len == 0 && matches!(self.stage, Stage::Header)
    }

    /// Pull bytes from `src` until one frame is complete or `src` runs dry
    pub fn read_frame<R: Read>(&mut self, src: &mut R) -> Result<ReadStatus, FrameError> {
        loop {
            match &mut self.stage {
                Stage::Header => {
                    let idle = self.header_len == 0;
                    match read_some(src, &mut self.header[self.header_len..2])? {
                        Fill::Data(n) => self.header_len += n,
                        Fill::WouldBlock => return Ok(ReadStatus::WouldBlock),
                        Fill::Eof if idle => return Ok(ReadStatus::Eof),
                        Fill::Eof => return Err(truncated()),
                    }
                    if self.header_len < 2 {
                        continue;
                    }
                    if self.header[1] & 0x80 != 0 {
                        self.stage = Stage::Length;
                    } else {
                        self.begin_body()?;
                    }
                }
                Stage::Length => {
                    if self.header_len == self.header.len() {
                        return Err(DecodeError::InvalidRemainingLength.into());
                    }
                    let end = self.header_len + 1;
                    match read_some(src, &mut self.header[self.header_len..end])? {
                        Fill::Data(n) => self.header_len += n,
                        Fill::WouldBlock => return Ok(ReadStatus::WouldBlock),
                        Fill::Eof => return Err(truncated()),
                    }
                    if self.header[self.header_len - 1] & 0x80 == 0 {
                        self.begin_body()?;
                    }
                }
                Stage::Body { frame, filled } => {
                    if *filled == frame.len() {
                        let frame = std::mem::take(frame).freeze();
                        self.reset();
                        return Ok(ReadStatus::Frame(frame));
                    }
                    match read_some(src, &mut frame[*filled..])? {
                        Fill::Data(n) => *filled += n,
                        Fill::WouldBlock => return Ok(ReadStatus::WouldBlock),
                        Fill::Eof => return Err(truncated()),
                    }
                }
            }
        }
    }

    fn begin_body(&mut self) -> Result<(), FrameError> {
        let (remaining, _) = read_variable_int(&self.header[1..self.header_len])?;
        let remaining = remaining as usize;
        if remaining > self.max_remaining_length {
            return Err(DecodeError::RemainingLengthTooLarge(remaining).into());
        }

        let mut frame = BytesMut::zeroed(self.header_len + remaining);
        frame[..self.header_len].copy_from_slice(&self.header[..self.header_len]);
        self.stage = Stage::Body {
            frame,
            filled: self.header_len,
        };
        Ok(())
    }

    fn reset(&mut self) {
        self.header_len = 0;
        self.stage = Stage::Header;
    }
}

enum Fill {
    Data(usize),
    WouldBlock,
    Eof,
}

fn truncated() -> FrameError {
    FrameError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "stream closed inside a frame",
    ))
}

fn read_some<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<Fill, FrameError> {
    loop {
        match src.read(buf) {
            Ok(0) => return Ok(Fill::Eof),
            Ok(n) => return Ok(Fill::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
