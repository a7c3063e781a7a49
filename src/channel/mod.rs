//! Per-connection protocol engine
//!
//! A [`Channel`] owns one non-blocking byte stream and drives the MQTT
//! state machine over it:
//!
//! ```text
//! OPENING -> OPEN -> CONNECTED -> CLOSED
//!    \_________\______________/
//!       any failure closes
//! ```
//!
//! Channels are driven by a reactor on a single thread. Reads are assembled
//! frame by frame, writes are queued in submission order, and messages that
//! need an acknowledgement stay in flight until it arrives, being resent
//! with the DUP flag every resend interval.

mod error;
mod handler;
mod ids;
mod keepalive;


pub use error::ChannelError;
pub use handler::{Action, MessageHandler, Outbox};
pub use ids::{ChannelId, ChannelIdSource, IdAllocator};
pub use keepalive::Role;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::codec::{Decoder, Encoder, FrameReader, ReadStatus, MAX_REMAINING_LENGTH};
use crate::command::{Completion, CommandError};
use crate::protocol::{DecodeError, EncodeError, Message};
use handler::dispatch;
use keepalive::{KeepAlive, KeepAliveCheck};

/// Completion of a send: `Some(ack)` for acknowledged messages, `None`
/// once written otherwise
pub type SendCompletion = Completion<Option<Message>>;

/// Byte stream a channel can run over
pub trait Stream: Read + Write {
    /// Whether an outbound connect has completed. `Ok(false)` means the
    /// attempt is still in progress.
    fn connect_result(&mut self) -> io::Result<bool> {
        Ok(true)
    }
}

impl Stream for mio::net::TcpStream {
    fn connect_result(&mut self) -> io::Result<bool> {
        if let Some(e) = self.take_error()? {
            return Err(e);
        }
        match self.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Connected,
    Closed,
}

/// Channel tuning shared by every channel of a reactor
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Zero disables resending
    pub resend_interval: Duration,
    pub max_remaining_length: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_secs(30),
            max_remaining_length: MAX_REMAINING_LENGTH,
        }
    }
}

struct Outgoing {
    message: Message,
    bytes: Bytes,
    completion: Option<SendCompletion>,
    /// A DUP copy of an in-flight message
    resend: bool,
}

struct Writing {
    written: usize,
    outgoing: Outgoing,
}

struct InFlight {
    message: Message,
    /// `None` while a resend is queued or resending is disabled
    resend_at: Option<Instant>,
    seq: u64,
    completion: Option<SendCompletion>,
}

/// One MQTT connection
pub struct Channel<S> {
    id: ChannelId,
    stream: Option<S>,
    state: ChannelState,
    reader: FrameReader,
    decoder: Decoder,
    encoder: Encoder,
    queue: VecDeque<Outgoing>,
    writing: Option<Writing>,
    in_flight: AHashMap<u16, InFlight>,
    next_seq: u64,
    ids: IdAllocator,
    keep_alive: KeepAlive,
    resend_interval: Duration,
    last_sent: Instant,
    last_received: Instant,
    read_paused: bool,
    half_closed: bool,
}

impl<S: Stream> Channel<S> {
    /// Channel for an outbound connect still in progress
    pub fn connecting(
        id: ChannelId,
        stream: S,
        role: Role,
        options: ChannelOptions,
        now: Instant,
    ) -> Self {
        Self::new(id, stream, role, options, ChannelState::Opening, now)
    }

    /// Channel for an already established stream
    pub fn accepted(
        id: ChannelId,
        stream: S,
        role: Role,
        options: ChannelOptions,
        now: Instant,
    ) -> Self {
        Self::new(id, stream, role, options, ChannelState::Open, now)
    }

    fn new(
        id: ChannelId,
        stream: S,
        role: Role,
        options: ChannelOptions,
        state: ChannelState,
        now: Instant,
    ) -> Self {
        Self {
            id,
            stream: Some(stream),
            state,
            reader: FrameReader::new().with_max_remaining_length(options.max_remaining_length),
            decoder: Decoder::new().with_max_remaining_length(options.max_remaining_length),
            encoder: Encoder::new(),
            queue: VecDeque::new(),
            writing: None,
            in_flight: AHashMap::new(),
            next_seq: 0,
            ids: IdAllocator::new(),
            keep_alive: KeepAlive::new(role),
            resend_interval: options.resend_interval,
            last_sent: now,
            last_received: now,
            read_paused: false,
            half_closed: false,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.keep_alive.role()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Stream established and not closed
    pub fn is_open(&self) -> bool {
        matches!(self.state, ChannelState::Open | ChannelState::Connected)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// The protocol expects no further traffic; the owner should close
    pub fn is_half_closed(&self) -> bool {
        self.half_closed
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Messages queued or partially written
    pub fn pending_writes(&self) -> usize {
        self.queue.len() + usize::from(self.writing.is_some())
    }

    pub fn is_ping_pending(&self) -> bool {
        self.keep_alive.is_ping_pending()
    }

    pub fn is_read_paused(&self) -> bool {
        self.read_paused
    }

    pub fn pause_read(&mut self) {
        self.read_paused = true;
    }

    /// The owner must call [`Channel::read_ready`] afterwards, bytes may
    /// have arrived while paused
    ///
    /// Unread traffic cannot count against the peer, so keep-alive restarts
    /// from `now`.
    pub fn resume_read(&mut self, now: Instant) {
        self.read_paused = false;
        self.last_received = self.last_received.max(now);
        self.keep_alive.ping_response();
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// Complete an outbound connect. Returns true once the channel is open.
    pub fn finish_connect(
        &mut self,
        now: Instant,
        handler: &mut dyn MessageHandler,
        ctx: &mut Outbox,
    ) -> Result<bool, ChannelError> {
        if self.state != ChannelState::Opening {
            return Ok(self.is_open());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };
        if !stream.connect_result()? {
            return Ok(false);
        }

        self.state = ChannelState::Open;
        self.last_sent = now;
        self.last_received = now;
        debug!("Channel {} opened", self.id);
        handler.channel_opened(ctx, self.id);
        self.write_ready(now)?;
        Ok(true)
    }

    /// Queue a message and start writing it if the stream is idle
    ///
    /// Returns `Ok(false)` when the message was dropped: the channel is
    /// closed, no message id was free, or the message cannot be encoded.
    pub fn send(
        &mut self,
        mut message: Message,
        completion: Option<SendCompletion>,
        now: Instant,
    ) -> Result<bool, ChannelError> {
        if self.is_closed() || self.half_closed {
            debug!(
                "Dropping {:?} for closed channel {}",
                message.message_type(),
                self.id
            );
            fail(completion, ChannelError::Closed);
            return Ok(false);
        }

        if message.requires_ack() && message.message_id() == Some(0) {
            let in_flight = &self.in_flight;
            let queue = &self.queue;
            let writing = &self.writing;
            let assigned = self.ids.next_id(|id| {
                in_flight.contains_key(&id)
                    || queue.iter().any(|o| o.message.message_id() == Some(id))
                    || writing
                        .as_ref()
                        .is_some_and(|w| w.outgoing.message.message_id() == Some(id))
            });
            match assigned {
                Ok(id) => {
                    message.set_message_id(id);
                }
                Err(e) => {
                    warn!("Rejecting send on channel {}: {}", self.id, e);
                    fail(completion, e);
                    return Ok(false);
                }
            }
        }

        let bytes = match self.encoder.encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "Rejecting {:?} on channel {}: {}",
                    message.message_type(),
                    self.id,
                    e
                );
                fail(completion, e.into());
                return Ok(false);
            }
        };
        if let Message::Connect(ref connect) = message {
            if self.role() == Role::Client {
                self.keep_alive.configure(connect.keep_alive);
            }
        }
        self.queue.push_back(Outgoing {
            message,
            bytes,
            completion,
            resend: false,
        });
        self.write_ready(now)?;
        Ok(true)
    }

    /// Queue a message the channel produces itself
    fn enqueue(&mut self, message: Message, resend: bool) -> Result<(), EncodeError> {
        let bytes = self.encoder.encode(&message)?;
        self.queue.push_back(Outgoing {
            message,
            bytes,
            completion: None,
            resend,
        });
        Ok(())
    }

    /// Drain readable bytes, dispatching each complete frame
    ///
    /// Returns `Ok(false)` once the peer has closed the stream or sent
    /// DISCONNECT; the owner must then close the channel.
    pub fn read_ready(
        &mut self,
        now: Instant,
        handler: &mut dyn MessageHandler,
        ctx: &mut Outbox,
    ) -> Result<bool, ChannelError> {
        loop {
            if self.half_closed {
                return Ok(false);
            }
            if self.read_paused || !self.is_open() {
                return Ok(true);
            }
            let Some(stream) = self.stream.as_mut() else {
                return Ok(false);
            };

            let frame = match self.reader.read_frame(stream)? {
                ReadStatus::Frame(frame) => frame,
                ReadStatus::WouldBlock => return Ok(true),
                ReadStatus::Eof => {
                    debug!("Channel {} reached end of stream", self.id);
                    return Ok(false);
                }
            };
            let message = match self.decoder.decode(&frame)? {
                Some((message, _)) => message,
                None => return Err(DecodeError::InsufficientData.into()),
            };

            self.last_received = now;
            trace!("Received {:?} on channel {}", message.message_type(), self.id);
            self.received(message, now, handler, ctx)?;
            // Stop at the frame boundary rather than when the action is applied
            if ctx.pause_pending(self.id) {
                self.read_paused = true;
            }
        }
    }

    fn received(
        &mut self,
        message: Message,
        now: Instant,
        handler: &mut dyn MessageHandler,
        ctx: &mut Outbox,
    ) -> Result<(), ChannelError> {
        if message.is_ack() {
            if let Some(id) = message.message_id() {
                match self.in_flight.remove(&id) {
                    Some(entry) => {
                        if let Some(completion) = entry.completion {
                            completion.complete(Ok(Some(message.clone())));
                        }
                    }
                    None => debug!("Ack for unknown message {} on channel {}", id, self.id),
                }
            }
        }

        let mut refused = None;
        match &message {
            Message::Connect(connect) => {
                if self.role() == Role::Client {
                    return Err(ChannelError::ProtocolViolation(
                        "CONNECT received on a client channel",
                    ));
                }
                self.keep_alive.configure(connect.keep_alive);
            }
            Message::ConnAck(ack) => {
                if self.role() == Role::Broker {
                    return Err(ChannelError::ProtocolViolation(
                        "CONNACK received on a broker channel",
                    ));
                }
                if ack.is_accepted() {
                    self.enter_connected();
                } else {
                    refused = Some(ack.return_code);
                }
            }
            Message::PingReq if self.role() == Role::Broker => {
                self.enqueue(Message::PingResp, false)?;
                self.write_ready(now)?;
            }
            Message::PingResp => self.keep_alive.ping_response(),
            Message::Disconnect => self.half_closed = true,
            _ => {}
        }

        dispatch(handler, ctx, self.id, message);

        match refused {
            Some(code) => Err(ChannelError::ConnectionRefused(code)),
            None => Ok(()),
        }
    }

    /// Write queued bytes until the stream would block
    ///
    /// Returns `Ok(false)` once a flushed DISCONNECT or rejecting CONNACK
    /// has half-closed the channel.
    pub fn write_ready(&mut self, now: Instant) -> Result<bool, ChannelError> {
        if !self.is_open() {
            return Ok(!self.is_closed());
        }

        while !self.half_closed {
            if self.writing.is_none() {
                let Some(outgoing) = self.queue.pop_front() else {
                    break;
                };
                trace!(
                    "Writing {:?} ({} bytes) on channel {}",
                    outgoing.message.message_type(),
                    outgoing.bytes.len(),
                    self.id
                );
                self.writing = Some(Writing {
                    written: 0,
                    outgoing,
                });
            }

            let (Some(stream), Some(writing)) = (self.stream.as_mut(), self.writing.as_mut())
            else {
                break;
            };
            match stream.write(&writing.outgoing.bytes[writing.written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "stream closed").into())
                }
                Ok(n) => {
                    writing.written += n;
                    if writing.written == writing.outgoing.bytes.len() {
                        if let Some(done) = self.writing.take() {
                            self.last_sent = now;
                            self.flushed(done.outgoing, now);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(!self.half_closed)
    }

    fn flushed(&mut self, outgoing: Outgoing, now: Instant) {
        let Outgoing {
            message,
            completion,
            resend,
            ..
        } = outgoing;

        match &message {
            Message::ConnAck(ack) if ack.is_accepted() => self.enter_connected(),
            Message::ConnAck(_) | Message::Disconnect => {
                debug!(
                    "Channel {} half closed after {:?}",
                    self.id,
                    message.message_type()
                );
                self.half_closed = true;
            }
            _ => {}
        }

        if !message.requires_ack() {
            if let Some(completion) = completion {
                completion.complete(Ok(None));
            }
            return;
        }

        let id = message.message_id().unwrap_or(0);
        let resend_at = (!self.resend_interval.is_zero()).then(|| now + self.resend_interval);
        if resend {
            // Acked while the copy was queued: nothing left to track
            if let Some(entry) = self.in_flight.get_mut(&id) {
                entry.resend_at = resend_at;
            }
        } else {
            self.next_seq += 1;
            self.in_flight.insert(
                id,
                InFlight {
                    message,
                    resend_at,
                    seq: self.next_seq,
                    completion,
                },
            );
        }
    }

    fn enter_connected(&mut self) {
        if self.state == ChannelState::Open {
            self.state = ChannelState::Connected;
            self.keep_alive.connected();
            debug!("Channel {} connected", self.id);
        }
    }

    /// Run resend and keep-alive timers
    ///
    /// Returns the next instant this channel needs servicing, if any.
    pub fn house_keeping(&mut self, now: Instant) -> Result<Option<Instant>, ChannelError> {
        if !self.is_open() {
            return Ok(None);
        }
        let mut next = None;

        if !self.resend_interval.is_zero() {
            let mut due: Vec<(u64, u16)> = self
                .in_flight
                .iter()
                .filter(|(_, e)| e.resend_at.is_some_and(|at| at <= now))
                .map(|(id, e)| (e.seq, *id))
                .collect();
            due.sort_unstable();

            for (_, id) in due {
                let Some(entry) = self.in_flight.get_mut(&id) else {
                    continue;
                };
                entry.resend_at = None;
                entry.message.set_duplicate(true);
                let message = entry.message.clone();
                debug!("Resending message {} on channel {}", id, self.id);
                self.enqueue(message, true)?;
            }
        }

        // A paused channel leaves the peer's frames unread
        let keep_alive = if self.read_paused {
            KeepAliveCheck::Idle
        } else {
            self.keep_alive
                .check(now, self.last_sent, self.last_received)
        };
        match keep_alive {
            KeepAliveCheck::Idle => {}
            KeepAliveCheck::Until(at) => next = earliest(next, at),
            KeepAliveCheck::SendPing(at) => {
                trace!("Sending keep alive ping on channel {}", self.id);
                self.enqueue(Message::PingReq, false)?;
                next = earliest(next, at);
            }
            KeepAliveCheck::Expired => {
                info!("Keep alive expired on channel {}", self.id);
                return Err(ChannelError::KeepAliveTimeout);
            }
        }

        self.write_ready(now)?;

        for entry in self.in_flight.values() {
            if let Some(at) = entry.resend_at {
                next = earliest(next, at);
            }
        }
        Ok(next)
    }

    /// Release the stream and notify the handler. Idempotent.
    ///
    /// Pending send completions fail with the close cause. The owner is
    /// responsible for removing the stream from its poller beforehand.
    pub fn close(
        &mut self,
        cause: Option<ChannelError>,
        handler: &mut dyn MessageHandler,
        ctx: &mut Outbox,
    ) {
        if self.is_closed() {
            return;
        }
        let was_connected = self.is_connected();
        self.state = ChannelState::Closed;
        self.stream = None;

        let error = cause.clone().unwrap_or(ChannelError::Closed);
        if let Some(writing) = self.writing.take() {
            fail(writing.outgoing.completion, error.clone());
        }
        for outgoing in self.queue.drain(..) {
            fail(outgoing.completion, error.clone());
        }
        for (_, entry) in self.in_flight.drain() {
            fail(entry.completion, error.clone());
        }

        match &cause {
            Some(e) => debug!("Channel {} closed: {}", self.id, e),
            None => debug!("Channel {} closed", self.id),
        }

        if was_connected {
            self.keep_alive.disconnected();
            handler.channel_disconnected(ctx, self.id);
        }
        handler.channel_closed(ctx, self.id, cause.as_ref());
    }
}

fn fail(completion: Option<SendCompletion>, error: ChannelError) {
    if let Some(completion) = completion {
        completion.complete(Err(CommandError::Channel(error)));
    }
}

fn earliest(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}
