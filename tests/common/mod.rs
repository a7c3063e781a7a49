//! Shared helpers for loopback integration tests

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};

use mqttmux::channel::{ChannelError, ChannelId, MessageHandler, Outbox};
use mqttmux::codec::{Decoder, Encoder};
use mqttmux::manager::Acceptor;
use mqttmux::protocol::{
    ConnAck, Connect, ConnectReturnCode, Message, PubAck, Publish, QoS,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Blocking MQTT peer speaking raw frames over a std socket
pub struct RawPeer {
    stream: TcpStream,
    buf: Vec<u8>,
    decoder: Decoder,
    encoder: Encoder,
}

impl RawPeer {
    pub fn connect(addr: SocketAddr) -> Self {
        Self::from_stream(TcpStream::connect(addr).unwrap())
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            buf: Vec::new(),
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    pub fn send(&mut self, message: impl Into<Message>) {
        let bytes = self.encoder.encode(&message.into()).unwrap();
        self.stream.write_all(&bytes).unwrap();
    }

    /// Next message, `Ok(None)` on end of stream, a timeout error if
    /// nothing arrives within `wait`
    pub fn try_recv(&mut self, wait: Duration) -> io::Result<Option<Message>> {
        self.stream.set_read_timeout(Some(wait))?;
        loop {
            if let Some((message, used)) = self.decoder.decode(&self.buf).unwrap() {
                self.buf.drain(..used);
                return Ok(Some(message));
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn recv(&mut self) -> Message {
        match self.try_recv(WAIT) {
            Ok(Some(message)) => message,
            Ok(None) => panic!("peer closed the connection"),
            Err(e) => panic!("no message within {:?}: {}", WAIT, e),
        }
    }

    /// Assert nothing arrives for `wait`
    pub fn expect_silence(&mut self, wait: Duration) {
        match self.try_recv(wait) {
            Err(e) if is_timeout(&e) => {}
            other => panic!("expected silence, got {:?}", other),
        }
    }

    pub fn expect_closed(&mut self) {
        match self.try_recv(WAIT) {
            Ok(None) => {}
            other => panic!("expected end of stream, got {:?}", other),
        }
    }
}

pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// A listening raw peer standing in for an upstream broker
pub fn raw_broker() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub fn accept(listener: &TcpListener) -> RawPeer {
    let (stream, _) = listener.accept().unwrap();
    RawPeer::from_stream(stream)
}

pub fn connect_message(client_id: &str, keep_alive: u16) -> Connect {
    Connect {
        client_id: client_id.to_string(),
        clean_session: false,
        keep_alive,
        ..Default::default()
    }
}

pub fn publish(id: u16, topic: &str, payload: &'static [u8]) -> Publish {
    Publish {
        qos: QoS::AtLeastOnce,
        topic: Arc::from(topic),
        message_id: id,
        payload: Bytes::from_static(payload),
        ..Default::default()
    }
}

/// What a recording handler saw
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Opened(ChannelId),
    Received(ChannelId, Message),
    Disconnected(ChannelId),
    Closed(ChannelId, Option<String>),
}

/// Forwards every callback to a channel; `broker` mode answers like a
/// minimal broker
pub struct Recorder {
    events: Sender<Event>,
    broker: bool,
}

impl Recorder {
    pub fn client() -> (Self, Receiver<Event>) {
        let (events, rx) = crossbeam_channel::unbounded();
        (
            Self {
                events,
                broker: false,
            },
            rx,
        )
    }

    fn record(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

impl MessageHandler for Recorder {
    fn connect(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Connect) {
        self.record(Event::Received(channel, Message::Connect(Box::new(message))));
        if self.broker {
            ctx.send(channel, ConnAck::new(ConnectReturnCode::Accepted));
        }
    }

    fn conn_ack(&mut self, _ctx: &mut Outbox, channel: ChannelId, message: ConnAck) {
        self.record(Event::Received(channel, message.into()));
    }

    fn publish(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Publish) {
        let id = message.message_id;
        let qos = message.qos;
        self.record(Event::Received(channel, message.into()));
        if self.broker && qos == QoS::AtLeastOnce {
            ctx.send(channel, PubAck::new(id));
        }
    }

    fn pub_ack(&mut self, _ctx: &mut Outbox, channel: ChannelId, message: PubAck) {
        self.record(Event::Received(channel, message.into()));
    }

    fn channel_opened(&mut self, _ctx: &mut Outbox, channel: ChannelId) {
        self.record(Event::Opened(channel));
    }

    fn channel_disconnected(&mut self, _ctx: &mut Outbox, channel: ChannelId) {
        self.record(Event::Disconnected(channel));
    }

    fn channel_closed(&mut self, _ctx: &mut Outbox, channel: ChannelId, cause: Option<&ChannelError>) {
        self.record(Event::Closed(channel, cause.map(|e| e.to_string())));
    }
}

/// Acceptor handing every connection a broker-mode [`Recorder`]
pub struct MockBroker {
    events: Sender<Event>,
}

impl MockBroker {
    pub fn new() -> (Self, Receiver<Event>) {
        let (events, rx) = crossbeam_channel::unbounded();
        (Self { events }, rx)
    }
}

impl Acceptor for MockBroker {
    fn accepted(
        &mut self,
        _ctx: &mut Outbox,
        _channel: ChannelId,
        _peer: SocketAddr,
    ) -> Box<dyn MessageHandler> {
        Box::new(Recorder {
            events: self.events.clone(),
            broker: true,
        })
    }
}

/// Wait for the first event matching `pred`, skipping others
pub fn wait_for(events: &Receiver<Event>, pred: impl Fn(&Event) -> bool) -> Event {
    loop {
        match events.recv_timeout(WAIT) {
            Ok(event) if pred(&event) => return event,
            Ok(_) => continue,
            Err(e) => panic!("expected event not seen: {}", e),
        }
    }
}
