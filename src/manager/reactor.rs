//! Single-threaded readiness loop
//!
//! The reactor owns every channel and listener registered with its mio
//! `Poll`. Each iteration waits for readiness or the next housekeeping
//! deadline, runs queued commands in submission order, services signalled
//! channels, applies handler actions and finally recomputes the deadline.

use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use crossbeam_channel::Receiver;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{
    Action, Channel, ChannelError, ChannelId, ChannelIdSource, ChannelOptions, ChannelState,
    MessageHandler, Outbox, Role, SendCompletion,
};
use crate::command::{panic_message, CommandError};
use crate::protocol::Message;

/// Token reserved for the cross-thread waker
pub(crate) const WAKER: Token = Token(0);

const EVENTS_CAPACITY: usize = 1024;

/// Work submitted from other threads
pub(crate) type Command = Box<dyn FnOnce(&mut Reactor) + Send>;

/// Produces handlers for connections accepted on a listening socket
pub trait Acceptor {
    fn accepted(
        &mut self,
        ctx: &mut Outbox,
        channel: ChannelId,
        peer: SocketAddr,
    ) -> Box<dyn MessageHandler>;
}

impl<F> Acceptor for F
where
    F: FnMut(&mut Outbox, ChannelId, SocketAddr) -> Box<dyn MessageHandler>,
{
    fn accepted(
        &mut self,
        ctx: &mut Outbox,
        channel: ChannelId,
        peer: SocketAddr,
    ) -> Box<dyn MessageHandler> {
        self(ctx, channel, peer)
    }
}

/// Handler of a registered channel. Only channels opened through the
/// manager API carry a `Send` handler and may move to another reactor.
enum Handler {
    Local(Box<dyn MessageHandler>),
    Movable(Box<dyn MessageHandler + Send>),
}

impl Handler {
    fn get_mut(&mut self) -> &mut dyn MessageHandler {
        match self {
            Handler::Local(handler) => &mut **handler,
            Handler::Movable(handler) => &mut **handler,
        }
    }
}

struct Registration {
    channel: Channel<TcpStream>,
    handler: Handler,
}

/// A live channel detached from its reactor, on its way to another
pub(crate) struct Transfer {
    channel: Channel<TcpStream>,
    handler: Box<dyn MessageHandler + Send>,
}

impl Transfer {
    pub(crate) fn id(&self) -> ChannelId {
        self.channel.id()
    }
}

struct Listener {
    socket: TcpListener,
    acceptor: Box<dyn Acceptor>,
}

/// Event loop state; only ever touched from its own thread
pub struct Reactor {
    poll: Poll,
    channels: AHashMap<ChannelId, Registration>,
    listeners: AHashMap<Token, Listener>,
    ids: ChannelIdSource,
    outbox: Outbox,
    options: ChannelOptions,
    commands: Receiver<Command>,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    pub(crate) fn new(
        poll: Poll,
        ids: ChannelIdSource,
        options: ChannelOptions,
        commands: Receiver<Command>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            poll,
            channels: AHashMap::new(),
            listeners: AHashMap::new(),
            outbox: Outbox::new(ids.clone()),
            ids,
            options,
            commands,
            shutdown,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn contains(&self, channel: ChannelId) -> bool {
        self.channels.contains_key(&channel)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }

    pub fn channel_state(&self, channel: ChannelId) -> Option<ChannelState> {
        self.channels.get(&channel).map(|r| r.channel.state())
    }

    pub fn in_flight(&self, channel: ChannelId) -> Option<usize> {
        self.channels.get(&channel).map(|r| r.channel.in_flight_count())
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut deadline: Option<Instant> = None;
        info!("Reactor started");

        loop {
            let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Reactor poll failed: {}", e);
                self.close_all(Some(e.into()));
                return;
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            self.run_commands();

            let now = Instant::now();
            for event in events.iter() {
                let token = event.token();
                if token == WAKER {
                    continue;
                }
                if self.listeners.contains_key(&token) {
                    self.accept_pending(token);
                    continue;
                }
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed();
                self.service(ChannelId(token.0), readable, writable, now);
            }
            self.apply_actions();

            deadline = self.house_keeping();
        }

        self.close_all(None);
        info!("Reactor stopped");
    }

    fn run_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| command(self))) {
                warn!("Command panicked: {}", panic_message(payload));
            }
            self.apply_actions();
        }
    }

    /// Open an outbound client channel under a pre-allocated id
    pub fn open_client(
        &mut self,
        channel: ChannelId,
        addr: SocketAddr,
        handler: Box<dyn MessageHandler>,
    ) -> Result<ChannelId, ChannelError> {
        self.connect(channel, addr, Handler::Local(handler))
    }

    fn connect(
        &mut self,
        channel: ChannelId,
        addr: SocketAddr,
        mut handler: Handler,
    ) -> Result<ChannelId, ChannelError> {
        match self.connect_stream(channel, addr) {
            Ok(stream) => {
                debug!("Connecting channel {} to {}", channel, addr);
                let registration = Registration {
                    channel: Channel::connecting(
                        channel,
                        stream,
                        Role::Client,
                        self.options,
                        Instant::now(),
                    ),
                    handler,
                };
                self.channels.insert(channel, registration);
                Ok(channel)
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", addr, e);
                let cause = ChannelError::from(e);
                handler
                    .get_mut()
                    .channel_closed(&mut self.outbox, channel, Some(&cause));
                self.apply_actions();
                Err(cause)
            }
        }
    }

    fn connect_stream(&self, channel: ChannelId, addr: SocketAddr) -> io::Result<TcpStream> {
        let mut stream = TcpStream::connect(addr)?;
        self.poll.registry().register(
            &mut stream,
            Token(channel.0),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(stream)
    }

    /// Client channel whose handler may later move to another reactor
    pub(crate) fn open_movable_client(
        &mut self,
        channel: ChannelId,
        addr: SocketAddr,
        handler: Box<dyn MessageHandler + Send>,
    ) -> Result<ChannelId, ChannelError> {
        self.connect(channel, addr, Handler::Movable(handler))
    }

    /// Accepted channel whose handler may later move to another reactor
    pub(crate) fn open_movable_accepted(
        &mut self,
        channel: ChannelId,
        stream: std::net::TcpStream,
        handler: Box<dyn MessageHandler + Send>,
    ) -> Result<ChannelId, ChannelError> {
        stream.set_nonblocking(true)?;
        self.adopt(channel, TcpStream::from_std(stream), Handler::Movable(handler))?;
        Ok(channel)
    }

    /// Take a live channel off this reactor without closing it
    ///
    /// Fails if the channel is unknown or its handler is tied to this
    /// reactor's thread; the channel then stays where it is.
    pub(crate) fn detach(&mut self, id: ChannelId) -> Result<Transfer, CommandError> {
        let registration = self
            .channels
            .remove(&id)
            .ok_or(CommandError::UnknownChannel(id))?;
        let (mut channel, handler) = match registration {
            Registration {
                channel,
                handler: Handler::Movable(handler),
            } => (channel, handler),
            local => {
                self.channels.insert(id, local);
                return Err(CommandError::NotTransferable(id));
            }
        };
        if let Some(stream) = channel.stream_mut() {
            if let Err(e) = self.poll.registry().deregister(stream) {
                warn!("Failed to deregister channel {}: {}", id, e);
                self.channels.insert(
                    id,
                    Registration {
                        channel,
                        handler: Handler::Movable(handler),
                    },
                );
                return Err(CommandError::Channel(e.into()));
            }
        }
        debug!("Channel {} detached", id);
        Ok(Transfer { channel, handler })
    }

    /// Register a channel detached from another reactor
    pub(crate) fn attach(&mut self, transfer: Transfer) -> Result<(), Transfer> {
        let Transfer {
            mut channel,
            handler,
        } = transfer;
        let id = channel.id();
        if self.channels.contains_key(&id) {
            warn!("Channel {} is already registered here", id);
            return Err(Transfer { channel, handler });
        }
        if let Some(stream) = channel.stream_mut() {
            if let Err(e) = self.poll.registry().register(
                stream,
                Token(id.0),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!("Failed to register transferred channel {}: {}", id, e);
                return Err(Transfer { channel, handler });
            }
        }
        self.channels.insert(
            id,
            Registration {
                channel,
                handler: Handler::Movable(handler),
            },
        );
        debug!("Channel {} attached", id);
        // Readiness seen by the previous reactor is not replayed
        self.service(id, true, true, Instant::now());
        self.apply_actions();
        Ok(())
    }

    /// Close a channel that could not be attached anywhere
    pub(crate) fn discard(&mut self, transfer: Transfer, cause: ChannelError) {
        let Transfer {
            mut channel,
            mut handler,
        } = transfer;
        channel.close(Some(cause), &mut *handler, &mut self.outbox);
        self.apply_actions();
    }

    fn adopt(
        &mut self,
        channel: ChannelId,
        mut stream: TcpStream,
        mut handler: Handler,
    ) -> io::Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            trace!("TCP_NODELAY on channel {} failed: {}", channel, e);
        }
        self.poll.registry().register(
            &mut stream,
            Token(channel.0),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        debug!("Channel {} opened", channel);
        handler.get_mut().channel_opened(&mut self.outbox, channel);
        let registration = Registration {
            channel: Channel::accepted(
                channel,
                stream,
                Role::Broker,
                self.options,
                Instant::now(),
            ),
            handler,
        };
        self.channels.insert(channel, registration);
        self.apply_actions();
        Ok(())
    }

    /// Bind a listening socket; accepted streams become broker channels
    pub fn listen(
        &mut self,
        addr: SocketAddr,
        acceptor: impl Acceptor + 'static,
    ) -> io::Result<SocketAddr> {
        let mut socket = TcpListener::bind(addr)?;
        let token = Token(self.ids.next_id().0);
        self.poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)?;
        let local = socket.local_addr()?;
        info!("Listening on {}", local);
        self.listeners.insert(
            token,
            Listener {
                socket,
                acceptor: Box::new(acceptor),
            },
        );
        Ok(local)
    }

    fn accept_pending(&mut self, token: Token) {
        loop {
            let Some(listener) = self.listeners.get_mut(&token) else {
                return;
            };
            let (stream, peer) = match listener.socket.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    return;
                }
            };
            let channel = self.ids.next_id();
            let handler = listener.acceptor.accepted(&mut self.outbox, channel, peer);
            debug!("Accepted {} as channel {}", peer, channel);
            if let Err(e) = self.adopt(channel, stream, Handler::Local(handler)) {
                warn!("Failed to register connection from {}: {}", peer, e);
            }
        }
    }

    /// Queue a message on a channel
    pub fn send(
        &mut self,
        channel: ChannelId,
        message: Message,
        completion: Option<SendCompletion>,
    ) -> bool {
        let Some(registration) = self.channels.get_mut(&channel) else {
            debug!("Send to unknown channel {}", channel);
            if let Some(completion) = completion {
                completion.complete(Err(CommandError::UnknownChannel(channel)));
            }
            return false;
        };
        let result = registration
            .channel
            .send(message, completion, Instant::now());
        let half_closed = registration.channel.is_half_closed();
        match result {
            Ok(sent) => {
                if half_closed {
                    self.close_channel(channel, None);
                }
                sent
            }
            Err(e) => {
                self.close_channel(channel, Some(e));
                false
            }
        }
    }

    /// Queue a message on every open channel; returns how many took it
    pub fn send_to_all(&mut self, message: &Message) -> usize {
        self.channel_ids()
            .into_iter()
            .filter(|&channel| self.send(channel, message.clone(), None))
            .count()
    }

    /// Close a channel, returns false if it was not registered
    pub fn close(&mut self, channel: ChannelId) -> bool {
        let closed = self.close_channel(channel, None);
        self.apply_actions();
        closed
    }

    fn close_channel(&mut self, channel: ChannelId, cause: Option<ChannelError>) -> bool {
        let Some(mut registration) = self.channels.remove(&channel) else {
            return false;
        };
        if let Some(stream) = registration.channel.stream_mut() {
            if let Err(e) = self.poll.registry().deregister(stream) {
                trace!("Deregister of channel {} failed: {}", channel, e);
            }
        }
        if let Some(ref e) = cause {
            match e {
                ChannelError::Decode(_) | ChannelError::ProtocolViolation(_) => {
                    warn!("Closing channel {}: {}", channel, e)
                }
                _ => debug!("Closing channel {}: {}", channel, e),
            }
        }
        let Registration {
            mut channel,
            mut handler,
        } = registration;
        channel.close(cause, handler.get_mut(), &mut self.outbox);
        true
    }

    fn close_all(&mut self, cause: Option<ChannelError>) {
        for channel in self.channel_ids() {
            self.close_channel(channel, cause.clone());
        }
        // Handlers may react by queueing more work; nothing is left to run it
        self.outbox.take();
        self.listeners.clear();
    }

    fn service(&mut self, channel: ChannelId, readable: bool, writable: bool, now: Instant) {
        let Some(registration) = self.channels.get_mut(&channel) else {
            return;
        };
        let result = service_channel(registration, &mut self.outbox, readable, writable, now);
        match result {
            Ok(true) => {}
            Ok(false) => {
                self.close_channel(channel, None);
            }
            Err(e) => {
                self.close_channel(channel, Some(e));
            }
        }
    }

    /// Apply deferred handler actions until none remain
    fn apply_actions(&mut self) {
        while let Some(action) = self.outbox.pop() {
            match action {
                Action::Send { channel, message } => {
                    self.send(channel, message, None);
                }
                Action::Close(channel) => {
                    self.close_channel(channel, None);
                }
                Action::PauseRead(channel) => {
                    if let Some(registration) = self.channels.get_mut(&channel) {
                        trace!("Pausing reads on channel {}", channel);
                        registration.channel.pause_read();
                    }
                }
                Action::ResumeRead(channel) => {
                    let paused = self
                        .channels
                        .get_mut(&channel)
                        .filter(|r| r.channel.is_read_paused());
                    if let Some(registration) = paused {
                        trace!("Resuming reads on channel {}", channel);
                        let now = Instant::now();
                        registration.channel.resume_read(now);
                        self.service(channel, true, false, now);
                    }
                }
                Action::Connect {
                    channel,
                    addr,
                    handler,
                } => {
                    // Failure has already been reported to the handler
                    let _ = self.open_client(channel, addr, handler);
                }
            }
        }
    }

    /// Run every channel's timers; returns the earliest next deadline
    fn house_keeping(&mut self) -> Option<Instant> {
        loop {
            let now = Instant::now();
            let mut next: Option<Instant> = None;
            let mut expired = Vec::new();

            for (&channel, registration) in self.channels.iter_mut() {
                match registration.channel.house_keeping(now) {
                    Ok(deadline) => {
                        if registration.channel.is_half_closed() {
                            expired.push((channel, None));
                        }
                        if let Some(at) = deadline {
                            next = Some(next.map_or(at, |n: Instant| n.min(at)));
                        }
                    }
                    Err(e) => expired.push((channel, Some(e))),
                }
            }

            if expired.is_empty() {
                return next;
            }
            for (channel, cause) in expired {
                self.close_channel(channel, cause);
            }
            // Closing may have moved work onto other channels
            self.apply_actions();
        }
    }
}

fn service_channel(
    registration: &mut Registration,
    outbox: &mut Outbox,
    readable: bool,
    writable: bool,
    now: Instant,
) -> Result<bool, ChannelError> {
    let Registration { channel, handler } = registration;
    if channel.state() == ChannelState::Opening {
        if !(readable || writable) {
            return Ok(true);
        }
        if !channel.finish_connect(now, handler.get_mut(), outbox)? {
            return Ok(true);
        }
    }
    if readable && !channel.read_ready(now, handler.get_mut(), outbox)? {
        return Ok(false);
    }
    if writable && !channel.write_ready(now)? {
        return Ok(false);
    }
    Ok(!channel.is_half_closed())
}
