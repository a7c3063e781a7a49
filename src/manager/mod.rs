//! Channel manager
//!
//! Public, thread-safe face of a [`Reactor`]. Every operation is shipped to
//! the reactor thread as a command. In blocking mode the caller waits for
//! the command's result; in non-blocking mode the call returns `Ok(None)`
//! right after submission.

mod reactor;

pub use reactor::{Acceptor, Reactor};

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use mio::{Poll, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::channel::{ChannelError, ChannelId, ChannelIdSource, ChannelOptions, MessageHandler};
use crate::command::{self, panic_message, CommandError, CommandFuture};
use crate::config::ChannelConfig;
use crate::protocol::Message;
use reactor::{Command, WAKER};

/// Submission side of a reactor's command queue
#[derive(Clone)]
struct ReactorHandle {
    commands: Sender<Command>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl ReactorHandle {
    fn push(&self, command: Command) -> Result<(), CommandError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CommandError::ShutDown);
        }
        self.commands
            .send(command)
            .map_err(|_| CommandError::ShutDown)?;
        self.waker.wake().map_err(|e| {
            error!("Failed to wake reactor: {}", e);
            CommandError::ShutDown
        })
    }
}

/// Owns one reactor thread and submits work to it
pub struct ChannelManager {
    handle: ReactorHandle,
    ids: ChannelIdSource,
    thread: Mutex<Option<JoinHandle<()>>>,
    blocking: bool,
    command_timeout: Option<Duration>,
}

impl ChannelManager {
    /// Spawn the reactor thread
    pub fn start(config: &ChannelConfig) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (commands, queue) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let ids = ChannelIdSource::process();
        let options = ChannelOptions {
            resend_interval: config.resend_interval,
            ..Default::default()
        };

        let reactor = {
            let ids = ids.clone();
            let shutdown = shutdown.clone();
            move || Reactor::new(poll, ids, options, queue, shutdown).run()
        };
        let thread = thread::Builder::new()
            .name("mqttmux-reactor".to_string())
            .spawn(reactor)?;

        debug!(
            "Channel manager started (blocking: {}, resend interval: {:?})",
            config.blocking, config.resend_interval
        );

        Ok(Self {
            handle: ReactorHandle {
                commands,
                waker,
                shutdown,
            },
            ids,
            thread: Mutex::new(Some(thread)),
            blocking: config.blocking,
            command_timeout: config.command_timeout,
        })
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Connect to a broker. The handler's `channel_opened` runs once the
    /// stream is established.
    ///
    /// `host` is resolved on the calling thread.
    pub fn new_client_channel<H>(
        &self,
        host: &str,
        port: u16,
        handler: H,
    ) -> Result<ChannelId, CommandError>
    where
        H: MessageHandler + Send + 'static,
    {
        let addr = resolve(host, port).map_err(|e| CommandError::Channel(e.into()))?;
        let channel = self.ids.next_id();
        self.execute(move |reactor| {
            reactor
                .open_movable_client(channel, addr, Box::new(handler))
                .map_err(CommandError::from)
        })?;
        Ok(channel)
    }

    /// Adopt a stream accepted elsewhere as a broker-side channel
    pub fn new_accepted_channel<H>(
        &self,
        stream: std::net::TcpStream,
        handler: H,
    ) -> Result<ChannelId, CommandError>
    where
        H: MessageHandler + Send + 'static,
    {
        let channel = self.ids.next_id();
        self.execute(move |reactor| {
            reactor
                .open_movable_accepted(channel, stream, Box::new(handler))
                .map_err(CommandError::from)
        })?;
        Ok(channel)
    }

    /// Send a message. When blocking, waits until the message is written,
    /// or acknowledged if it requires an ack, and returns the ack.
    pub fn send(&self, channel: ChannelId, message: Message) -> Result<Option<Message>, CommandError> {
        if !self.blocking {
            self.submit_detached(move |reactor| {
                reactor.send(channel, message, None);
            })?;
            return Ok(None);
        }

        let (completion, future) = command::pair();
        self.push(Box::new(move |reactor: &mut Reactor| {
            if completion.start() {
                reactor.send(channel, message, Some(completion));
            }
        }))?;
        self.wait(future)
    }

    /// Send a message on every channel; returns how many accepted it
    pub fn send_to_all(&self, message: Message) -> Result<Option<usize>, CommandError> {
        self.execute(move |reactor| Ok(reactor.send_to_all(&message)))
    }

    /// Close a channel; returns whether it was registered
    pub fn close(&self, channel: ChannelId) -> Result<Option<bool>, CommandError> {
        self.execute(move |reactor| Ok(reactor.close(channel)))
    }

    /// Move a live channel, with its handler, onto `target`'s reactor
    ///
    /// The channel keeps its id, stream and protocol state and is not closed
    /// on the way; this reactor stops polling it before the target starts.
    /// Only channels opened through [`ChannelManager::new_client_channel`]
    /// or [`ChannelManager::new_accepted_channel`] can move.
    pub fn transfer(
        &self,
        channel: ChannelId,
        target: &ChannelManager,
    ) -> Result<Option<()>, CommandError> {
        let handle = target.handle.clone();
        if !self.blocking {
            self.submit_detached(move |reactor| {
                if let Err(e) = hand_over(reactor, channel, handle) {
                    warn!("Transfer of channel {} failed: {}", channel, e);
                }
            })?;
            return Ok(None);
        }

        let attached = self.submit(move |reactor| hand_over(reactor, channel, handle))?;
        let attached = self.wait(attached)?;
        self.wait(attached).map(Some)
    }

    /// Bind a listener; `factory` runs on the reactor thread, so the
    /// acceptor it builds may hold thread-local state
    ///
    /// Always waits for the bound address, whatever the manager's mode.
    pub fn listen<F, A>(&self, addr: SocketAddr, factory: F) -> Result<SocketAddr, CommandError>
    where
        F: FnOnce() -> A + Send + 'static,
        A: Acceptor + 'static,
    {
        let future = self.submit(move |reactor| {
            reactor
                .listen(addr, factory())
                .map_err(|e| CommandError::Channel(e.into()))
        })?;
        self.wait(future)
    }

    /// Run a closure on the reactor thread
    pub fn execute<T, F>(&self, f: F) -> Result<Option<T>, CommandError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Reactor) -> Result<T, CommandError> + Send + 'static,
    {
        if self.blocking {
            let future = self.submit(f)?;
            self.wait(future).map(Some)
        } else {
            self.submit_detached(move |reactor| {
                if let Err(e) = f(reactor) {
                    warn!("Command failed: {}", e);
                }
            })?;
            Ok(None)
        }
    }

    /// Run a closure on the reactor thread and hand back its future,
    /// regardless of the manager's mode
    pub fn submit<T, F>(&self, f: F) -> Result<CommandFuture<T>, CommandError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Reactor) -> Result<T, CommandError> + Send + 'static,
    {
        let (completion, future) = command::pair();
        self.push(Box::new(move |reactor: &mut Reactor| {
            if !completion.start() {
                return;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(reactor)))
                .unwrap_or_else(|payload| Err(CommandError::Panicked(panic_message(payload))));
            completion.complete(result);
        }))?;
        Ok(future)
    }

    fn submit_detached<F>(&self, f: F) -> Result<(), CommandError>
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.push(Box::new(f))
    }

    fn push(&self, command: Command) -> Result<(), CommandError> {
        self.handle.push(command)
    }

    fn wait<T>(&self, future: CommandFuture<T>) -> Result<T, CommandError> {
        match self.command_timeout {
            Some(timeout) => future.wait_timeout(timeout),
            None => future.wait(),
        }
    }

    /// Stop the reactor, closing every channel, and wait for its thread
    pub fn shutdown(&self) {
        self.handle.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.handle.waker.wake() {
            error!("Failed to wake reactor for shutdown: {}", e);
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                warn!("Shutdown requested from the reactor thread; not joining");
                return;
            }
            if handle.join().is_err() {
                error!("Reactor thread panicked");
            }
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {}", host),
        )
    })
}

/// Detach `channel` here and queue its attachment on `target`
///
/// Runs on the source reactor and never waits on the target, so two
/// reactors trading channels cannot deadlock. If the target is gone the
/// channel goes back where it was.
fn hand_over(
    reactor: &mut Reactor,
    channel: ChannelId,
    target: ReactorHandle,
) -> Result<CommandFuture<()>, CommandError> {
    let moving = Arc::new(Mutex::new(Some(reactor.detach(channel)?)));
    let (completion, future) = command::pair();

    let slot = moving.clone();
    let pushed = target.push(Box::new(move |target: &mut Reactor| {
        let Some(transfer) = slot.lock().take() else {
            return;
        };
        match target.attach(transfer) {
            Ok(()) => completion.complete(Ok(())),
            Err(transfer) => {
                let id = transfer.id();
                target.discard(transfer, ChannelError::Closed);
                completion.complete(Err(CommandError::Channel(ChannelError::Closed)));
                warn!("Channel {} could not be attached and was closed", id);
            }
        }
    }));

    if let Err(e) = pushed {
        if let Some(transfer) = moving.lock().take() {
            if let Err(transfer) = reactor.attach(transfer) {
                reactor.discard(transfer, ChannelError::Closed);
            }
        }
        return Err(e);
    }
    debug!("Channel {} handed to another reactor", channel);
    Ok(future)
}
