//! N:1 MQTT proxy
//!
//! Accepted downstream connections are grouped by client id. The first
//! CONNECT for a client id founds a [`Session`] and opens its upstream
//! channel to the broker; later connections presenting an equivalent CONNECT
//! join the same session.
//!
//! All proxy state lives on the reactor thread. [`ProxyBroker`] is built by
//! the listen factory there and shares its registry with the handlers it
//! hands out.

mod handlers;


use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, info};

use crate::channel::{ChannelId, MessageHandler, Outbox};
use crate::command::CommandError;
use crate::config::{ConfigError, ProxyConfig};
use crate::manager::{Acceptor, ChannelManager};
use crate::session::Session;

pub use handlers::{DownstreamHandler, UpstreamHandler};

pub(crate) type SharedSession = Rc<RefCell<Session>>;

/// Live sessions keyed by client id
#[derive(Clone, Default)]
pub struct Registry {
    sessions: Rc<RefCell<AHashMap<Arc<str>, SharedSession>>>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.sessions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.borrow().is_empty()
    }

    pub fn get(&self, client_id: &str) -> Option<SharedSession> {
        self.sessions.borrow().get(client_id).cloned()
    }

    pub(crate) fn insert(&self, session: SharedSession) {
        let client_id = session.borrow().client_id().clone();
        self.sessions.borrow_mut().insert(client_id, session);
    }

    /// Drop `session` if it has nothing left to serve and is still the one
    /// registered under its client id
    pub(crate) fn remove_if_finished(&self, session: &SharedSession) {
        let (finished, client_id) = {
            let s = session.borrow();
            (s.is_finished(), s.client_id().clone())
        };
        if !finished {
            return;
        }
        let mut sessions = self.sessions.borrow_mut();
        if sessions
            .get(&client_id)
            .is_some_and(|current| Rc::ptr_eq(current, session))
        {
            sessions.remove(&client_id);
            info!("Session {} finished ({} remaining)", client_id, sessions.len());
        }
    }
}

/// Acceptor that turns every accepted connection into a proxy downstream
pub struct ProxyBroker {
    registry: Registry,
    broker: SocketAddr,
    max_in_flight: usize,
}

impl ProxyBroker {
    /// `broker` is the upstream address every new session connects to
    pub fn new(broker: SocketAddr, max_in_flight: usize) -> Self {
        Self {
            registry: Registry::default(),
            broker,
            max_in_flight,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handler for a downstream channel
    pub fn downstream(&self) -> DownstreamHandler {
        DownstreamHandler::new(self.registry.clone(), self.broker, self.max_in_flight)
    }
}

impl Acceptor for ProxyBroker {
    fn accepted(
        &mut self,
        _ctx: &mut Outbox,
        channel: ChannelId,
        peer: SocketAddr,
    ) -> Box<dyn MessageHandler> {
        debug!("Downstream channel {} accepted from {}", channel, peer);
        Box::new(self.downstream())
    }
}

/// Proxy startup error
#[derive(Debug)]
pub enum ProxyError {
    Config(ConfigError),
    Command(CommandError),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Config(e) => write!(f, "{}", e),
            ProxyError::Command(e) => write!(f, "Listen failed: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Config(e) => Some(e),
            ProxyError::Command(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ProxyError {
    fn from(e: ConfigError) -> Self {
        ProxyError::Config(e)
    }
}

impl From<CommandError> for ProxyError {
    fn from(e: CommandError) -> Self {
        ProxyError::Command(e)
    }
}

/// Start proxying on `config.bind`; returns the bound address
///
/// The broker URI is validated and resolved, once, before anything is
/// bound. Sessions opened later reuse that address.
pub fn start(manager: &ChannelManager, config: &ProxyConfig) -> Result<SocketAddr, ProxyError> {
    let uri = config.broker()?;
    let broker = uri.resolve()?;
    let max_in_flight = usize::from(config.max_in_flight);
    let addr = manager.listen(config.bind, move || {
        ProxyBroker::new(broker, max_in_flight)
    })?;
    info!("Proxy listening on {}, upstream {} ({})", addr, uri, broker);
    Ok(addr)
}
