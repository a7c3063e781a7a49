//! mqttmux - MQTT 3.1 transport core
//!
//! A frame codec, a single-threaded mio reactor hosting any number of
//! protocol channels, and a proxy that lets many equivalent client
//! connections share one upstream broker session.

pub mod channel;
pub mod codec;
pub mod command;
pub mod config;
pub mod manager;
pub mod protocol;
pub mod proxy;
pub mod session;

pub use channel::{Channel, ChannelError, ChannelId, MessageHandler, Outbox, Role};
pub use command::{CommandError, CommandFuture};
pub use config::Config;
pub use manager::{Acceptor, ChannelManager, Reactor};
pub use protocol::{Message, QoS};
pub use proxy::ProxyBroker;
pub use session::Session;
