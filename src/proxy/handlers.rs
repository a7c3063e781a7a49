//! Channel handlers binding proxy channels to their session

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use tracing::{debug, warn};

use super::{Registry, SharedSession};
use crate::channel::{ChannelError, ChannelId, MessageHandler, Outbox};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Message, PubAck, Publish, SubAck, Subscribe, UnsubAck,
    Unsubscribe,
};
use crate::session::Session;

/// Handler for a client-facing channel
pub struct DownstreamHandler {
    registry: Registry,
    broker: SocketAddr,
    max_in_flight: usize,
    session: Option<SharedSession>,
}

impl DownstreamHandler {
    pub(crate) fn new(registry: Registry, broker: SocketAddr, max_in_flight: usize) -> Self {
        Self {
            registry,
            broker,
            max_in_flight,
            session: None,
        }
    }

    /// Existing session for the client id, or a new one with its upstream
    /// channel being opened
    fn session_for(&self, ctx: &mut Outbox, connect: &Connect) -> SharedSession {
        if let Some(session) = self.registry.get(&connect.client_id) {
            return session;
        }

        let upstream = ctx.connect(
            self.broker,
            Box::new(UpstreamHandler::new(
                self.registry.clone(),
                connect.client_id.clone(),
            )),
        );
        debug!(
            "New session {} with upstream channel {} to {}",
            connect.client_id, upstream, self.broker
        );
        let session = Rc::new(RefCell::new(Session::new(
            connect.clone(),
            upstream,
            self.max_in_flight,
        )));
        self.registry.insert(session.clone());
        session
    }

    fn forward(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Message) {
        match &self.session {
            Some(session) => session.borrow_mut().forward_upstream(ctx, channel, message),
            None => not_connected(ctx, channel),
        }
    }
}

fn not_connected(ctx: &mut Outbox, channel: ChannelId) {
    warn!("Channel {} sent a message before CONNECT", channel);
    ctx.close(channel);
}

impl MessageHandler for DownstreamHandler {
    fn connect(&mut self, ctx: &mut Outbox, channel: ChannelId, connect: Connect) {
        if self.session.is_some() {
            warn!("Second CONNECT on channel {}", channel);
            ctx.close(channel);
            return;
        }
        if connect.clean_session {
            debug!("Refusing clean session from channel {}", channel);
            ctx.send(channel, ConnAck::new(ConnectReturnCode::Other));
            return;
        }

        let session = self.session_for(ctx, &connect);
        let attached = session.borrow_mut().attach(ctx, channel, &connect);
        if attached {
            self.session = Some(session);
        } else if session.borrow().is_closing() {
            // Turned away without a CONNACK
            ctx.close(channel);
        }
    }

    fn publish(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Publish) {
        self.forward(ctx, channel, message.into());
    }

    fn subscribe(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Subscribe) {
        self.forward(ctx, channel, message.into());
    }

    fn unsubscribe(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Unsubscribe) {
        self.forward(ctx, channel, message.into());
    }

    fn pub_ack(&mut self, ctx: &mut Outbox, channel: ChannelId, message: PubAck) {
        match &self.session {
            Some(session) => session.borrow_mut().downstream_puback(ctx, channel, message),
            None => not_connected(ctx, channel),
        }
    }

    fn ping_req(&mut self, _ctx: &mut Outbox, _channel: ChannelId) {}

    fn disconnect(&mut self, _ctx: &mut Outbox, channel: ChannelId) {
        debug!("Channel {} disconnecting", channel);
    }

    fn channel_closed(&mut self, ctx: &mut Outbox, channel: ChannelId, cause: Option<&ChannelError>) {
        if let Some(cause) = cause {
            debug!("Downstream channel {} closed: {}", channel, cause);
        }
        if let Some(session) = self.session.take() {
            session.borrow_mut().detach(ctx, channel);
            self.registry.remove_if_finished(&session);
        }
    }
}

/// Handler for a session's broker-facing channel
pub struct UpstreamHandler {
    registry: Registry,
    client_id: String,
}

impl UpstreamHandler {
    pub(crate) fn new(registry: Registry, client_id: String) -> Self {
        Self {
            registry,
            client_id,
        }
    }

    /// The session this channel serves, if it is still registered
    fn session(&self, channel: ChannelId) -> Option<SharedSession> {
        self.registry
            .get(&self.client_id)
            .filter(|session| session.borrow().upstream() == channel)
    }

    fn ack(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Message) {
        if let Some(session) = self.session(channel) {
            session.borrow_mut().upstream_ack(ctx, message);
        }
    }
}

impl MessageHandler for UpstreamHandler {
    fn channel_opened(&mut self, ctx: &mut Outbox, channel: ChannelId) {
        if let Some(session) = self.session(channel) {
            session.borrow_mut().upstream_opened(ctx);
        }
    }

    fn conn_ack(&mut self, ctx: &mut Outbox, channel: ChannelId, message: ConnAck) {
        if let Some(session) = self.session(channel) {
            session.borrow_mut().upstream_connack(ctx, message);
        }
    }

    fn publish(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Publish) {
        if let Some(session) = self.session(channel) {
            session.borrow_mut().upstream_publish(ctx, message);
        }
    }

    fn pub_ack(&mut self, ctx: &mut Outbox, channel: ChannelId, message: PubAck) {
        self.ack(ctx, channel, message.into());
    }

    fn sub_ack(&mut self, ctx: &mut Outbox, channel: ChannelId, message: SubAck) {
        self.ack(ctx, channel, message.into());
    }

    fn unsub_ack(&mut self, ctx: &mut Outbox, channel: ChannelId, message: UnsubAck) {
        self.ack(ctx, channel, message.into());
    }

    fn ping_resp(&mut self, _ctx: &mut Outbox, _channel: ChannelId) {}

    fn channel_closed(&mut self, ctx: &mut Outbox, channel: ChannelId, cause: Option<&ChannelError>) {
        match cause {
            Some(cause) => warn!(
                "Upstream channel {} of session {} closed: {}",
                channel, self.client_id, cause
            ),
            None => debug!(
                "Upstream channel {} of session {} closed",
                channel, self.client_id
            ),
        }
        if let Some(session) = self.session(channel) {
            session.borrow_mut().upstream_closed(ctx);
            self.registry.remove_if_finished(&session);
        }
    }
}
