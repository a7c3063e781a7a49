//! Handler callbacks and deferred reactor actions
//!
//! Handlers never touch other channels directly. Everything a callback
//! wants done to a channel, including the one being serviced, is queued on
//! the [`Outbox`] and applied by the reactor once the callback returns.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use tracing::trace;

use super::{ChannelError, ChannelId, ChannelIdSource};
use crate::protocol::{
    ConnAck, Connect, Message, MessageType, PubAck, PubComp, PubRec, PubRel, Publish, SubAck,
    Subscribe, UnsubAck, Unsubscribe,
};

/// Per-channel message callbacks
///
/// Every method defaults to ignoring the message, so a handler only
/// implements the kinds its role cares about.
pub trait MessageHandler {
    fn connect(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Connect) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::Connect);
    }

    fn conn_ack(&mut self, ctx: &mut Outbox, channel: ChannelId, message: ConnAck) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::ConnAck);
    }

    fn publish(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Publish) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::Publish);
    }

    fn pub_ack(&mut self, ctx: &mut Outbox, channel: ChannelId, message: PubAck) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::PubAck);
    }

    fn pub_rec(&mut self, ctx: &mut Outbox, channel: ChannelId, message: PubRec) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::PubRec);
    }

    fn pub_rel(&mut self, ctx: &mut Outbox, channel: ChannelId, message: PubRel) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::PubRel);
    }

    fn pub_comp(&mut self, ctx: &mut Outbox, channel: ChannelId, message: PubComp) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::PubComp);
    }

    fn subscribe(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Subscribe) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::Subscribe);
    }

    fn sub_ack(&mut self, ctx: &mut Outbox, channel: ChannelId, message: SubAck) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::SubAck);
    }

    fn unsubscribe(&mut self, ctx: &mut Outbox, channel: ChannelId, message: Unsubscribe) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::Unsubscribe);
    }

    fn unsub_ack(&mut self, ctx: &mut Outbox, channel: ChannelId, message: UnsubAck) {
        let _ = (ctx, message);
        unhandled(channel, MessageType::UnsubAck);
    }

    /// PINGRESP has already been queued when this runs on a broker channel
    fn ping_req(&mut self, ctx: &mut Outbox, channel: ChannelId) {
        let _ = ctx;
        unhandled(channel, MessageType::PingReq);
    }

    fn ping_resp(&mut self, ctx: &mut Outbox, channel: ChannelId) {
        let _ = ctx;
        unhandled(channel, MessageType::PingResp);
    }

    fn disconnect(&mut self, ctx: &mut Outbox, channel: ChannelId) {
        let _ = ctx;
        unhandled(channel, MessageType::Disconnect);
    }

    /// The stream is established
    fn channel_opened(&mut self, ctx: &mut Outbox, channel: ChannelId) {
        let _ = (ctx, channel);
    }

    /// The channel is closing after having reached the connected state
    fn channel_disconnected(&mut self, ctx: &mut Outbox, channel: ChannelId) {
        let _ = (ctx, channel);
    }

    /// Final notification. `cause` is `None` for an orderly close.
    fn channel_closed(&mut self, ctx: &mut Outbox, channel: ChannelId, cause: Option<&ChannelError>) {
        let _ = (ctx, channel, cause);
    }
}

fn unhandled(channel: ChannelId, kind: MessageType) {
    trace!("Ignoring {:?} on channel {}", kind, channel);
}

/// Route a decoded message to its callback
pub(crate) fn dispatch(
    handler: &mut dyn MessageHandler,
    ctx: &mut Outbox,
    channel: ChannelId,
    message: Message,
) {
    match message {
        Message::Connect(m) => handler.connect(ctx, channel, *m),
        Message::ConnAck(m) => handler.conn_ack(ctx, channel, m),
        Message::Publish(m) => handler.publish(ctx, channel, m),
        Message::PubAck(m) => handler.pub_ack(ctx, channel, m),
        Message::PubRec(m) => handler.pub_rec(ctx, channel, m),
        Message::PubRel(m) => handler.pub_rel(ctx, channel, m),
        Message::PubComp(m) => handler.pub_comp(ctx, channel, m),
        Message::Subscribe(m) => handler.subscribe(ctx, channel, m),
        Message::SubAck(m) => handler.sub_ack(ctx, channel, m),
        Message::Unsubscribe(m) => handler.unsubscribe(ctx, channel, m),
        Message::UnsubAck(m) => handler.unsub_ack(ctx, channel, m),
        Message::PingReq => handler.ping_req(ctx, channel),
        Message::PingResp => handler.ping_resp(ctx, channel),
        Message::Disconnect => handler.disconnect(ctx, channel),
    }
}

/// A deferred request from a handler to its reactor
pub enum Action {
    Send {
        channel: ChannelId,
        message: Message,
    },
    Close(ChannelId),
    PauseRead(ChannelId),
    ResumeRead(ChannelId),
    /// Open a client channel under an id already handed out
    Connect {
        channel: ChannelId,
        addr: SocketAddr,
        handler: Box<dyn MessageHandler>,
    },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Send { channel, message } => f
                .debug_struct("Send")
                .field("channel", channel)
                .field("message", message)
                .finish(),
            Action::Close(channel) => f.debug_tuple("Close").field(channel).finish(),
            Action::PauseRead(channel) => f.debug_tuple("PauseRead").field(channel).finish(),
            Action::ResumeRead(channel) => f.debug_tuple("ResumeRead").field(channel).finish(),
            Action::Connect { channel, addr, .. } => f
                .debug_struct("Connect")
                .field("channel", channel)
                .field("addr", addr)
                .finish_non_exhaustive(),
        }
    }
}

/// Queue of actions produced by handler callbacks
pub struct Outbox {
    actions: VecDeque<Action>,
    ids: ChannelIdSource,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(ChannelIdSource::default())
    }
}

impl Outbox {
    pub fn new(ids: ChannelIdSource) -> Self {
        Self {
            actions: VecDeque::new(),
            ids,
        }
    }

    pub fn send(&mut self, channel: ChannelId, message: impl Into<Message>) {
        self.actions.push_back(Action::Send {
            channel,
            message: message.into(),
        });
    }

    pub fn close(&mut self, channel: ChannelId) {
        self.actions.push_back(Action::Close(channel));
    }

    pub fn pause_read(&mut self, channel: ChannelId) {
        self.actions.push_back(Action::PauseRead(channel));
    }

    pub fn resume_read(&mut self, channel: ChannelId) {
        self.actions.push_back(Action::ResumeRead(channel));
    }

    /// Open a new client channel; its id is usable immediately
    pub fn connect(&mut self, addr: SocketAddr, handler: Box<dyn MessageHandler>) -> ChannelId {
        let channel = self.ids.next_id();
        self.actions.push_back(Action::Connect {
            channel,
            addr,
            handler,
        });
        channel
    }

    /// Whether the last queued pause or resume for `channel` is a pause
    pub fn pause_pending(&self, channel: ChannelId) -> bool {
        self.actions
            .iter()
            .rev()
            .find_map(|action| match action {
                Action::PauseRead(c) if *c == channel => Some(true),
                Action::ResumeRead(c) if *c == channel => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn pop(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Remove and return every queued action
    pub fn take(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }
}
