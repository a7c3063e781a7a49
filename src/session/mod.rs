//! Proxy session multiplexer
//!
//! A session makes any number of equivalent downstream client connections
//! look like one client to the upstream broker. Downstream requests are
//! forwarded under ids from the session's own upstream id space; broker
//! publishes are spread round-robin over the attached members, each under
//! an id from that member's id space.
//!
//! Sessions live on the reactor thread and act only through an [`Outbox`].

#[cfg(test)]
mod tests;

use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelId, IdAllocator, Outbox};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Message, PubAck, Publish, QoS};

/// What the session knows about its broker link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    /// Waiting for the broker's CONNACK
    Connecting,
    Connected(ConnAck),
    Refused(ConnAck),
    /// The upstream channel has closed
    Gone,
}

/// A broker publish delivered to a member and not yet acknowledged
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub upstream_id: u16,
    pub owner: ChannelId,
    pub downstream_id: u16,
    publish: Publish,
    seq: u64,
}

/// A member request forwarded upstream, keyed by its upstream id
#[derive(Debug, Clone, Copy)]
struct Forwarded {
    owner: ChannelId,
    downstream_id: u16,
}

struct Member {
    channel: ChannelId,
    ids: IdAllocator,
    /// Downstream id -> upstream id of broker publishes awaiting PUBACK
    delivering: AHashMap<u16, u16>,
    /// Downstream id -> upstream id of requests awaiting the broker's ack
    forwarded: AHashMap<u16, u16>,
}

impl Member {
    fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            ids: IdAllocator::new(),
            delivering: AHashMap::new(),
            forwarded: AHashMap::new(),
        }
    }
}

pub struct Session {
    client_id: Arc<str>,
    founding: Connect,
    upstream: ChannelId,
    upstream_state: UpstreamState,
    members: Vec<Member>,
    /// Admitted before the upstream CONNACK was known
    waiting: Vec<ChannelId>,
    cursor: usize,
    upstream_ids: IdAllocator,
    forwarded: AHashMap<u16, Forwarded>,
    delivering: AHashMap<u16, PendingAck>,
    next_seq: u64,
    max_in_flight: usize,
    paused: bool,
    closing: bool,
}

impl Session {
    /// `founding` is the CONNECT that created the session. It is replayed
    /// upstream and every later member must match it.
    pub fn new(founding: Connect, upstream: ChannelId, max_in_flight: usize) -> Self {
        Self {
            client_id: Arc::from(founding.client_id.as_str()),
            founding,
            upstream,
            upstream_state: UpstreamState::Connecting,
            members: Vec::new(),
            waiting: Vec::new(),
            cursor: 0,
            upstream_ids: IdAllocator::new(),
            forwarded: AHashMap::new(),
            delivering: AHashMap::new(),
            next_seq: 0,
            max_in_flight: max_in_flight.max(1),
            paused: false,
            closing: false,
        }
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn upstream(&self) -> ChannelId {
        self.upstream
    }

    pub fn upstream_state(&self) -> UpstreamState {
        self.upstream_state
    }

    pub fn members(&self) -> Vec<ChannelId> {
        self.members.iter().map(|m| m.channel).collect()
    }

    pub fn is_member(&self, channel: ChannelId) -> bool {
        self.members.iter().any(|m| m.channel == channel)
    }

    /// Upstream-bound requests awaiting the broker's ack
    pub fn in_flight(&self) -> usize {
        self.forwarded.len()
    }

    /// Broker publishes awaiting a member's PUBACK
    pub fn pending_deliveries(&self) -> Vec<PendingAck> {
        let mut pending: Vec<_> = self.delivering.values().cloned().collect();
        pending.sort_by_key(|p| p.seq);
        pending
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Teardown has begun; no more members are admitted
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Nothing is left to serve
    pub fn is_finished(&self) -> bool {
        self.upstream_state == UpstreamState::Gone
            && self.members.is_empty()
            && self.waiting.is_empty()
    }

    /// Why `connect` may not join this session, if it may not
    fn admission_check(&self, connect: &Connect) -> Option<ConnectReturnCode> {
        let founding = &self.founding;
        if connect.clean_session {
            return Some(ConnectReturnCode::Other);
        }
        if connect.username != founding.username || connect.password != founding.password {
            return Some(ConnectReturnCode::BadCredentials);
        }
        if connect.protocol_name != founding.protocol_name
            || connect.protocol_version != founding.protocol_version
            || connect.will != founding.will
        {
            return Some(ConnectReturnCode::Other);
        }
        None
    }

    /// Try to add a downstream channel whose CONNECT just arrived
    ///
    /// Returns false when the channel was not admitted. A rejected channel
    /// has been sent a CONNACK; a channel turned away by a closing session
    /// has been sent nothing.
    pub fn attach(&mut self, ctx: &mut Outbox, channel: ChannelId, connect: &Connect) -> bool {
        if self.closing {
            debug!(
                "Session {} is closing, turning away channel {}",
                self.client_id, channel
            );
            return false;
        }
        if let Some(code) = self.admission_check(connect) {
            info!(
                "Rejecting channel {} from session {}: {}",
                channel, self.client_id, code
            );
            ctx.send(channel, ConnAck::new(code));
            return false;
        }

        match self.upstream_state {
            UpstreamState::Connecting => {
                debug!(
                    "Channel {} waiting for upstream of session {}",
                    channel, self.client_id
                );
                self.waiting.push(channel);
            }
            UpstreamState::Connected(ack) => self.add_member(ctx, channel, ack),
            // Both states set `closing`
            UpstreamState::Refused(_) | UpstreamState::Gone => return false,
        }
        true
    }

    fn add_member(&mut self, ctx: &mut Outbox, channel: ChannelId, ack: ConnAck) {
        self.members.push(Member::new(channel));
        ctx.send(channel, ack);
        if self.paused {
            ctx.pause_read(channel);
        }
        debug!(
            "Channel {} joined session {} ({} members)",
            channel,
            self.client_id,
            self.members.len()
        );
    }

    /// The upstream stream is established; replay the founding CONNECT
    pub fn upstream_opened(&mut self, ctx: &mut Outbox) {
        ctx.send(self.upstream, self.founding.clone());
    }

    pub fn upstream_connack(&mut self, ctx: &mut Outbox, ack: ConnAck) {
        if self.upstream_state != UpstreamState::Connecting {
            warn!("Unexpected CONNACK for session {}", self.client_id);
            return;
        }

        let waiting = std::mem::take(&mut self.waiting);
        if ack.is_accepted() {
            info!("Session {} connected upstream", self.client_id);
            self.upstream_state = UpstreamState::Connected(ack);
            for channel in waiting {
                self.add_member(ctx, channel, ack);
            }
        } else {
            info!(
                "Upstream refused session {}: {}",
                self.client_id, ack.return_code
            );
            self.upstream_state = UpstreamState::Refused(ack);
            self.closing = true;
            for channel in waiting {
                ctx.send(channel, ack);
            }
        }
    }

    /// A member sent PUBLISH, SUBSCRIBE or UNSUBSCRIBE
    pub fn forward_upstream(&mut self, ctx: &mut Outbox, channel: ChannelId, mut message: Message) {
        let Some(idx) = self.member_index(channel) else {
            debug!("Ignoring {:?} from non-member {}", message.message_type(), channel);
            return;
        };
        if message.qos() == QoS::ExactlyOnce {
            warn!("Dropping QoS 2 message from channel {}", channel);
            return;
        }

        let Some(downstream_id) = message.message_id() else {
            trace!("Forwarding QoS 0 publish from {} upstream", channel);
            ctx.send(self.upstream, message);
            return;
        };
        if self.members[idx].forwarded.contains_key(&downstream_id) {
            debug!(
                "Message {} from channel {} is already in flight upstream",
                downstream_id, channel
            );
            return;
        }

        let forwarded = &self.forwarded;
        let upstream_id = match self
            .upstream_ids
            .next_id(|id| forwarded.contains_key(&id))
        {
            Ok(id) => id,
            Err(e) => {
                warn!("Dropping message from channel {}: {}", channel, e);
                return;
            }
        };

        message.set_message_id(upstream_id);
        message.set_duplicate(false);
        self.forwarded.insert(
            upstream_id,
            Forwarded {
                owner: channel,
                downstream_id,
            },
        );
        self.members[idx]
            .forwarded
            .insert(downstream_id, upstream_id);
        trace!(
            "Forwarding message {} from channel {} upstream as {}",
            downstream_id,
            channel,
            upstream_id
        );
        ctx.send(self.upstream, message);
        self.apply_flow_control(ctx);
    }

    /// The broker acknowledged a forwarded request (PUBACK, SUBACK, UNSUBACK)
    pub fn upstream_ack(&mut self, ctx: &mut Outbox, mut message: Message) {
        let Some(upstream_id) = message.message_id() else {
            return;
        };
        let Some(forwarded) = self.forwarded.remove(&upstream_id) else {
            debug!(
                "Ack for unknown message {} on session {}",
                upstream_id, self.client_id
            );
            return;
        };

        match self
            .members
            .iter_mut()
            .find(|m| m.channel == forwarded.owner)
        {
            Some(member) => {
                member.forwarded.remove(&forwarded.downstream_id);
                message.set_message_id(forwarded.downstream_id);
                ctx.send(forwarded.owner, message);
            }
            None => trace!(
                "Dropping ack {} for departed channel {}",
                upstream_id,
                forwarded.owner
            ),
        }
        self.apply_flow_control(ctx);
    }

    /// The broker published to the shared client
    pub fn upstream_publish(&mut self, ctx: &mut Outbox, publish: Publish) {
        if publish.qos == QoS::ExactlyOnce {
            warn!("Dropping QoS 2 publish on session {}", self.client_id);
            return;
        }
        if self.members.is_empty() {
            debug!(
                "No member to take publish on session {}",
                self.client_id
            );
            return;
        }
        if publish.qos == QoS::AtMostOnce {
            let idx = self.next_member();
            ctx.send(self.members[idx].channel, publish);
            return;
        }

        // A broker resend goes back to whoever holds it
        if let Some(pending) = self.delivering.get(&publish.message_id) {
            let mut copy = pending.publish.clone();
            copy.dup = true;
            copy.message_id = pending.downstream_id;
            ctx.send(pending.owner, copy);
            return;
        }

        let idx = self.next_member();
        self.next_seq += 1;
        let seq = self.next_seq;
        self.deliver(ctx, idx, publish.message_id, publish, seq, false);
    }

    fn deliver(
        &mut self,
        ctx: &mut Outbox,
        idx: usize,
        upstream_id: u16,
        publish: Publish,
        seq: u64,
        dup: bool,
    ) {
        let Member {
            channel,
            ids,
            delivering,
            ..
        } = &mut self.members[idx];
        let downstream_id = match ids.next_id(|id| delivering.contains_key(&id)) {
            Ok(id) => id,
            Err(e) => {
                warn!("Cannot deliver to channel {}: {}", channel, e);
                self.delivering.remove(&upstream_id);
                return;
            }
        };
        delivering.insert(downstream_id, upstream_id);
        let owner = *channel;

        let mut copy = publish.clone();
        copy.dup = dup;
        copy.message_id = downstream_id;
        self.delivering.insert(
            upstream_id,
            PendingAck {
                upstream_id,
                owner,
                downstream_id,
                publish,
                seq,
            },
        );
        trace!(
            "Delivering upstream message {} to channel {} as {}",
            upstream_id,
            owner,
            downstream_id
        );
        ctx.send(owner, copy);
    }

    /// A member acknowledged a delivered publish
    pub fn downstream_puback(&mut self, ctx: &mut Outbox, channel: ChannelId, ack: PubAck) {
        let Some(member) = self.members.iter_mut().find(|m| m.channel == channel) else {
            return;
        };
        let Some(upstream_id) = member.delivering.remove(&ack.message_id) else {
            debug!(
                "PUBACK for unknown message {} from channel {}",
                ack.message_id, channel
            );
            return;
        };
        self.delivering.remove(&upstream_id);
        ctx.send(self.upstream, PubAck::new(upstream_id));
    }

    /// A member's channel closed
    pub fn detach(&mut self, ctx: &mut Outbox, channel: ChannelId) {
        if let Some(pos) = self.waiting.iter().position(|&c| c == channel) {
            self.waiting.remove(pos);
            if self.waiting.is_empty() && self.members.is_empty() && !self.closing {
                info!(
                    "Last waiting channel left session {}, closing upstream",
                    self.client_id
                );
                self.closing = true;
                ctx.close(self.upstream);
            }
            return;
        }

        let Some(idx) = self.member_index(channel) else {
            return;
        };
        let member = self.members.remove(idx);
        if idx < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
        debug!(
            "Channel {} left session {} ({} members)",
            channel,
            self.client_id,
            self.members.len()
        );

        if self.members.is_empty() {
            self.delivering.clear();
            if !self.closing {
                info!(
                    "Last member left session {}, disconnecting upstream",
                    self.client_id
                );
                self.closing = true;
                ctx.send(self.upstream, Message::Disconnect);
            }
            return;
        }

        let mut orphaned: Vec<PendingAck> = member
            .delivering
            .values()
            .filter_map(|id| self.delivering.get(id).cloned())
            .collect();
        orphaned.sort_by_key(|p| p.seq);
        for pending in orphaned {
            let idx = self.next_member();
            debug!(
                "Moving upstream message {} from channel {} to {}",
                pending.upstream_id, channel, self.members[idx].channel
            );
            self.deliver(
                ctx,
                idx,
                pending.upstream_id,
                pending.publish,
                pending.seq,
                true,
            );
        }
    }

    /// The upstream channel closed; every member goes with it
    pub fn upstream_closed(&mut self, ctx: &mut Outbox) {
        if self.upstream_state == UpstreamState::Gone {
            return;
        }
        info!("Upstream of session {} closed", self.client_id);
        self.upstream_state = UpstreamState::Gone;
        self.closing = true;
        self.paused = false;

        for channel in self.waiting.drain(..) {
            ctx.send(channel, ConnAck::new(ConnectReturnCode::ServerUnavailable));
        }
        for member in self.members.drain(..) {
            ctx.close(member.channel);
        }
        self.forwarded.clear();
        self.delivering.clear();
    }

    fn member_index(&self, channel: ChannelId) -> Option<usize> {
        self.members.iter().position(|m| m.channel == channel)
    }

    fn next_member(&mut self) -> usize {
        let idx = self.cursor % self.members.len();
        self.cursor = (idx + 1) % self.members.len();
        idx
    }

    fn apply_flow_control(&mut self, ctx: &mut Outbox) {
        let in_flight = self.forwarded.len();
        if !self.paused && in_flight >= self.max_in_flight {
            debug!(
                "Session {} reached {} in flight, pausing members",
                self.client_id, in_flight
            );
            self.paused = true;
            for member in &self.members {
                ctx.pause_read(member.channel);
            }
        } else if self.paused && in_flight < self.max_in_flight {
            debug!("Session {} resuming members", self.client_id);
            self.paused = false;
            for member in &self.members {
                ctx.resume_read(member.channel);
            }
        }
    }
}
