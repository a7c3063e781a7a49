use std::time::{Duration, Instant};

/// Which end of the protocol a channel speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Outbound connection to a broker. Sends CONNECT, pings when idle.
    Client,
    /// Accepted connection from a client. Answers pings, expires silent peers.
    Broker,
}

/// Outcome of a keep-alive check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepAliveCheck {
    /// Nothing to track
    Idle,
    /// Check again at this instant
    Until(Instant),
    /// Send PINGREQ now, then check again at this instant
    SendPing(Instant),
    /// The peer is gone
    Expired,
}

/// Role-specific keep-alive tracking
#[derive(Debug)]
pub(crate) struct KeepAlive {
    role: Role,
    interval: Option<Duration>,
    ping_sent_at: Option<Instant>,
    active: bool,
}

impl KeepAlive {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            interval: None,
            ping_sent_at: None,
            active: false,
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    /// Record the interval carried by CONNECT, in seconds. Zero disables.
    pub(crate) fn configure(&mut self, seconds: u16) {
        self.interval = match seconds {
            0 => None,
            s => Some(Duration::from_secs(u64::from(s))),
        };
    }

    pub(crate) fn connected(&mut self) {
        self.active = true;
    }

    pub(crate) fn disconnected(&mut self) {
        self.active = false;
        self.ping_sent_at = None;
    }

    pub(crate) fn ping_response(&mut self) {
        self.ping_sent_at = None;
    }

    pub(crate) fn is_ping_pending(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    pub(crate) fn check(
        &mut self,
        now: Instant,
        last_sent: Instant,
        last_received: Instant,
    ) -> KeepAliveCheck {
        let interval = match self.interval {
            Some(interval) if self.active => interval,
            _ => return KeepAliveCheck::Idle,
        };

        match self.role {
            Role::Client => {
                if let Some(sent) = self.ping_sent_at {
                    let deadline = sent + interval;
                    return if now >= deadline {
                        KeepAliveCheck::Expired
                    } else {
                        KeepAliveCheck::Until(deadline)
                    };
                }
                let due = last_sent.max(last_received) + interval;
                if now >= due {
                    self.ping_sent_at = Some(now);
                    KeepAliveCheck::SendPing(now + interval)
                } else {
                    KeepAliveCheck::Until(due)
                }
            }
            Role::Broker => {
                // Peers get half an interval of grace
                let deadline = last_received + interval + interval / 2;
                if now >= deadline {
                    KeepAliveCheck::Expired
                } else {
                    KeepAliveCheck::Until(deadline)
                }
            }
        }
    }
}
