use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use super::ChannelError;
use crate::protocol::MAX_MESSAGE_ID;

/// Wrapping message id allocator over `1..=0xFFFF`
///
/// Never yields 0 and never yields an id the caller reports as in use.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u16,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocator whose next candidate is `id` (0 is treated as 1)
    pub fn starting_at(id: u16) -> Self {
        Self { next: id.max(1) }
    }

    pub fn next_id(&mut self, in_use: impl Fn(u16) -> bool) -> Result<u16, ChannelError> {
        for _ in 0..MAX_MESSAGE_ID {
            let id = self.next;
            self.next = if id == MAX_MESSAGE_ID { 1 } else { id + 1 };
            if !in_use(id) {
                return Ok(id);
            }
        }
        Err(ChannelError::IdsExhausted)
    }
}

/// Process-wide channel identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub(crate) usize);

impl ChannelId {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl From<usize> for ChannelId {
    fn from(id: usize) -> Self {
        ChannelId(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared source of channel ids
///
/// Ids are handed out on any thread so non-blocking callers learn the id of
/// a channel before the reactor registers it. Token 0 is kept for the
/// reactor's waker.
#[derive(Debug, Clone)]
pub struct ChannelIdSource {
    next: Arc<AtomicUsize>,
}

impl Default for ChannelIdSource {
    fn default() -> Self {
        Self {
            next: Arc::new(AtomicUsize::new(1)),
        }
    }
}

static PROCESS_IDS: OnceLock<ChannelIdSource> = OnceLock::new();

impl ChannelIdSource {
    /// The source every channel manager draws from, so a channel keeps its
    /// id when it moves between reactors
    pub fn process() -> Self {
        PROCESS_IDS.get_or_init(Self::default).clone()
    }

    pub fn next_id(&self) -> ChannelId {
        ChannelId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
