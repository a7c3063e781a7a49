//! Cross-thread command completion
//!
//! Every command submitted to a reactor may carry a [`Completion`]; the
//! submitting thread holds the matching [`CommandFuture`]. The completion is
//! signalled exactly once: with the command result, with a cancellation,
//! or with [`CommandError::ShutDown`] if the reactor drops it unexecuted.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::{ChannelError, ChannelId};

/// Errors observed by a thread waiting on a command
#[derive(Debug, Clone)]
pub enum CommandError {
    /// Cancelled before the reactor executed it
    Cancelled,
    /// The wait expired; the command may still run
    Timeout,
    /// The command body panicked on the reactor thread
    Panicked(String),
    /// The channel the command targeted failed or closed
    Channel(ChannelError),
    /// The target channel is not registered with this reactor
    UnknownChannel(ChannelId),
    /// The channel's handler is bound to its reactor's thread
    NotTransferable(ChannelId),
    /// The reactor exited before completing the command
    ShutDown,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Cancelled => write!(f, "command cancelled"),
            CommandError::Timeout => write!(f, "timed out waiting for command"),
            CommandError::Panicked(msg) => write!(f, "command panicked: {}", msg),
            CommandError::Channel(e) => write!(f, "channel error: {}", e),
            CommandError::UnknownChannel(id) => write!(f, "unknown channel {}", id),
            CommandError::NotTransferable(id) => {
                write!(f, "channel {} cannot move to another reactor", id)
            }
            CommandError::ShutDown => write!(f, "channel manager shut down"),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<ChannelError> for CommandError {
    fn from(e: ChannelError) -> Self {
        CommandError::Channel(e)
    }
}

enum Slot<T> {
    Pending,
    Running,
    Done(Result<T, CommandError>),
    Cancelled,
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    signal: Condvar,
}

/// Reactor side of a command
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

/// Caller side of a command
pub struct CommandFuture<T> {
    shared: Arc<Shared<T>>,
}

/// Create a linked completion / future pair
pub fn pair<T>() -> (Completion<T>, CommandFuture<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending),
        signal: Condvar::new(),
    });
    (
        Completion {
            shared: shared.clone(),
        },
        CommandFuture { shared },
    )
}

impl<T> Completion<T> {
    /// Mark the command as executing. Returns false if it was cancelled,
    /// in which case the body must not run.
    pub fn start(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        match *slot {
            Slot::Pending => {
                *slot = Slot::Running;
                true
            }
            Slot::Running => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Cancelled)
    }

    /// Deliver the result and wake the waiter
    pub fn complete(self, result: Result<T, CommandError>) {
        self.fulfil(result);
    }

    fn fulfil(&self, result: Result<T, CommandError>) {
        let mut slot = self.shared.slot.lock();
        if matches!(*slot, Slot::Pending | Slot::Running) {
            *slot = Slot::Done(result);
            self.shared.signal.notify_all();
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.fulfil(Err(CommandError::ShutDown));
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl<T> CommandFuture<T> {
    /// Cancel the command if the reactor has not started it yet
    pub fn cancel(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Cancelled;
            self.shared.signal.notify_all();
            true
        } else {
            false
        }
    }

    /// True once a result (or cancellation) is available
    pub fn is_done(&self) -> bool {
        matches!(
            *self.shared.slot.lock(),
            Slot::Done(_) | Slot::Cancelled | Slot::Taken
        )
    }

    /// Block until the command completes
    pub fn wait(self) -> Result<T, CommandError> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = take(&mut slot) {
                return result;
            }
            self.shared.signal.wait(&mut slot);
        }
    }

    /// Block until the command completes or `timeout` elapses
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, CommandError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = take(&mut slot) {
                return result;
            }
            if self.shared.signal.wait_until(&mut slot, deadline).timed_out() {
                return take(&mut slot).unwrap_or(Err(CommandError::Timeout));
            }
        }
    }
}

fn take<T>(slot: &mut Slot<T>) -> Option<Result<T, CommandError>> {
    match std::mem::replace(slot, Slot::Taken) {
        Slot::Done(result) => Some(result),
        Slot::Cancelled => {
            *slot = Slot::Cancelled;
            Some(Err(CommandError::Cancelled))
        }
        other => {
            *slot = other;
            None
        }
    }
}

/// Render a caught panic payload
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_wakes_waiter() {
        let (completion, future) = pair::<u32>();
        let handle = thread::spawn(move || future.wait());
        assert!(completion.start());
        completion.complete(Ok(7));
        assert_eq!(handle.join().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_cancel_before_start() {
        let (completion, future) = pair::<u32>();
        assert!(future.cancel());
        assert!(!completion.start());
        assert!(completion.is_cancelled());
        completion.complete(Ok(1));
        assert!(matches!(future.wait(), Err(CommandError::Cancelled)));
    }

    #[test]
    fn test_cancel_after_start_is_ignored() {
        let (completion, future) = pair::<u32>();
        assert!(completion.start());
        assert!(!future.cancel());
        completion.complete(Ok(3));
        assert_eq!(future.wait().unwrap(), 3);
    }

    #[test]
    fn test_wait_timeout() {
        let (_completion, future) = pair::<u32>();
        assert!(matches!(
            future.wait_timeout(Duration::from_millis(20)),
            Err(CommandError::Timeout)
        ));
    }

    #[test]
    fn test_dropped_completion_reports_shutdown() {
        let (completion, future) = pair::<u32>();
        drop(completion);
        assert!(future.is_done());
        assert!(matches!(future.wait(), Err(CommandError::ShutDown)));
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload), "boom");
    }
}
