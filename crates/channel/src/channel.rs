//! Work channel publishing/subscription abstraction (mechanics only).
//!
//! The maintenance pass announces claimed chunks here; external workers subscribe
//! and execute them.
//!
//! ## Delivery
//!
//! - **Fire-and-forget**: `publish()` never waits for a worker to acknowledge
//! - **At-least-once**: a notification may be delivered more than once; workers must
//!   check the chunk's persisted status before executing it
//! - **No persistence**: the chunk row is the source of truth, the channel only
//!   distributes notifications

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to a work channel.
///
/// Each subscription gets a copy of every message published after it was created.
/// Intended for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic work channel.
///
/// `publish()` failures are surfaced to the caller. The maintenance pass lets them
/// propagate: the chunk has already been claimed, and there is no retry loop inside
/// the pass.
pub trait WorkChannel<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, C> WorkChannel<M> for Arc<C>
where
    C: WorkChannel<M> + ?Sized,
{
    type Error = C::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
