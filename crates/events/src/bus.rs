//! Publish/subscribe abstraction used to wake projectors (mechanics only).
//!
//! The bus is **not** a delivery channel for projection input. Projectors
//! always read from the event log by offset; a published message only tells a
//! waiting projector that its partition head moved. A lost or duplicated
//! message therefore costs at most one poll interval of latency, never an
//! event.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to a bus.
///
/// Each subscription receives its own copy of every message published after
/// it was created (broadcast semantics). Intended for a single consuming thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Discard everything already queued; returns how many messages were dropped.
    ///
    /// Workers call this before a catch-up read, since one read covers every
    /// head movement signalled so far.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

/// Domain-agnostic pub/sub bus.
///
/// ```text
/// Command -> Event Log (append) -> Bus (publish head movement) -> Projectors wake
///                                                                  and read the log
/// ```
///
/// ## Delivery
///
/// Best effort. `publish()` may fail after the append already committed; callers
/// log the failure and move on, since projectors fall back to polling.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
