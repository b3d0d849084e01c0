//! Event distribution boundary (mechanics only).
//!
//! The bus is the transport for committed events *after* they are persisted:
//! the event store stays the source of truth, the bus only distributes.
//! Delivery is at-least-once and consumers must be idempotent — the engine's
//! projections are idempotent by construction, so replays are harmless.
//!
//! The synchronous dispatch pipeline does not need a bus (listeners and
//! projections run inside the dispatch call); it exists for callers that
//! disable auto-publish/auto-project and consume events out-of-band.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use crate::message::Message;

/// A subscription to the stream of published messages.
///
/// Each subscription receives a copy of every message published after it was
/// created (broadcast semantics). Designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<Message>,
}

impl Subscription {
    pub fn new(receiver: Receiver<Message>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<Message, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<Message, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Message, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Publish/subscribe boundary for committed events.
///
/// Transport-agnostic: in-memory channels here, a broker adapter elsewhere.
/// `publish` failures surface to the caller; events are already persisted at
/// that point, so retrying publication is safe.
pub trait EventBus: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: Message) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: Message) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription {
        (**self).subscribe()
    }
}
