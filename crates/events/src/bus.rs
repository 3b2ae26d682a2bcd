//! Message-bus abstraction (mechanics only).
//!
//! The bus sits downstream of the transactional outbox:
//!
//! ```text
//! Posting tx (ledger + outbox row) → OutboxDispatcher → MessageBus → Consumers
//!                                                                      ├─ balance cache projector
//!                                                                      └─ AML/risk worker (external)
//! ```
//!
//! Delivery is **at-least-once**: records may arrive more than once (retries,
//! consumer-group rebalances), and ordering is only guaranteed per partition.
//! Consumers must therefore be idempotent; the balance-cache projector uses a
//! version guard for exactly this reason.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A record as seen by a consumer: the published message plus the offset the
/// bus assigned to it.
///
/// Offsets are monotonically increasing within a partition and are what
/// consumers use for replay detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered<M> {
    pub offset: u64,
    pub message: M,
}

/// A subscription to a message stream.
///
/// Each subscription gets a copy of every record published to the bus
/// (broadcast semantics). Subscriptions are designed for single-threaded
/// consumption; use one per worker loop.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<Delivered<M>>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<Delivered<M>>) -> Self {
        Self { receiver }
    }

    /// Block until the next record is available.
    pub fn recv(&self) -> Result<Delivered<M>, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a record without blocking.
    pub fn try_recv(&self) -> Result<Delivered<M>, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a record.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Delivered<M>, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Publish/subscribe message bus.
///
/// `publish` is **publish-with-ack**: a successful return means the bus has
/// accepted the record, and the returned value is the offset it was assigned.
/// Failures are surfaced to the caller (the outbox dispatcher), which retries
/// with backoff; records are already persisted in the outbox, so retrying is
/// safe and only risks duplicate delivery, which consumers must tolerate.
pub trait MessageBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// Publish one record; returns the assigned offset on ack.
    fn publish(&self, message: M) -> Result<u64, Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> MessageBus<M> for Arc<B>
where
    B: MessageBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<u64, Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
