//! In-memory message bus for tests/dev.

use std::sync::{Mutex, mpsc};

use crate::bus::{Delivered, MessageBus, Subscription};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
    /// Publish rejected by an injected fault (test aid).
    Injected(String),
}

/// In-memory pub/sub bus modelling a single-partition topic.
///
/// - No IO / no async
/// - Offsets are assigned at publish time, monotonically from 1
/// - Best-effort fan-out; at-least-once acceptable (subscribers must be
///   idempotent)
///
/// `fail_next_publishes` lets tests exercise the dispatcher's retry and
/// dead-letter paths without a real broker.
#[derive(Debug)]
pub struct InMemoryMessageBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<Delivered<M>>>>,
    next_offset: Mutex<u64>,
    injected_failures: Mutex<u32>,
}

impl<M> InMemoryMessageBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publish calls fail (test aid).
    pub fn fail_next_publishes(&self, n: u32) {
        if let Ok(mut failures) = self.injected_failures.lock() {
            *failures = n;
        }
    }
}

impl<M> Default for InMemoryMessageBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_offset: Mutex::new(0),
            injected_failures: Mutex::new(0),
        }
    }
}

impl<M> MessageBus<M> for InMemoryMessageBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<u64, Self::Error> {
        {
            let mut failures = self
                .injected_failures
                .lock()
                .map_err(|_| InMemoryBusError::Poisoned)?;
            if *failures > 0 {
                *failures -= 1;
                return Err(InMemoryBusError::Injected("injected publish failure".to_string()));
            }
        }

        let offset = {
            let mut next = self.next_offset.lock().map_err(|_| InMemoryBusError::Poisoned)?;
            *next += 1;
            *next
        };

        let delivered = Delivered { offset, message };

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(delivered.clone()).is_ok());

        Ok(offset)
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_monotonic_from_one() {
        let bus: InMemoryMessageBus<&'static str> = InMemoryMessageBus::new();
        assert_eq!(bus.publish("a").unwrap(), 1);
        assert_eq!(bus.publish("b").unwrap(), 2);
        assert_eq!(bus.publish("c").unwrap(), 3);
    }

    #[test]
    fn subscribers_receive_records_with_offsets() {
        let bus: InMemoryMessageBus<&'static str> = InMemoryMessageBus::new();
        let sub = bus.subscribe();

        bus.publish("hello").unwrap();

        let got = sub.try_recv().unwrap();
        assert_eq!(got.offset, 1);
        assert_eq!(got.message, "hello");
    }

    #[test]
    fn injected_failures_consume_then_clear() {
        let bus: InMemoryMessageBus<&'static str> = InMemoryMessageBus::new();
        bus.fail_next_publishes(1);

        assert!(bus.publish("a").is_err());
        assert!(bus.publish("b").is_ok());
    }
}
