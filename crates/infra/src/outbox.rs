//! Outbox dispatcher: drains pending outbox rows onto the message bus.
//!
//! Publishing is at-least-once. A message is marked published only after the
//! bus acks it, so a crash between publish and mark re-delivers on the next
//! poll; consumers must tolerate duplicates. Failed publishes retry with
//! exponential backoff and are dead-lettered (status `Failed`, loud log)
//! once the attempt budget is spent.

use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use tally_events::{BusRecord, MessageBus};

use crate::retry::Backoff;
use crate::store::{LedgerStore, OutboxMessage, StoreError};

/// Polling cadence, batch size and retry budget of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Total publish attempts per message before dead-lettering.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// How long a claimed message stays invisible to other dispatchers.
    pub claim_lease: chrono::Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 32,
            max_attempts: 8,
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(30)),
            claim_lease: chrono::Duration::seconds(30),
        }
    }
}

impl OutboxConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Backoff::new(base, max);
        self
    }
}

/// Cumulative dispatcher counters, readable while the loop runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// Moves committed outbox messages onto the bus.
pub struct OutboxDispatcher<S, B> {
    store: S,
    bus: B,
    config: OutboxConfig,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S, B> OutboxDispatcher<S, B>
where
    S: LedgerStore,
    B: MessageBus<BusRecord<JsonValue>>,
{
    pub fn new(store: S, bus: B) -> Self {
        Self::with_config(store, bus, OutboxConfig::default())
    }

    pub fn with_config(store: S, bus: B, config: OutboxConfig) -> Self {
        Self {
            store,
            bus,
            config,
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Drain one batch: claim ready messages (oldest first) and publish each.
    /// Returns how many messages were processed, so callers can poll eagerly
    /// while the outbox has depth.
    pub fn run_once(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let batch =
            self.store
                .claim_ready_outbox(self.config.batch_size, now, self.config.claim_lease)?;
        let count = batch.len();
        for message in batch {
            self.dispatch(message)?;
        }
        Ok(count)
    }

    fn dispatch(&self, message: OutboxMessage) -> Result<(), StoreError> {
        let record = BusRecord::new(
            *message.id.as_uuid(),
            message.tenant_id,
            message.topic.clone(),
            message.partition_key.clone(),
            message.headers.clone(),
            message.payload.clone(),
        );

        match self.bus.publish(record) {
            Ok(offset) => {
                self.store.mark_outbox_published(message.id, Utc::now())?;
                self.bump(|s| s.published += 1);
                debug!(
                    message_id = %message.id,
                    tenant_id = %message.tenant_id,
                    topic = %message.topic,
                    offset,
                    "outbox message published"
                );
            }
            Err(publish_err) => {
                let attempts = message.retry_count + 1;
                let reason = format!("{publish_err:?}");
                if attempts >= self.config.max_attempts {
                    self.store.mark_outbox_failed(message.id, &reason)?;
                    self.bump(|s| s.dead_lettered += 1);
                    // Dead letters need an operator; make them impossible to miss.
                    error!(
                        message_id = %message.id,
                        tenant_id = %message.tenant_id,
                        topic = %message.topic,
                        attempts,
                        %reason,
                        "outbox message dead-lettered"
                    );
                } else {
                    let delay = self.config.backoff.delay_for_attempt(attempts);
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    self.store
                        .mark_outbox_retry(message.id, &reason, next_attempt_at)?;
                    self.bump(|s| s.retried += 1);
                    warn!(
                        message_id = %message.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "outbox publish failed, scheduling retry"
                    );
                }
            }
        }
        Ok(())
    }

    fn bump(&self, f: impl FnOnce(&mut DispatcherStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Run the dispatcher on a dedicated thread until the handle stops it.
    pub fn spawn(self, name: &str) -> DispatcherHandle
    where
        S: 'static,
        B: 'static,
    {
        let (shutdown_tx, shutdown_rx) = channel::<()>();
        let stats = Arc::clone(&self.stats);
        let thread_name = name.to_string();

        let join = std::thread::spawn(move || {
            info!(worker = %thread_name, "outbox dispatcher started");
            loop {
                match shutdown_rx.recv_timeout(self.config.poll_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        // Keep draining without sleeping while batches are full.
                        loop {
                            match self.run_once() {
                                Ok(n) if n >= self.config.batch_size => continue,
                                Ok(_) => break,
                                Err(e) => {
                                    warn!(worker = %thread_name, error = %e, "outbox poll failed");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            info!(worker = %thread_name, "outbox dispatcher stopped");
        });

        DispatcherHandle {
            shutdown_tx,
            join,
            stats,
        }
    }
}

/// Handle to a running dispatcher thread.
pub struct DispatcherHandle {
    shutdown_tx: Sender<()>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Signal shutdown and wait for the loop to exit.
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.join();
    }
}
