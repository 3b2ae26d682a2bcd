//! Infrastructure layer: storage backends, the posting engine, the
//! idempotency gate, the transactional-outbox dispatcher, the balance-cache
//! projection and the hedged reader.

pub mod idempotency;
pub mod outbox;
pub mod posting;
pub mod projections;
pub mod reader;
pub mod retry;
pub mod store;
pub mod transfer;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use idempotency::{IdempotencyGate, IdempotentOutcome, MAX_REQUEST_KEY_LEN};
pub use outbox::{DispatcherHandle, DispatcherStats, OutboxConfig, OutboxDispatcher};
pub use posting::{PostingConfig, PostingEngine};
pub use projections::{
    BalanceCacheProjection, BalanceCacheStore, CacheEntry, CacheKey, InMemoryBalanceCache,
    ProjectionError,
};
pub use reader::{BalanceSource, BalanceView, HedgedBalanceReader, ReadConfig};
pub use retry::Backoff;
pub use store::{
    IdempotencyInsert, IdempotencyRecord, IdempotencyStatus, InMemoryLedgerStore, LedgerStore,
    LedgerTx, OutboxMessage, OutboxStatus, PostgresLedgerStore, StoreError,
};
pub use transfer::{TransferReceipt, TransferService};
pub use workers::{ProjectionWorker, WorkerHandle};
