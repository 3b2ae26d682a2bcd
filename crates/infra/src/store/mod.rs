pub mod in_memory;
pub mod postgres;
mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use r#trait::{
    IdempotencyInsert, IdempotencyRecord, IdempotencyStatus, LedgerStore, LedgerTx, OutboxMessage,
    OutboxStatus, StoreError,
};
