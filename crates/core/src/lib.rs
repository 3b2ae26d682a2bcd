//! `tally-core` — ledger domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod money;

pub use error::{LedgerError, LedgerResult};
pub use id::{AccountId, EntryId, MessageId, TenantId};
pub use money::{Currency, Money};
