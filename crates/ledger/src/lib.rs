//! `tally-ledger` — the double-entry ledger domain model.
//!
//! Pure value/entity types and their invariants: money movement is expressed
//! as balanced journal entries over typed accounts. Persistence, retries and
//! event delivery live in `tally-infra`.

pub mod account;
pub mod entry;
pub mod events;

pub use account::{Account, AccountType, balance_delta};
pub use entry::{Direction, EntryDraft, EntryLine, JournalEntry, MAX_NARRATION_LEN, Posting};
pub use events::{BalanceSnapshot, JournalEntryPosted, PostedLine, TOPIC_JOURNAL_ENTRY_POSTED};
