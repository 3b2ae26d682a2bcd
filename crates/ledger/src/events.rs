//! The public event contract emitted for every committed journal entry.
//!
//! Exactly one `JournalEntryPosted` message is written to the outbox per
//! committed entry, in the same transaction as the entry itself. Field names
//! here are consumed by the AML/risk worker and analytics sinks; renames are
//! breaking changes and require a new schema version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{AccountId, EntryId, TenantId};
use tally_events::Event;

use crate::account::Account;
use crate::entry::{Direction, JournalEntry};

/// Bus topic carrying posting events.
pub const TOPIC_JOURNAL_ENTRY_POSTED: &str = "ledger.journal_entry.posted";

/// One line of the posted entry as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedLine {
    pub account_id: AccountId,
    pub direction: Direction,
    pub amount_minor: i64,
    pub currency: String,
}

/// Post-commit balance of one affected account.
///
/// `account_version` is the store's monotonic per-account counter; the
/// balance-cache projector applies a snapshot only if this is greater than
/// the version it already holds, which makes duplicate and out-of-order
/// deliveries no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub account_id: AccountId,
    pub currency: String,
    pub balance_minor: i64,
    pub account_version: u64,
}

/// Event: a journal entry was validated, balanced and committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntryPosted {
    pub tenant_id: TenantId,
    pub entry_id: EntryId,
    pub narration: String,
    pub lines: Vec<PostedLine>,
    pub balances: Vec<BalanceSnapshot>,
    pub occurred_at: DateTime<Utc>,
}

impl JournalEntryPosted {
    /// Build the event from the committed entry and the accounts as mutated
    /// inside the same transaction.
    pub fn from_committed(entry: &JournalEntry, accounts: &[Account]) -> Self {
        let lines = entry
            .postings
            .iter()
            .map(|p| PostedLine {
                account_id: p.account_id,
                direction: p.direction,
                amount_minor: p.amount.minor(),
                currency: p.amount.currency().code().to_string(),
            })
            .collect();

        let balances = accounts
            .iter()
            .map(|a| BalanceSnapshot {
                account_id: a.id,
                currency: a.currency().code().to_string(),
                balance_minor: a.balance.minor(),
                account_version: a.version,
            })
            .collect();

        Self {
            tenant_id: entry.tenant_id,
            entry_id: entry.id,
            narration: entry.narration.clone(),
            lines,
            balances,
            occurred_at: entry.posted_at,
        }
    }
}

impl Event for JournalEntryPosted {
    fn event_type(&self) -> &'static str {
        TOPIC_JOURNAL_ENTRY_POSTED
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
