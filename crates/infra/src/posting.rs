//! The journal-posting engine.
//!
//! One posting is one serializable transaction: load every referenced
//! account in a single batch, apply the polarity deltas, write the entry,
//! the updated balances and the outbox message, then commit. Serialization
//! conflicts are retried with exponential backoff up to a bounded budget;
//! deterministic domain failures are never retried.

use std::time::Duration;

use tracing::{debug, warn};

use tally_core::{LedgerError, LedgerResult};
use tally_events::Event;
use tally_ledger::{EntryDraft, JournalEntry, JournalEntryPosted};

use crate::store::{LedgerStore, LedgerTx, OutboxMessage, StoreError};
use crate::retry::Backoff;

/// Retry budget and backoff for serialization conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::new(Duration::from_millis(25), Duration::from_secs(1)),
        }
    }
}

impl PostingConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Backoff::new(base, max);
        self
    }
}

pub(crate) fn map_store_error(err: StoreError) -> LedgerError {
    match err {
        StoreError::Conflict(msg) => LedgerError::conflict(msg),
        other => LedgerError::storage(other.to_string()),
    }
}

/// Run the whole posting inside an already-open transaction: batch-load the
/// accounts, apply every line, stage the entry, the balances and the outbox
/// message. The caller owns commit.
///
/// This is shared between the bare engine and the idempotency gate so the
/// idempotency record can ride the same transaction.
pub(crate) fn execute_in_tx<T: LedgerTx>(
    tx: &mut T,
    draft: &EntryDraft,
) -> LedgerResult<JournalEntry> {
    draft.validate()?;

    let ids = draft.account_ids();
    let accounts = tx.fetch_accounts(&ids).map_err(map_store_error)?;
    if accounts.len() != ids.len() {
        // Report the first missing id; the others will surface on resubmit.
        let missing = ids
            .iter()
            .find(|id| !accounts.iter().any(|a| a.id == **id))
            .copied();
        if let Some(id) = missing {
            return Err(LedgerError::AccountNotFound(id));
        }
    }

    let mut by_id: std::collections::HashMap<_, _> =
        accounts.into_iter().map(|a| (a.id, a)).collect();

    for posting in draft.postings() {
        let account = by_id
            .get_mut(&posting.account_id)
            .ok_or(LedgerError::AccountNotFound(posting.account_id))?;
        account.apply(posting.direction, posting.amount)?;
    }

    let entry = JournalEntry {
        id: tally_core::EntryId::new(),
        tenant_id: draft.tenant_id,
        narration: draft.narration.clone(),
        postings: draft.postings(),
        posted_at: chrono::Utc::now(),
        posted: true,
    };

    // Stable order for the event's balance snapshots.
    let mutated: Vec<_> = ids
        .iter()
        .filter_map(|id| by_id.get(id).cloned())
        .collect();

    tx.upsert_accounts(&mutated).map_err(map_store_error)?;
    tx.insert_entry(&entry).map_err(map_store_error)?;

    let event = JournalEntryPosted::from_committed(&entry, &mutated);
    let payload = serde_json::to_value(&event)
        .map_err(|e| LedgerError::storage(format!("event serialization failed: {e}")))?;

    let mut headers = std::collections::HashMap::new();
    headers.insert("event_type".to_string(), event.event_type().to_string());
    headers.insert("schema_version".to_string(), event.version().to_string());

    // Partitioned per tenant: consumers see one tenant's postings in order.
    let message = OutboxMessage::new(
        draft.tenant_id,
        event.event_type(),
        draft.tenant_id.to_string(),
        headers,
        payload,
    );
    tx.insert_outbox(&message).map_err(map_store_error)?;

    Ok(entry)
}

/// Posts balanced journal entries against a `LedgerStore`.
#[derive(Debug)]
pub struct PostingEngine<S> {
    store: S,
    config: PostingConfig,
}

impl<S: LedgerStore> PostingEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, PostingConfig::default())
    }

    pub fn with_config(store: S, config: PostingConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate and atomically commit one journal entry, retrying bounded
    /// times on serialization conflicts. On success exactly one entry and
    /// one outbox message exist; on any error nothing was committed.
    pub fn post(&self, draft: &EntryDraft) -> LedgerResult<JournalEntry> {
        // Reject malformed input before touching storage or the retry loop.
        draft.validate()?;

        let mut attempt = 1u32;
        loop {
            match self.try_post(draft) {
                Err(LedgerError::ConcurrencyConflict(reason))
                    if attempt < self.config.max_attempts =>
                {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    debug!(
                        tenant_id = %draft.tenant_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "posting hit serialization conflict, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(LedgerError::ConcurrencyConflict(reason)) => {
                    warn!(
                        tenant_id = %draft.tenant_id,
                        attempts = attempt,
                        %reason,
                        "posting exhausted its retry budget"
                    );
                    return Err(LedgerError::conflict(format!(
                        "posting failed after {attempt} attempts: {reason}"
                    )));
                }
                other => return other,
            }
        }
    }

    fn try_post(&self, draft: &EntryDraft) -> LedgerResult<JournalEntry> {
        let mut tx = self
            .store
            .begin(draft.tenant_id)
            .map_err(map_store_error)?;
        let entry = execute_in_tx(&mut tx, draft)?;
        tx.commit().map_err(map_store_error)?;

        debug!(
            tenant_id = %draft.tenant_id,
            entry_id = %entry.id,
            lines = entry.postings.len(),
            "journal entry posted"
        );
        Ok(entry)
    }
}
