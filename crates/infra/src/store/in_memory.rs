//! In-memory `LedgerStore` used by tests and local development.
//!
//! Transactions buffer their writes and validate their read set under one
//! global lock at commit, which gives the same observable behavior as a
//! serializable database: a transaction whose accounts changed underneath it
//! fails with `Conflict` and has no effect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;

use tally_core::{AccountId, EntryId, MessageId, TenantId};
use tally_ledger::{Account, JournalEntry};

use super::r#trait::{
    IdempotencyInsert, IdempotencyRecord, IdempotencyStatus, LedgerStore, LedgerTx, OutboxMessage,
    OutboxStatus, StoreError,
};

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<(TenantId, AccountId), Account>,
    entries: HashMap<(TenantId, EntryId), JournalEntry>,
    outbox: HashMap<MessageId, OutboxMessage>,
    idempotency: HashMap<(TenantId, String), IdempotencyRecord>,
}

/// Shared in-memory backend. Cheap to clone via `Arc`.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<State>>,
    injected_conflicts: Mutex<u32>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: make the next `count` commits fail with `Conflict`, as a
    /// serializable backend would under contention.
    pub fn fail_next_commits(&self, count: u32) {
        if let Ok(mut injected) = self.injected_conflicts.lock() {
            *injected += count;
        }
    }

    fn take_injected_conflict(&self) -> bool {
        match self.injected_conflicts.lock() {
            Ok(mut injected) if *injected > 0 => {
                *injected -= 1;
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::storage("ledger store lock poisoned"))
    }
}

fn lock_shared(state: &Arc<Mutex<State>>) -> Result<MutexGuard<'_, State>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::storage("ledger store lock poisoned"))
}

/// One open transaction: buffered writes plus the versions observed by reads.
pub struct InMemoryTx {
    state: Arc<Mutex<State>>,
    tenant_id: TenantId,
    conflict_injected: bool,
    /// Account versions seen by `fetch_accounts` (`None` = observed absent).
    read_accounts: HashMap<AccountId, Option<u64>>,
    staged_accounts: Vec<Account>,
    staged_entries: Vec<JournalEntry>,
    staged_outbox: Vec<OutboxMessage>,
    /// Keys claimed by `insert_idempotency`, in claim order, with their
    /// current staged record.
    staged_idempotency: HashMap<String, IdempotencyRecord>,
}

impl InMemoryTx {
    fn guard_tenant(&self, tenant_id: TenantId, what: &str) -> Result<(), StoreError> {
        if tenant_id != self.tenant_id {
            return Err(StoreError::TenantIsolation(format!(
                "{what} belongs to tenant {tenant_id}, transaction is scoped to {}",
                self.tenant_id
            )));
        }
        Ok(())
    }
}

impl LedgerTx for InMemoryTx {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn fetch_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        let state = lock_shared(&self.state)?;
        let mut found = Vec::with_capacity(ids.len());
        for &id in ids {
            match state.accounts.get(&(self.tenant_id, id)) {
                Some(account) => {
                    self.read_accounts.insert(id, Some(account.version));
                    found.push(account.clone());
                }
                None => {
                    self.read_accounts.insert(id, None);
                }
            }
        }
        Ok(found)
    }

    fn upsert_accounts(&mut self, accounts: &[Account]) -> Result<(), StoreError> {
        for account in accounts {
            self.guard_tenant(account.tenant_id, "account")?;
        }
        self.staged_accounts.extend_from_slice(accounts);
        Ok(())
    }

    fn insert_entry(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        self.guard_tenant(entry.tenant_id, "journal entry")?;
        self.staged_entries.push(entry.clone());
        Ok(())
    }

    fn insert_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        self.guard_tenant(message.tenant_id, "outbox message")?;
        self.staged_outbox.push(message.clone());
        Ok(())
    }

    fn insert_idempotency(&mut self, request_key: &str) -> Result<IdempotencyInsert, StoreError> {
        let state = lock_shared(&self.state)?;
        if let Some(existing) = state
            .idempotency
            .get(&(self.tenant_id, request_key.to_string()))
        {
            return Ok(IdempotencyInsert::Duplicate(existing.clone()));
        }
        drop(state);

        let now = Utc::now();
        let record = IdempotencyRecord {
            tenant_id: self.tenant_id,
            request_key: request_key.to_string(),
            status: IdempotencyStatus::Pending,
            result: None,
            created_at: now,
            updated_at: now,
        };
        self.staged_idempotency.insert(request_key.to_string(), record);
        Ok(IdempotencyInsert::Inserted)
    }

    fn update_idempotency(
        &mut self,
        request_key: &str,
        status: IdempotencyStatus,
        result: JsonValue,
    ) -> Result<(), StoreError> {
        match self.staged_idempotency.get_mut(request_key) {
            Some(record) => {
                record.status = status;
                record.result = Some(result);
                record.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "idempotency key {request_key} is not owned by this transaction"
            ))),
        }
    }

    fn commit(self) -> Result<(), StoreError> {
        let mut state = lock_shared(&self.state)?;

        if self.conflict_injected {
            return Err(StoreError::conflict("injected serialization conflict"));
        }

        // First-committer-wins: every account this transaction read must
        // still be at the version it observed.
        for (&account_id, &observed) in &self.read_accounts {
            let current = state
                .accounts
                .get(&(self.tenant_id, account_id))
                .map(|a| a.version);
            if current != observed {
                return Err(StoreError::Conflict(format!(
                    "account {account_id} changed since it was read (observed {observed:?}, now {current:?})"
                )));
            }
        }

        for key in self.staged_idempotency.keys() {
            if state
                .idempotency
                .contains_key(&(self.tenant_id, key.clone()))
            {
                return Err(StoreError::UniqueViolation(format!(
                    "idempotency key {key} already exists for tenant {}",
                    self.tenant_id
                )));
            }
        }

        for entry in &self.staged_entries {
            if state.entries.contains_key(&(self.tenant_id, entry.id)) {
                return Err(StoreError::UniqueViolation(format!(
                    "journal entry {} already exists",
                    entry.id
                )));
            }
        }

        for account in self.staged_accounts {
            state
                .accounts
                .insert((account.tenant_id, account.id), account);
        }
        for entry in self.staged_entries {
            state.entries.insert((entry.tenant_id, entry.id), entry);
        }
        for message in self.staged_outbox {
            state.outbox.insert(message.id, message);
        }
        for (key, record) in self.staged_idempotency {
            state.idempotency.insert((self.tenant_id, key), record);
        }

        Ok(())
    }
}

impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryTx;

    fn begin(&self, tenant_id: TenantId) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTx {
            state: Arc::clone(&self.state),
            tenant_id,
            conflict_injected: self.take_injected_conflict(),
            read_accounts: HashMap::new(),
            staged_accounts: Vec::new(),
            staged_entries: Vec::new(),
            staged_outbox: Vec::new(),
            staged_idempotency: HashMap::new(),
        })
    }

    fn create_account(&self, account: Account) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let key = (account.tenant_id, account.id);
        if state.accounts.contains_key(&key) {
            return Err(StoreError::UniqueViolation(format!(
                "account {} already exists for tenant {}",
                account.id, account.tenant_id
            )));
        }
        state.accounts.insert(key, account);
        Ok(())
    }

    fn get_account(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> Result<Option<Account>, StoreError> {
        let state = self.lock()?;
        Ok(state.accounts.get(&(tenant_id, account_id)).cloned())
    }

    fn get_entry(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<Option<JournalEntry>, StoreError> {
        let state = self.lock()?;
        Ok(state.entries.get(&(tenant_id, entry_id)).cloned())
    }

    fn get_idempotency(
        &self,
        tenant_id: TenantId,
        request_key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .idempotency
            .get(&(tenant_id, request_key.to_string()))
            .cloned())
    }

    fn claim_ready_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut state = self.lock()?;

        let mut ready: Vec<MessageId> = state
            .outbox
            .values()
            .filter(|m| m.is_ready(now))
            .map(|m| m.id)
            .collect();
        // Oldest first; map iteration order is arbitrary.
        ready.sort_by_key(|id| state.outbox[id].created_at);
        ready.truncate(limit);

        let mut claimed = Vec::with_capacity(ready.len());
        for id in ready {
            if let Some(message) = state.outbox.get_mut(&id) {
                message.next_attempt_at = Some(now + lease);
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    fn mark_outbox_published(
        &self,
        id: MessageId,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let message = state
            .outbox
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {id}")))?;
        message.status = OutboxStatus::Published;
        message.published_at = Some(published_at);
        message.next_attempt_at = None;
        message.last_error = None;
        Ok(())
    }

    fn mark_outbox_retry(
        &self,
        id: MessageId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let message = state
            .outbox
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {id}")))?;
        message.retry_count += 1;
        message.last_error = Some(error.to_string());
        message.next_attempt_at = Some(next_attempt_at);
        Ok(())
    }

    fn mark_outbox_failed(&self, id: MessageId, error: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let message = state
            .outbox
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {id}")))?;
        message.status = OutboxStatus::Failed;
        message.retry_count += 1;
        message.last_error = Some(error.to_string());
        message.next_attempt_at = None;
        Ok(())
    }

    fn prune_published_outbox(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let before = state.outbox.len();
        state.outbox.retain(|_, m| {
            !(m.status == OutboxStatus::Published
                && m.published_at.is_some_and(|at| at < older_than))
        });
        Ok(before - state.outbox.len())
    }

    fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        let state = self.lock()?;
        Ok(state.outbox.get(&id).cloned())
    }
}
