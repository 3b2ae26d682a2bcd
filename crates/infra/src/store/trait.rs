//! Storage contract for the ledger.
//!
//! A `LedgerStore` hands out serializable transactions (`LedgerTx`) that
//! cover everything a posting must commit atomically: account balances, the
//! journal entry, the outbox message and the idempotency record. It also
//! exposes the non-transactional surfaces used by the outbox dispatcher and
//! the hedged balance reader.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tally_core::{AccountId, EntryId, MessageId, TenantId};
use tally_ledger::{Account, JournalEntry};

/// Storage-level failure, distinct from the domain error taxonomy.
///
/// `Conflict` is the serialization-failure signal the posting engine retries
/// on; everything else is surfaced to the caller unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Serializable-isolation conflict; the transaction had no effect and the
    /// whole operation may be retried.
    #[error("serialization conflict: {0}")]
    Conflict(String),

    /// A unique constraint rejected an insert (duplicate entry id, duplicate
    /// idempotency key, duplicate account).
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A row belonging to another tenant was touched. Always a bug upstream.
    #[error("tenant isolation violated: {0}")]
    TenantIsolation(String),

    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend failure (connection, pool, poisoned lock).
    #[error("storage failure: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Lifecycle of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    /// Inserted at the start of the guarded operation; a surviving `Pending`
    /// record means the owning request is still in flight (or crashed after
    /// commit of the record but before the outcome was written, which the
    /// single-transaction design prevents for successes).
    Pending,
    Completed,
    Failed,
}

/// One idempotency record, unique per `(tenant_id, request_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub tenant_id: TenantId,
    pub request_key: String,
    pub status: IdempotencyStatus,
    /// Serialized outcome: the operation result for `Completed`, the
    /// serialized domain error for `Failed`, absent while `Pending`.
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of attempting to insert an idempotency record.
///
/// The unique constraint is the arbiter under concurrency: exactly one
/// inserter wins, every loser observes the winner's record instead of an
/// opaque constraint error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyInsert {
    /// This transaction now owns the key.
    Inserted,
    /// The key already exists; here is the current record.
    Duplicate(IdempotencyRecord),
}

/// Delivery state of an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Published,
    /// Dead-lettered after exhausting the retry budget; requires operator
    /// intervention, never silently dropped.
    Failed,
}

/// One transactional-outbox row.
///
/// Written in the same transaction as the journal entry it describes, then
/// drained by the dispatcher. `next_attempt_at` doubles as the retry-backoff
/// schedule and the claim lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub topic: String,
    pub partition_key: String,
    pub headers: HashMap<String, String>,
    pub payload: JsonValue,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    pub fn new(
        tenant_id: TenantId,
        topic: impl Into<String>,
        partition_key: impl Into<String>,
        headers: HashMap<String, String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: MessageId::new(),
            tenant_id,
            topic: topic.into(),
            partition_key: partition_key.into(),
            headers,
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            published_at: None,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Whether the dispatcher may pick this message up at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// One open serializable transaction, scoped to a single tenant.
///
/// Dropping the transaction without calling `commit` rolls it back; nothing
/// staged inside it is visible to other transactions until commit succeeds.
pub trait LedgerTx {
    fn tenant_id(&self) -> TenantId;

    /// Load the given accounts in one round trip. Missing ids are simply
    /// absent from the result; the caller decides whether that is an error.
    fn fetch_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError>;

    /// Stage updated account rows (balance + version) for commit.
    fn upsert_accounts(&mut self, accounts: &[Account]) -> Result<(), StoreError>;

    fn insert_entry(&mut self, entry: &JournalEntry) -> Result<(), StoreError>;

    fn insert_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError>;

    /// Try to claim `request_key` for this transaction. Never fails on a
    /// duplicate: the existing record is returned instead.
    fn insert_idempotency(&mut self, request_key: &str) -> Result<IdempotencyInsert, StoreError>;

    /// Move a key this transaction owns to a terminal status with its
    /// serialized outcome.
    fn update_idempotency(
        &mut self,
        request_key: &str,
        status: IdempotencyStatus,
        result: JsonValue,
    ) -> Result<(), StoreError>;

    /// Commit everything staged. A `Conflict` here means another transaction
    /// won a serialization race; nothing was applied.
    fn commit(self) -> Result<(), StoreError>;
}

/// The ledger's storage backend.
pub trait LedgerStore: Send + Sync {
    type Tx: LedgerTx;

    /// Open a serializable transaction scoped to `tenant_id`.
    fn begin(&self, tenant_id: TenantId) -> Result<Self::Tx, StoreError>;

    /// Create an account; duplicate `(tenant, id)` is a `UniqueViolation`.
    fn create_account(&self, account: Account) -> Result<(), StoreError>;

    fn get_account(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> Result<Option<Account>, StoreError>;

    fn get_entry(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<Option<JournalEntry>, StoreError>;

    fn get_idempotency(
        &self,
        tenant_id: TenantId,
        request_key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Claim up to `limit` ready outbox messages, oldest first, leasing them
    /// until `now + lease` so concurrent dispatchers do not double-deliver
    /// within the lease window.
    fn claim_ready_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    fn mark_outbox_published(
        &self,
        id: MessageId,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record a failed publish attempt and schedule the next one.
    fn mark_outbox_retry(
        &self,
        id: MessageId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Dead-letter a message after the retry budget is spent.
    fn mark_outbox_failed(&self, id: MessageId, error: &str) -> Result<(), StoreError>;

    /// Delete published messages older than `older_than`; returns how many
    /// rows were removed. Pending and failed messages are never pruned.
    fn prune_published_outbox(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Inspect one outbox message (monitoring and tests).
    fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError>;
}

impl<S> LedgerStore for std::sync::Arc<S>
where
    S: LedgerStore + ?Sized,
{
    type Tx = S::Tx;

    fn begin(&self, tenant_id: TenantId) -> Result<Self::Tx, StoreError> {
        (**self).begin(tenant_id)
    }

    fn create_account(&self, account: Account) -> Result<(), StoreError> {
        (**self).create_account(account)
    }

    fn get_account(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> Result<Option<Account>, StoreError> {
        (**self).get_account(tenant_id, account_id)
    }

    fn get_entry(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<Option<JournalEntry>, StoreError> {
        (**self).get_entry(tenant_id, entry_id)
    }

    fn get_idempotency(
        &self,
        tenant_id: TenantId,
        request_key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        (**self).get_idempotency(tenant_id, request_key)
    }

    fn claim_ready_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        (**self).claim_ready_outbox(limit, now, lease)
    }

    fn mark_outbox_published(
        &self,
        id: MessageId,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).mark_outbox_published(id, published_at)
    }

    fn mark_outbox_retry(
        &self,
        id: MessageId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).mark_outbox_retry(id, error, next_attempt_at)
    }

    fn mark_outbox_failed(&self, id: MessageId, error: &str) -> Result<(), StoreError> {
        (**self).mark_outbox_failed(id, error)
    }

    fn prune_published_outbox(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).prune_published_outbox(older_than)
    }

    fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        (**self).get_outbox_message(id)
    }
}
