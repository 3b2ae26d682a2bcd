//! Balance cache projection.
//!
//! Consumes `JournalEntryPosted` records and maintains a per-account balance
//! cache. The bus is at-least-once with per-partition ordering only, so the
//! projector guards every write with the account's monotonic store version:
//! a snapshot is applied only if its version is strictly greater than the
//! cached one. Duplicates and stale out-of-order deliveries become no-ops,
//! never wall-clock comparisons.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, trace};

use tally_core::{AccountId, TenantId};
use tally_events::{BusRecord, Delivered};
use tally_ledger::{JournalEntryPosted, TOPIC_JOURNAL_ENTRY_POSTED};

use crate::store::{LedgerStore, StoreError};

/// Cache lookup key: balances are cached per account and currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub account_id: AccountId,
    pub currency: String,
}

impl CacheKey {
    pub fn new(account_id: AccountId, currency: impl Into<String>) -> Self {
        Self {
            account_id,
            currency: currency.into(),
        }
    }
}

/// One cached balance with the version that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub balance_minor: i64,
    /// The account's store version at snapshot time; the apply guard.
    pub version: u64,
    /// When this entry was written; used only for staleness (TTL), never for
    /// ordering decisions.
    pub observed_at: DateTime<Utc>,
}

/// Versioned balance cache.
pub trait BalanceCacheStore: Send + Sync {
    fn get(&self, tenant_id: TenantId, key: &CacheKey) -> Option<CacheEntry>;

    /// Write `entry` only if its version is strictly greater than what is
    /// cached. Returns whether the write was applied.
    fn upsert_if_newer(&self, tenant_id: TenantId, key: CacheKey, entry: CacheEntry) -> bool;

    /// Drop every entry for `tenant_id` (rebuild support).
    fn clear_tenant(&self, tenant_id: TenantId);
}

impl<C> BalanceCacheStore for Arc<C>
where
    C: BalanceCacheStore + ?Sized,
{
    fn get(&self, tenant_id: TenantId, key: &CacheKey) -> Option<CacheEntry> {
        (**self).get(tenant_id, key)
    }

    fn upsert_if_newer(&self, tenant_id: TenantId, key: CacheKey, entry: CacheEntry) -> bool {
        (**self).upsert_if_newer(tenant_id, key, entry)
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        (**self).clear_tenant(tenant_id)
    }
}

/// `RwLock<HashMap>` cache used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryBalanceCache {
    entries: RwLock<HashMap<(TenantId, CacheKey), CacheEntry>>,
}

impl InMemoryBalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BalanceCacheStore for InMemoryBalanceCache {
    fn get(&self, tenant_id: TenantId, key: &CacheKey) -> Option<CacheEntry> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&(tenant_id, key.clone())).copied())
    }

    fn upsert_if_newer(&self, tenant_id: TenantId, key: CacheKey, entry: CacheEntry) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        match entries.get(&(tenant_id, key.clone())) {
            Some(existing) if existing.version >= entry.version => false,
            _ => {
                entries.insert((tenant_id, key), entry);
                true
            }
        }
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|(t, _), _| *t != tenant_id);
        }
    }
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("malformed event payload: {0}")]
    Deserialize(String),

    /// The payload's tenant does not match the record envelope. Always a bug
    /// upstream; the record is dropped loudly rather than applied.
    #[error("tenant isolation violated: {0}")]
    TenantIsolation(String),

    #[error("rebuild failed: {0}")]
    Rebuild(#[from] StoreError),
}

/// Applies posting events to a `BalanceCacheStore`.
#[derive(Debug)]
pub struct BalanceCacheProjection<C> {
    cache: C,
}

impl<C: BalanceCacheStore> BalanceCacheProjection<C> {
    pub fn new(cache: C) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Apply one delivered record. Unknown topics are skipped; duplicate and
    /// out-of-order snapshots are version-guarded no-ops.
    pub fn apply(
        &self,
        delivered: &Delivered<BusRecord<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        let record = &delivered.message;
        if record.topic() != TOPIC_JOURNAL_ENTRY_POSTED {
            trace!(topic = %record.topic(), "skipping record for foreign topic");
            return Ok(());
        }

        let event: JournalEntryPosted = serde_json::from_value(record.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        if event.tenant_id != record.tenant_id() {
            return Err(ProjectionError::TenantIsolation(format!(
                "payload tenant {} does not match envelope tenant {}",
                event.tenant_id,
                record.tenant_id()
            )));
        }

        let now = Utc::now();
        for snapshot in &event.balances {
            let applied = self.cache.upsert_if_newer(
                event.tenant_id,
                CacheKey::new(snapshot.account_id, snapshot.currency.clone()),
                CacheEntry {
                    balance_minor: snapshot.balance_minor,
                    version: snapshot.account_version,
                    observed_at: now,
                },
            );
            if !applied {
                debug!(
                    account_id = %snapshot.account_id,
                    version = snapshot.account_version,
                    offset = delivered.offset,
                    "stale balance snapshot skipped"
                );
            }
        }
        Ok(())
    }

    /// Rebuild a tenant's cache from authoritative store state.
    ///
    /// The version guard makes this safe to run while events keep flowing:
    /// a concurrent event with a newer version simply wins.
    pub fn rebuild_accounts<S: LedgerStore>(
        &self,
        store: &S,
        tenant_id: TenantId,
        account_ids: &[AccountId],
    ) -> Result<usize, ProjectionError> {
        let mut refreshed = 0;
        for &account_id in account_ids {
            if let Some(account) = store.get_account(tenant_id, account_id)? {
                let applied = self.cache.upsert_if_newer(
                    tenant_id,
                    CacheKey::new(account_id, account.currency().code()),
                    CacheEntry {
                        balance_minor: account.balance.minor(),
                        version: account.version,
                        observed_at: Utc::now(),
                    },
                );
                if applied {
                    refreshed += 1;
                }
            }
        }
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{EntryId, MessageId};
    use tally_ledger::BalanceSnapshot;

    fn delivered(
        offset: u64,
        tenant_id: TenantId,
        payload_tenant: TenantId,
        account_id: AccountId,
        balance_minor: i64,
        version: u64,
    ) -> Delivered<BusRecord<JsonValue>> {
        let event = JournalEntryPosted {
            tenant_id: payload_tenant,
            entry_id: EntryId::new(),
            narration: "test".to_string(),
            lines: vec![],
            balances: vec![BalanceSnapshot {
                account_id,
                currency: "NGN".to_string(),
                balance_minor,
                account_version: version,
            }],
            occurred_at: Utc::now(),
        };
        Delivered {
            offset,
            message: BusRecord::new(
                *MessageId::new().as_uuid(),
                tenant_id,
                TOPIC_JOURNAL_ENTRY_POSTED,
                tenant_id.to_string(),
                HashMap::new(),
                serde_json::to_value(&event).unwrap(),
            ),
        }
    }

    #[test]
    fn fresh_snapshot_updates_the_cache() {
        let projection = BalanceCacheProjection::new(InMemoryBalanceCache::new());
        let tenant_id = TenantId::new();
        let account_id = AccountId::new();

        projection
            .apply(&delivered(1, tenant_id, tenant_id, account_id, 4_000, 3))
            .unwrap();

        let entry = projection
            .cache()
            .get(tenant_id, &CacheKey::new(account_id, "NGN"))
            .unwrap();
        assert_eq!(entry.balance_minor, 4_000);
        assert_eq!(entry.version, 3);
    }

    #[test]
    fn stale_and_duplicate_snapshots_are_noops() {
        let projection = BalanceCacheProjection::new(InMemoryBalanceCache::new());
        let tenant_id = TenantId::new();
        let account_id = AccountId::new();
        let key = CacheKey::new(account_id, "NGN");

        projection
            .apply(&delivered(1, tenant_id, tenant_id, account_id, 4_000, 5))
            .unwrap();
        // Older version delivered late.
        projection
            .apply(&delivered(2, tenant_id, tenant_id, account_id, 9_999, 4))
            .unwrap();
        // Exact duplicate.
        projection
            .apply(&delivered(3, tenant_id, tenant_id, account_id, 9_999, 5))
            .unwrap();

        let entry = projection.cache().get(tenant_id, &key).unwrap();
        assert_eq!(entry.balance_minor, 4_000);
        assert_eq!(entry.version, 5);
    }

    #[test]
    fn foreign_topics_are_skipped() {
        let projection = BalanceCacheProjection::new(InMemoryBalanceCache::new());
        let tenant_id = TenantId::new();

        let record = BusRecord::new(
            *MessageId::new().as_uuid(),
            tenant_id,
            "some.other.topic",
            "p",
            HashMap::new(),
            serde_json::json!({"not": "a posting"}),
        );
        projection
            .apply(&Delivered { offset: 1, message: record })
            .unwrap();
        assert!(projection.cache().is_empty());
    }

    #[test]
    fn mismatched_tenant_is_rejected() {
        let projection = BalanceCacheProjection::new(InMemoryBalanceCache::new());
        let envelope_tenant = TenantId::new();
        let payload_tenant = TenantId::new();

        let err = projection
            .apply(&delivered(
                1,
                envelope_tenant,
                payload_tenant,
                AccountId::new(),
                100,
                1,
            ))
            .unwrap_err();
        assert!(matches!(err, ProjectionError::TenantIsolation(_)));
        assert!(projection.cache().is_empty());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let projection = BalanceCacheProjection::new(InMemoryBalanceCache::new());
        let tenant_id = TenantId::new();

        let record = BusRecord::new(
            *MessageId::new().as_uuid(),
            tenant_id,
            TOPIC_JOURNAL_ENTRY_POSTED,
            "p",
            HashMap::new(),
            serde_json::json!({"garbage": true}),
        );
        let err = projection
            .apply(&Delivered { offset: 1, message: record })
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Deserialize(_)));
    }

    #[test]
    fn clear_tenant_only_affects_that_tenant() {
        let cache = InMemoryBalanceCache::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let entry = CacheEntry {
            balance_minor: 1,
            version: 1,
            observed_at: Utc::now(),
        };

        cache.upsert_if_newer(tenant_a, CacheKey::new(AccountId::new(), "NGN"), entry);
        cache.upsert_if_newer(tenant_b, CacheKey::new(AccountId::new(), "NGN"), entry);

        cache.clear_tenant(tenant_a);
        assert_eq!(cache.len(), 1);
    }
}
