//! Hedged balance reads.
//!
//! A read races the cache against the authoritative store: both lookups
//! start immediately, and the cache answer wins only if it arrives within
//! the hedge window and is fresh. Otherwise the store answer is used and
//! written back through the projector's version guard, so a backfill can
//! never clobber a newer cached balance.

use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use tally_core::{AccountId, Currency, LedgerError, LedgerResult, TenantId};

use crate::projections::{BalanceCacheStore, CacheEntry, CacheKey};
use crate::store::LedgerStore;

/// Hedge window and cache freshness bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadConfig {
    /// How long to wait for the cache before falling through to the store.
    pub hedge_delay: Duration,
    /// Cached entries older than this are treated as misses.
    pub cache_ttl: Duration,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            hedge_delay: Duration::from_millis(5),
            cache_ttl: Duration::from_secs(10),
        }
    }
}

impl ReadConfig {
    pub fn with_hedge_delay(mut self, hedge_delay: Duration) -> Self {
        self.hedge_delay = hedge_delay;
        self
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }
}

/// Where a balance answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceSource {
    Cache,
    Store,
}

/// A balance as served to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceView {
    pub balance_minor: i64,
    pub as_of: DateTime<Utc>,
    pub source: BalanceSource,
}

/// Serves balances by racing the cache against the store.
#[derive(Debug)]
pub struct HedgedBalanceReader<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
    config: ReadConfig,
}

impl<S, C> HedgedBalanceReader<S, C>
where
    S: LedgerStore + 'static,
    C: BalanceCacheStore + 'static,
{
    pub fn new(store: Arc<S>, cache: Arc<C>) -> Self {
        Self::with_config(store, cache, ReadConfig::default())
    }

    pub fn with_config(store: Arc<S>, cache: Arc<C>, config: ReadConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Read one account balance.
    ///
    /// Cache hit within the hedge window: served at the freshness the cache
    /// recorded. Miss, stale entry or slow cache: the store answers, and the
    /// result is backfilled through the version guard.
    pub fn get_balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        currency: Currency,
    ) -> LedgerResult<BalanceView> {
        let key = CacheKey::new(account_id, currency.code());

        // Both lookups start immediately; the hedge window only bounds how
        // long we wait for the cache, not when the store starts working.
        let (store_tx, store_rx) = channel();
        let store = Arc::clone(&self.store);
        std::thread::spawn(move || {
            let _ = store_tx.send(store.get_account(tenant_id, account_id));
        });

        let (cache_tx, cache_rx) = channel();
        let cache = Arc::clone(&self.cache);
        let cache_key = key.clone();
        std::thread::spawn(move || {
            let _ = cache_tx.send(cache.get(tenant_id, &cache_key));
        });

        let now = Utc::now();
        match cache_rx.recv_timeout(self.config.hedge_delay) {
            Ok(Some(entry)) if self.is_fresh(&entry, now) => {
                debug!(%tenant_id, %account_id, "balance served from cache");
                return Ok(BalanceView {
                    balance_minor: entry.balance_minor,
                    as_of: entry.observed_at,
                    source: BalanceSource::Cache,
                });
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                debug!(%tenant_id, %account_id, "cache missed the hedge window");
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(%tenant_id, %account_id, "cache lookup thread died");
            }
        }

        let account = store_rx
            .recv()
            .map_err(|_| LedgerError::storage("store lookup thread died"))?
            .map_err(|e| LedgerError::storage(e.to_string()))?
            .ok_or(LedgerError::AccountNotFound(account_id))?;

        if account.currency() != currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: account.currency().code().to_string(),
                found: currency.code().to_string(),
            });
        }

        // Backfill so the next read hits. The version guard keeps a racing
        // projector event with a newer version authoritative.
        let served_at = Utc::now();
        self.cache.upsert_if_newer(
            tenant_id,
            key,
            CacheEntry {
                balance_minor: account.balance.minor(),
                version: account.version,
                observed_at: served_at,
            },
        );

        Ok(BalanceView {
            balance_minor: account.balance.minor(),
            as_of: served_at,
            source: BalanceSource::Store,
        })
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(entry.observed_at);
        match chrono::Duration::from_std(self.config.cache_ttl) {
            Ok(ttl) => age <= ttl,
            Err(_) => true,
        }
    }
}
