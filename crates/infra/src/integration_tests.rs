//! Integration tests for the full posting pipeline.
//!
//! Posting → store commit → outbox dispatcher → bus → cache projection →
//! hedged reader, plus the concurrency behavior the unit tests cannot show:
//! threads racing on shared accounts and duplicate request keys.

mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use tally_core::{AccountId, Currency, LedgerError, Money, TenantId};
    use tally_events::InMemoryMessageBus;
    use tally_ledger::{Account, AccountType, EntryDraft, EntryLine};

    use crate::outbox::{OutboxConfig, OutboxDispatcher};
    use crate::posting::{PostingConfig, PostingEngine};
    use crate::projections::balance_cache::BalanceCacheStore;
    use crate::projections::{BalanceCacheProjection, CacheKey, InMemoryBalanceCache};
    use crate::reader::{BalanceSource, HedgedBalanceReader, ReadConfig};
    use crate::store::{InMemoryLedgerStore, LedgerStore};
    use crate::transfer::TransferService;
    use crate::workers::ProjectionWorker;

    fn ngn(minor: i64) -> Money {
        Money::new(minor, Currency::NGN)
    }

    fn seed(store: &InMemoryLedgerStore, tenant_id: TenantId, minor: i64) -> AccountId {
        let account = Account::new(
            tenant_id,
            AccountId::new(),
            "acct",
            AccountType::Asset,
            Currency::NGN,
        )
        .with_balance(ngn(minor));
        let id = account.id;
        store.create_account(account).unwrap();
        id
    }

    fn balance(store: &InMemoryLedgerStore, tenant_id: TenantId, id: AccountId) -> i64 {
        store
            .get_account(tenant_id, id)
            .unwrap()
            .unwrap()
            .balance
            .minor()
    }

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn fast_config() -> PostingConfig {
        PostingConfig::default()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn posting_pipeline_end_to_end() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let cache = Arc::new(InMemoryBalanceCache::new());
        let tenant_id = TenantId::new();
        let from = seed(&store, tenant_id, 5_000);
        let to = seed(&store, tenant_id, 2_000);

        // Consumer side: projection worker feeding the balance cache.
        let projection = Arc::new(BalanceCacheProjection::new(Arc::clone(&cache)));
        let worker = {
            let projection = Arc::clone(&projection);
            ProjectionWorker::spawn("balance-cache", Arc::clone(&bus), None, move |delivered| {
                projection.apply(&delivered)
            })
        };

        // Producer side: outbox dispatcher.
        let dispatcher_handle = OutboxDispatcher::with_config(
            Arc::clone(&store),
            Arc::clone(&bus),
            OutboxConfig::default().with_poll_interval(Duration::from_millis(5)),
        )
        .spawn("outbox");

        // Move 1,000 from one account to the other.
        let engine = PostingEngine::new(Arc::clone(&store));
        let draft = EntryDraft::new(
            tenant_id,
            "settlement",
            vec![EntryLine::new(to, ngn(1_000))],
            vec![EntryLine::new(from, ngn(1_000))],
        );
        engine.post(&draft).unwrap();

        assert_eq!(balance(&store, tenant_id, from), 4_000);
        assert_eq!(balance(&store, tenant_id, to), 3_000);

        // The event flows through outbox → bus → projection into the cache.
        let key = CacheKey::new(from, "NGN");
        assert!(
            wait_until(Duration::from_secs(5), || cache
                .get(tenant_id, &key)
                .is_some_and(|e| e.balance_minor == 4_000)),
            "cache never converged to the posted balance"
        );

        // A hedged read now answers from cache.
        let reader = HedgedBalanceReader::with_config(
            Arc::clone(&store),
            Arc::clone(&cache),
            ReadConfig::default().with_hedge_delay(Duration::from_millis(50)),
        );
        let view = reader.get_balance(tenant_id, from, Currency::NGN).unwrap();
        assert_eq!(view.balance_minor, 4_000);
        assert_eq!(view.source, BalanceSource::Cache);

        assert_eq!(dispatcher_handle.stats().published, 1);
        dispatcher_handle.stop();
        worker.shutdown();
    }

    #[test]
    fn unbalanced_and_overdrawing_entries_leave_no_trace() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let tenant_id = TenantId::new();
        let a = seed(&store, tenant_id, 500);
        let b = seed(&store, tenant_id, 0);
        let engine = PostingEngine::new(Arc::clone(&store));

        let unbalanced = EntryDraft::new(
            tenant_id,
            "skewed",
            vec![EntryLine::new(b, ngn(1_000))],
            vec![EntryLine::new(a, ngn(900))],
        );
        assert!(matches!(
            engine.post(&unbalanced).unwrap_err(),
            LedgerError::Validation(_)
        ));

        let overdraw = EntryDraft::new(
            tenant_id,
            "too much",
            vec![EntryLine::new(b, ngn(1_000))],
            vec![EntryLine::new(a, ngn(1_000))],
        );
        assert!(matches!(
            engine.post(&overdraw).unwrap_err(),
            LedgerError::InsufficientBalance { .. }
        ));

        assert_eq!(balance(&store, tenant_id, a), 500);
        assert_eq!(balance(&store, tenant_id, b), 0);
        let claimed = store
            .claim_ready_outbox(10, chrono::Utc::now(), chrono::Duration::seconds(30))
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[test]
    fn concurrent_transfers_on_a_shared_account_all_land() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let tenant_id = TenantId::new();
        let hub = seed(&store, tenant_id, 100_000);
        let spokes: Vec<AccountId> = (0..8).map(|_| seed(&store, tenant_id, 0)).collect();

        let mut handles = Vec::new();
        for &spoke in &spokes {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                // Eight writers on one hub account; give the loser room.
                let engine =
                    PostingEngine::with_config(store, fast_config().with_max_attempts(32));
                let draft = EntryDraft::new(
                    tenant_id,
                    "fan out",
                    vec![EntryLine::new(spoke, ngn(1_000))],
                    vec![EntryLine::new(hub, ngn(1_000))],
                );
                engine.post(&draft)
            }));
        }

        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        // Every transfer landed exactly once; money is conserved.
        assert_eq!(balance(&store, tenant_id, hub), 92_000);
        for &spoke in &spokes {
            assert_eq!(balance(&store, tenant_id, spoke), 1_000);
        }
    }

    #[test]
    fn disjoint_transfers_do_not_conflict() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let tenant_id = TenantId::new();
        let pairs: Vec<(AccountId, AccountId)> = (0..4)
            .map(|_| (seed(&store, tenant_id, 5_000), seed(&store, tenant_id, 0)))
            .collect();

        let mut handles = Vec::new();
        for &(from, to) in &pairs {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                // No shared accounts, so one attempt must be enough.
                let engine = PostingEngine::with_config(
                    store,
                    fast_config().with_max_attempts(1),
                );
                let draft = EntryDraft::new(
                    tenant_id,
                    "disjoint",
                    vec![EntryLine::new(to, ngn(2_500))],
                    vec![EntryLine::new(from, ngn(2_500))],
                );
                engine.post(&draft)
            }));
        }

        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        for &(from, to) in &pairs {
            assert_eq!(balance(&store, tenant_id, from), 2_500);
            assert_eq!(balance(&store, tenant_id, to), 2_500);
        }
    }

    #[test]
    fn racing_duplicates_produce_one_financial_effect() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let tenant_id = TenantId::new();
        let from = seed(&store, tenant_id, 10_000);
        let to = seed(&store, tenant_id, 0);
        let fresh = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let fresh = Arc::clone(&fresh);
            handles.push(std::thread::spawn(move || {
                let service =
                    TransferService::with_config(store, fast_config().with_max_attempts(16));
                let receipt = service.transfer(
                    tenant_id,
                    "same-request",
                    from,
                    to,
                    ngn(1_000),
                    "payout",
                )?;
                if !receipt.replayed {
                    fresh.fetch_add(1, Ordering::SeqCst);
                }
                Ok::<_, LedgerError>(receipt)
            }));
        }

        let receipts: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        // All callers got the same entry, exactly one executed it.
        assert_eq!(fresh.load(Ordering::SeqCst), 1);
        assert!(receipts.windows(2).all(|w| w[0].entry_id == w[1].entry_id));
        assert_eq!(balance(&store, tenant_id, from), 9_000);
        assert_eq!(balance(&store, tenant_id, to), 1_000);
    }

    #[test]
    fn tenants_share_nothing_through_the_pipeline() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let cache = Arc::new(InMemoryBalanceCache::new());
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let a_from = seed(&store, tenant_a, 5_000);
        let a_to = seed(&store, tenant_a, 0);
        seed(&store, tenant_b, 5_000);

        let projection = Arc::new(BalanceCacheProjection::new(Arc::clone(&cache)));
        // Worker pinned to tenant B must ignore tenant A's events.
        let worker = {
            let projection = Arc::clone(&projection);
            ProjectionWorker::spawn(
                "tenant-b-cache",
                Arc::clone(&bus),
                Some(tenant_b),
                move |delivered| projection.apply(&delivered),
            )
        };
        let dispatcher = OutboxDispatcher::with_config(
            Arc::clone(&store),
            Arc::clone(&bus),
            OutboxConfig::default().with_poll_interval(Duration::from_millis(5)),
        )
        .spawn("outbox");

        let engine = PostingEngine::new(Arc::clone(&store));
        engine
            .post(&EntryDraft::new(
                tenant_a,
                "a-only",
                vec![EntryLine::new(a_to, ngn(1_000))],
                vec![EntryLine::new(a_from, ngn(1_000))],
            ))
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            dispatcher.stats().published == 1
        }));
        // Give the worker a moment to (not) consume it.
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.is_empty(), "tenant-B worker cached tenant-A balances");

        dispatcher.stop();
        worker.shutdown();
    }
}
