//! Idempotent account-to-account transfers.
//!
//! A transfer is the canonical guarded operation: a two-line journal entry
//! (debit the destination, credit the source) executed through the
//! idempotency gate, so retried client requests move money exactly once.

use serde::{Deserialize, Serialize};

use tally_core::{AccountId, LedgerError, LedgerResult, Money, TenantId};
use tally_ledger::{EntryDraft, EntryLine};

use crate::idempotency::{IdempotencyGate, IdempotentOutcome};
use crate::posting::{PostingConfig, execute_in_tx};
use crate::store::LedgerStore;

/// Stored (and replayed) outcome of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub entry_id: tally_core::EntryId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount_minor: i64,
    pub currency: String,
    /// True when this receipt was served from the idempotency record rather
    /// than a fresh posting.
    #[serde(skip, default)]
    pub replayed: bool,
}

/// Money movement between two accounts of the same tenant and currency.
#[derive(Debug)]
pub struct TransferService<S> {
    gate: IdempotencyGate<S>,
}

impl<S: LedgerStore> TransferService<S> {
    pub fn new(store: S) -> Self {
        Self {
            gate: IdempotencyGate::new(store),
        }
    }

    pub fn with_config(store: S, config: PostingConfig) -> Self {
        Self {
            gate: IdempotencyGate::with_config(store, config),
        }
    }

    /// Move `amount` from `from` to `to`, at most once per `request_key`.
    pub fn transfer(
        &self,
        tenant_id: TenantId,
        request_key: &str,
        from: AccountId,
        to: AccountId,
        amount: Money,
        narration: &str,
    ) -> LedgerResult<TransferReceipt> {
        if from == to {
            return Err(LedgerError::validation(
                "transfer source and destination must differ",
            ));
        }

        let draft = EntryDraft::new(
            tenant_id,
            narration,
            vec![EntryLine::new(to, amount)],
            vec![EntryLine::new(from, amount)],
        );

        let outcome = self.gate.execute(tenant_id, request_key, |tx| {
            let entry = execute_in_tx(tx, &draft)?;
            let receipt = TransferReceipt {
                entry_id: entry.id,
                from_account_id: from,
                to_account_id: to,
                amount_minor: amount.minor(),
                currency: amount.currency().code().to_string(),
                replayed: false,
            };
            serde_json::to_value(&receipt)
                .map_err(|e| LedgerError::storage(format!("receipt serialization failed: {e}")))
        })?;

        let IdempotentOutcome { result, replayed } = outcome;
        let mut receipt: TransferReceipt = serde_json::from_value(result)
            .map_err(|e| LedgerError::storage(format!("corrupt transfer receipt: {e}")))?;
        receipt.replayed = replayed;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tally_core::Currency;
    use tally_ledger::{Account, AccountType};

    use crate::store::InMemoryLedgerStore;

    fn seed(store: &InMemoryLedgerStore, tenant_id: TenantId, minor: i64) -> AccountId {
        let account = Account::new(
            tenant_id,
            AccountId::new(),
            "acct",
            AccountType::Asset,
            Currency::NGN,
        )
        .with_balance(Money::new(minor, Currency::NGN));
        let id = account.id;
        store.create_account(account).unwrap();
        id
    }

    #[test]
    fn retried_transfer_moves_money_once() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let tenant_id = TenantId::new();
        let from = seed(&store, tenant_id, 5_000);
        let to = seed(&store, tenant_id, 0);

        let service = TransferService::new(Arc::clone(&store));
        let amount = Money::new(1_000, Currency::NGN);

        let first = service
            .transfer(tenant_id, "tx-abc", from, to, amount, "payout")
            .unwrap();
        let second = service
            .transfer(tenant_id, "tx-abc", from, to, amount, "payout")
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.entry_id, second.entry_id);

        assert_eq!(
            store.get_account(tenant_id, from).unwrap().unwrap().balance.minor(),
            4_000
        );
        assert_eq!(
            store.get_account(tenant_id, to).unwrap().unwrap().balance.minor(),
            1_000
        );
    }

    #[test]
    fn self_transfer_is_rejected() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let tenant_id = TenantId::new();
        let account = seed(&store, tenant_id, 5_000);

        let service = TransferService::new(store);
        let err = service
            .transfer(
                tenant_id,
                "tx-self",
                account,
                account,
                Money::new(100, Currency::NGN),
                "loop",
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn failed_transfer_replays_the_original_error() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let tenant_id = TenantId::new();
        let from = seed(&store, tenant_id, 100);
        let to = seed(&store, tenant_id, 0);

        let service = TransferService::new(Arc::clone(&store));
        let amount = Money::new(1_000, Currency::NGN);

        let first = service
            .transfer(tenant_id, "tx-poor", from, to, amount, "too much")
            .unwrap_err();
        let second = service
            .transfer(tenant_id, "tx-poor", from, to, amount, "too much")
            .unwrap_err();

        assert!(matches!(first, LedgerError::InsufficientBalance { .. }));
        assert_eq!(first, second);

        // No partial effect on either attempt.
        assert_eq!(
            store.get_account(tenant_id, from).unwrap().unwrap().balance.minor(),
            100
        );
    }
}
