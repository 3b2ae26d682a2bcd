use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{AccountId, Currency, LedgerError, LedgerResult, Money, TenantId};

use crate::entry::Direction;

/// High-level account kind (determines debit/credit polarity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

/// The signed balance delta a posting applies to an account.
///
/// This is the whole polarity rule as one closed, exhaustively-testable
/// table: Asset and Expense accounts grow on debit; Liability, Equity and
/// Income accounts grow on credit.
pub fn balance_delta(account_type: AccountType, direction: Direction, amount_minor: i64) -> i64 {
    match (account_type, direction) {
        (AccountType::Asset | AccountType::Expense, Direction::Debit) => amount_minor,
        (AccountType::Asset | AccountType::Expense, Direction::Credit) => -amount_minor,
        (
            AccountType::Liability | AccountType::Equity | AccountType::Income,
            Direction::Debit,
        ) => -amount_minor,
        (
            AccountType::Liability | AccountType::Equity | AccountType::Income,
            Direction::Credit,
        ) => amount_minor,
    }
}

/// A ledger account: tenant-scoped identity, current balance, and a
/// monotonic version counter bumped on every balance mutation.
///
/// Accounts are created once per tenant+identifier, mutated only through the
/// posting engine, and never physically deleted (soft-closed by flag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub tenant_id: TenantId,
    pub id: AccountId,
    pub name: String,
    pub account_type: AccountType,
    pub balance: Money,
    pub version: u64,
    /// When false (the default for guarded accounts, typically Asset),
    /// balance-decreasing postings that would cross zero are rejected.
    pub allow_negative: bool,
    /// Soft-close flag; closed accounts reject further postings.
    pub closed: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        tenant_id: TenantId,
        id: AccountId,
        name: impl Into<String>,
        account_type: AccountType,
        currency: Currency,
    ) -> Self {
        Self {
            tenant_id,
            id,
            name: name.into(),
            account_type,
            balance: Money::zero(currency),
            version: 0,
            allow_negative: !matches!(account_type, AccountType::Asset),
            closed: false,
            created_at: Utc::now(),
        }
    }

    /// Override the negative-balance guard (e.g. an Asset settlement account
    /// that may legitimately run an overdraft).
    pub fn with_allow_negative(mut self, allow: bool) -> Self {
        self.allow_negative = allow;
        self
    }

    /// Seed an opening balance; test/bootstrap convenience, not a posting.
    pub fn with_balance(mut self, balance: Money) -> Self {
        self.balance = balance;
        self
    }

    pub fn currency(&self) -> Currency {
        self.balance.currency()
    }

    /// Apply one posting line to the in-memory balance.
    ///
    /// Checks the currency, the soft-close flag and the negative-balance
    /// guard before mutating; on success the balance moves by the polarity
    /// delta and `version` increments.
    pub fn apply(&mut self, direction: Direction, amount: Money) -> LedgerResult<()> {
        if self.closed {
            return Err(LedgerError::validation(format!(
                "account {} is closed",
                self.id
            )));
        }
        if amount.currency() != self.currency() {
            return Err(LedgerError::CurrencyMismatch {
                expected: self.currency().code().to_string(),
                found: amount.currency().code().to_string(),
            });
        }

        let delta = balance_delta(self.account_type, direction, amount.minor());
        let next = self.balance.checked_add_minor(delta)?;

        if next.is_negative() && !self.allow_negative {
            return Err(LedgerError::InsufficientBalance {
                account_id: self.id,
                available_minor: self.balance.minor(),
                requested_minor: amount.minor(),
            });
        }

        self.balance = next;
        self.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::Currency;

    fn asset(balance_minor: i64) -> Account {
        Account::new(
            TenantId::new(),
            AccountId::new(),
            "Cash",
            AccountType::Asset,
            Currency::NGN,
        )
        .with_balance(Money::new(balance_minor, Currency::NGN))
    }

    #[test]
    fn polarity_table_is_exhaustive_and_symmetric() {
        use AccountType::*;
        use Direction::*;

        // Growth side per type.
        assert_eq!(balance_delta(Asset, Debit, 100), 100);
        assert_eq!(balance_delta(Expense, Debit, 100), 100);
        assert_eq!(balance_delta(Liability, Credit, 100), 100);
        assert_eq!(balance_delta(Equity, Credit, 100), 100);
        assert_eq!(balance_delta(Income, Credit, 100), 100);

        // Opposite direction negates, for every type.
        for t in [Asset, Liability, Equity, Income, Expense] {
            assert_eq!(
                balance_delta(t, Debit, 77) + balance_delta(t, Credit, 77),
                0
            );
        }
    }

    #[test]
    fn debit_increases_asset_balance() {
        let mut account = asset(1_000);
        account
            .apply(Direction::Debit, Money::new(500, Currency::NGN))
            .unwrap();
        assert_eq!(account.balance.minor(), 1_500);
        assert_eq!(account.version, 1);
    }

    #[test]
    fn credit_crossing_zero_is_rejected_on_guarded_account() {
        let mut account = asset(500);
        let err = account
            .apply(Direction::Credit, Money::new(1_000, Currency::NGN))
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::InsufficientBalance {
                available_minor: 500,
                requested_minor: 1_000,
                ..
            }
        ));
        // Balance untouched on rejection.
        assert_eq!(account.balance.minor(), 500);
        assert_eq!(account.version, 0);
    }

    #[test]
    fn overdraft_allowed_when_flagged() {
        let mut account = asset(500).with_allow_negative(true);
        account
            .apply(Direction::Credit, Money::new(1_000, Currency::NGN))
            .unwrap();
        assert_eq!(account.balance.minor(), -500);
    }

    #[test]
    fn liability_polarity_is_reversed() {
        let mut account = Account::new(
            TenantId::new(),
            AccountId::new(),
            "Payables",
            AccountType::Liability,
            Currency::NGN,
        );
        account
            .apply(Direction::Credit, Money::new(300, Currency::NGN))
            .unwrap();
        assert_eq!(account.balance.minor(), 300);

        account
            .apply(Direction::Debit, Money::new(100, Currency::NGN))
            .unwrap();
        assert_eq!(account.balance.minor(), 200);
    }

    #[test]
    fn closed_account_rejects_postings() {
        let mut account = asset(1_000);
        account.closed = true;

        let err = account
            .apply(Direction::Debit, Money::new(100, Currency::NGN))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn wrong_currency_posting_is_rejected() {
        let mut account = asset(1_000);
        let err = account
            .apply(Direction::Debit, Money::new(100, Currency::USD))
            .unwrap_err();
        assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
    }
}
