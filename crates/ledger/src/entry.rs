use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{AccountId, Currency, EntryId, LedgerError, LedgerResult, Money, TenantId};

/// Upper bound on narration length, checked before any I/O.
pub const MAX_NARRATION_LEN: usize = 256;

/// Which side of the ledger a posting touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

/// One debit or credit line within a journal entry (immutable).
///
/// Postings are owned by their entry and never created standalone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub account_id: AccountId,
    pub amount: Money,
    pub direction: Direction,
}

/// A posted journal entry: narration plus its ordered postings.
///
/// Entries are created and posted atomically and are immutable thereafter:
/// there is no update or delete, only compensating entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntryId,
    pub tenant_id: TenantId,
    pub narration: String,
    pub postings: Vec<Posting>,
    pub posted_at: DateTime<Utc>,
    pub posted: bool,
}

impl JournalEntry {
    pub fn currency(&self) -> Option<Currency> {
        self.postings.first().map(|p| p.amount.currency())
    }

    /// Distinct referenced account ids, in first-appearance order.
    pub fn account_ids(&self) -> Vec<AccountId> {
        let mut seen = Vec::new();
        for posting in &self.postings {
            if !seen.contains(&posting.account_id) {
                seen.push(posting.account_id);
            }
        }
        seen
    }
}

/// One input line of an entry draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryLine {
    pub account_id: AccountId,
    pub amount: Money,
}

impl EntryLine {
    pub fn new(account_id: AccountId, amount: Money) -> Self {
        Self { account_id, amount }
    }
}

/// Validated input for the posting engine: a not-yet-posted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub tenant_id: TenantId,
    pub narration: String,
    pub debits: Vec<EntryLine>,
    pub credits: Vec<EntryLine>,
}

impl EntryDraft {
    pub fn new(
        tenant_id: TenantId,
        narration: impl Into<String>,
        debits: Vec<EntryLine>,
        credits: Vec<EntryLine>,
    ) -> Self {
        Self {
            tenant_id,
            narration: narration.into(),
            debits,
            credits,
        }
    }

    /// Check every precondition of a posting before any I/O happens:
    /// narration bounds, at least one line per side, strictly positive
    /// amounts, a single currency across all lines, and balanced totals.
    ///
    /// Sums are computed in i128 so no pathological input can overflow.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.narration.trim().is_empty() {
            return Err(LedgerError::validation("narration must not be empty"));
        }
        if self.narration.chars().count() > MAX_NARRATION_LEN {
            return Err(LedgerError::validation(format!(
                "narration exceeds {MAX_NARRATION_LEN} characters"
            )));
        }
        if self.debits.is_empty() {
            return Err(LedgerError::validation("entry must have at least one debit line"));
        }
        if self.credits.is_empty() {
            return Err(LedgerError::validation("entry must have at least one credit line"));
        }

        let currency = self.debits[0].amount.currency();
        let mut debit_total: i128 = 0;
        let mut credit_total: i128 = 0;

        for line in self.debits.iter().chain(self.credits.iter()) {
            if !line.amount.is_positive() {
                return Err(LedgerError::validation("line amount must be strictly positive"));
            }
            if line.amount.currency() != currency {
                return Err(LedgerError::CurrencyMismatch {
                    expected: currency.code().to_string(),
                    found: line.amount.currency().code().to_string(),
                });
            }
        }
        for line in &self.debits {
            debit_total += line.amount.minor() as i128;
        }
        for line in &self.credits {
            credit_total += line.amount.minor() as i128;
        }

        if debit_total != credit_total {
            return Err(LedgerError::validation(format!(
                "debits ({debit_total}) must equal credits ({credit_total})"
            )));
        }

        Ok(())
    }

    /// The single currency shared by all lines. Only meaningful after
    /// `validate` has passed.
    pub fn currency(&self) -> Option<Currency> {
        self.debits.first().map(|l| l.amount.currency())
    }

    /// All lines as postings, debits first.
    pub fn postings(&self) -> Vec<Posting> {
        self.debits
            .iter()
            .map(|l| Posting {
                account_id: l.account_id,
                amount: l.amount,
                direction: Direction::Debit,
            })
            .chain(self.credits.iter().map(|l| Posting {
                account_id: l.account_id,
                amount: l.amount,
                direction: Direction::Credit,
            }))
            .collect()
    }

    /// Distinct referenced account ids, in first-appearance order.
    pub fn account_ids(&self) -> Vec<AccountId> {
        let mut seen = Vec::new();
        for line in self.debits.iter().chain(self.credits.iter()) {
            if !seen.contains(&line.account_id) {
                seen.push(line.account_id);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tally_core::Currency;

    fn ngn(minor: i64) -> Money {
        Money::new(minor, Currency::NGN)
    }

    fn draft(debit: i64, credit: i64) -> EntryDraft {
        EntryDraft::new(
            TenantId::new(),
            "test entry",
            vec![EntryLine::new(AccountId::new(), ngn(debit))],
            vec![EntryLine::new(AccountId::new(), ngn(credit))],
        )
    }

    #[test]
    fn balanced_draft_validates() {
        assert!(draft(1_000, 1_000).validate().is_ok());
    }

    #[test]
    fn unbalanced_draft_is_rejected() {
        let err = draft(1_000, 900).validate().unwrap_err();
        assert!(matches!(err, LedgerError::Validation(msg) if msg.contains("must equal")));
    }

    #[test]
    fn empty_narration_is_rejected() {
        let mut d = draft(100, 100);
        d.narration = "   ".to_string();
        assert!(d.validate().is_err());
    }

    #[test]
    fn overlong_narration_is_rejected() {
        let mut d = draft(100, 100);
        d.narration = "x".repeat(MAX_NARRATION_LEN + 1);
        assert!(d.validate().is_err());
    }

    #[test]
    fn missing_side_is_rejected() {
        let mut d = draft(100, 100);
        d.credits.clear();
        assert!(d.validate().is_err());

        let mut d = draft(100, 100);
        d.debits.clear();
        assert!(d.validate().is_err());
    }

    #[test]
    fn zero_and_negative_amounts_are_rejected() {
        assert!(draft(0, 0).validate().is_err());
        assert!(draft(-100, -100).validate().is_err());
    }

    #[test]
    fn mixed_currency_draft_is_rejected() {
        let d = EntryDraft::new(
            TenantId::new(),
            "fx not allowed",
            vec![EntryLine::new(AccountId::new(), ngn(100))],
            vec![EntryLine::new(AccountId::new(), Money::new(100, Currency::USD))],
        );
        assert!(matches!(
            d.validate().unwrap_err(),
            LedgerError::CurrencyMismatch { .. }
        ));
    }

    #[test]
    fn account_ids_dedupe_preserving_order() {
        let a = AccountId::new();
        let b = AccountId::new();
        let d = EntryDraft::new(
            TenantId::new(),
            "split",
            vec![EntryLine::new(a, ngn(50)), EntryLine::new(a, ngn(50))],
            vec![EntryLine::new(b, ngn(100))],
        );
        assert_eq!(d.account_ids(), vec![a, b]);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a draft built from any split of one positive total into
        /// debit lines and credit lines always validates, and its postings
        /// sum to zero under debit-positive/credit-negative accounting.
        #[test]
        fn balanced_splits_always_validate(
            amounts in prop::collection::vec(1i64..1_000_000i64, 1..8)
        ) {
            let total: i64 = amounts.iter().sum();
            let debits: Vec<_> = amounts
                .iter()
                .map(|&a| EntryLine::new(AccountId::new(), ngn(a)))
                .collect();
            let credits = vec![EntryLine::new(AccountId::new(), ngn(total))];

            let d = EntryDraft::new(TenantId::new(), "prop entry", debits, credits);
            prop_assert!(d.validate().is_ok());

            let mut signed: i128 = 0;
            for p in d.postings() {
                match p.direction {
                    Direction::Debit => signed += p.amount.minor() as i128,
                    Direction::Credit => signed -= p.amount.minor() as i128,
                }
            }
            prop_assert_eq!(signed, 0);
        }

        /// Property: perturbing one credit line by a non-zero delta always
        /// fails validation.
        #[test]
        fn perturbed_entries_never_validate(
            amount in 1i64..1_000_000i64,
            delta in prop_oneof![-1_000i64..0, 1i64..1_000]
        ) {
            let d = EntryDraft::new(
                TenantId::new(),
                "unbalanced",
                vec![EntryLine::new(AccountId::new(), ngn(amount))],
                vec![EntryLine::new(AccountId::new(), ngn(amount + delta))],
            );
            // delta may push the credit to zero/negative, which is also an error.
            prop_assert!(d.validate().is_err());
        }
    }
}
