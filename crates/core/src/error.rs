//! Ledger error model.
//!
//! Keep this focused on deterministic, business/domain failures (validation,
//! invariants, conflicts). Infrastructure concerns belong in the store layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::AccountId;

/// Result type used across the ledger domain.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger-level error.
///
/// The taxonomy mirrors how callers are expected to react:
/// - `Validation`, `CurrencyMismatch`, `AccountNotFound` and
///   `InsufficientBalance` are deterministic; retrying without changing the
///   input will fail again.
/// - `ConcurrencyConflict` is transient and safe to retry; no partial effect
///   occurred on the failed attempt.
///
/// Serde derives exist so the idempotency gate can persist a failed outcome
/// and replay it verbatim to later duplicates of the same request.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerError {
    /// Malformed or unbalanced input (e.g. empty narration, debits != credits).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Arithmetic or posting across two different currencies.
    #[error("currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: String, found: String },

    /// A referenced account does not exist for the tenant.
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    /// A balance-decreasing operation would take a guarded account below zero.
    #[error(
        "insufficient balance on account {account_id}: available {available_minor}, requested {requested_minor}"
    )]
    InsufficientBalance {
        account_id: AccountId,
        available_minor: i64,
        requested_minor: i64,
    },

    /// Serialization conflict after exhausting the retry budget. No partial
    /// effect occurred; the whole operation is safe to resubmit.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Underlying storage failure (infrastructure, not domain).
    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether the caller may safely resubmit the same request.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}
