//! Idempotency gate: at-most-one financial effect per client request key.
//!
//! The record insert rides the same serializable transaction as the guarded
//! operation, so the financial effect and the `Completed` record become
//! visible atomically. Under a concurrent duplicate the unique constraint on
//! `(tenant_id, request_key)` picks exactly one winner; the loser re-reads
//! and replays the winner's outcome instead of executing again.

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use tally_core::{LedgerError, LedgerResult, TenantId};

use crate::posting::{PostingConfig, map_store_error};
use crate::store::{
    IdempotencyInsert, IdempotencyRecord, IdempotencyStatus, LedgerStore, LedgerTx, StoreError,
};

/// Longest accepted request key. Keys are client-supplied; bound them before
/// they reach storage.
pub const MAX_REQUEST_KEY_LEN: usize = 255;

/// Result of a guarded operation plus whether it was served from the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentOutcome {
    pub result: JsonValue,
    /// True when this call performed no work and returned the stored outcome
    /// of an earlier request with the same key.
    pub replayed: bool,
}

/// Wraps state-changing operations in an idempotency check.
#[derive(Debug)]
pub struct IdempotencyGate<S> {
    store: S,
    config: PostingConfig,
}

impl<S: LedgerStore> IdempotencyGate<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, PostingConfig::default())
    }

    pub fn with_config(store: S, config: PostingConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute `op` at most once for `(tenant_id, request_key)`.
    ///
    /// - First caller: `op` runs inside a fresh transaction; its JSON result
    ///   is stored and returned with `replayed: false`.
    /// - Later duplicate of a success: the stored result, `replayed: true`.
    /// - Later duplicate of a deterministic failure: the original error.
    /// - Duplicate while the first is still in flight: `ConcurrencyConflict`,
    ///   since the outcome is not yet known.
    ///
    /// Serialization conflicts roll back both the operation and the record
    /// and are retried together, so a failed attempt leaves no trace.
    pub fn execute<F>(
        &self,
        tenant_id: TenantId,
        request_key: &str,
        op: F,
    ) -> LedgerResult<IdempotentOutcome>
    where
        F: Fn(&mut S::Tx) -> LedgerResult<JsonValue>,
    {
        if request_key.trim().is_empty() {
            return Err(LedgerError::validation("request key must not be empty"));
        }
        if request_key.len() > MAX_REQUEST_KEY_LEN {
            return Err(LedgerError::validation(format!(
                "request key exceeds {MAX_REQUEST_KEY_LEN} bytes"
            )));
        }

        let mut attempt = 1u32;
        loop {
            match self.try_execute(tenant_id, request_key, &op) {
                Err(LedgerError::ConcurrencyConflict(reason))
                    if attempt < self.config.max_attempts =>
                {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    debug!(
                        %tenant_id,
                        request_key,
                        attempt,
                        %reason,
                        "idempotent operation conflicted, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(LedgerError::ConcurrencyConflict(reason)) => {
                    return Err(LedgerError::conflict(format!(
                        "idempotent operation failed after {attempt} attempts: {reason}"
                    )));
                }
                other => return other,
            }
        }
    }

    fn try_execute<F>(
        &self,
        tenant_id: TenantId,
        request_key: &str,
        op: &F,
    ) -> LedgerResult<IdempotentOutcome>
    where
        F: Fn(&mut S::Tx) -> LedgerResult<JsonValue>,
    {
        let mut tx = self.store.begin(tenant_id).map_err(map_store_error)?;

        match tx.insert_idempotency(request_key).map_err(map_store_error)? {
            IdempotencyInsert::Duplicate(record) => replay(tenant_id, request_key, record),
            IdempotencyInsert::Inserted => match op(&mut tx) {
                Ok(result) => {
                    tx.update_idempotency(
                        request_key,
                        IdempotencyStatus::Completed,
                        result.clone(),
                    )
                    .map_err(map_store_error)?;

                    match tx.commit() {
                        Ok(()) => Ok(IdempotentOutcome {
                            result,
                            replayed: false,
                        }),
                        // A concurrent duplicate committed the key first;
                        // loop back and replay its outcome.
                        Err(StoreError::UniqueViolation(msg)) => Err(LedgerError::conflict(
                            format!("lost idempotency-key race: {msg}"),
                        )),
                        Err(other) => Err(map_store_error(other)),
                    }
                }
                Err(err) if err.is_retriable() => Err(err),
                Err(err) => {
                    // Deterministic failure: roll back the financial effect,
                    // then persist the failure so duplicates replay it.
                    drop(tx);
                    self.record_failure(tenant_id, request_key, &err);
                    Err(err)
                }
            },
        }
    }

    /// Commit a `Failed` record in its own transaction. Losing the key race
    /// here just means a concurrent attempt recorded an outcome first; the
    /// domain error is returned to the caller either way.
    fn record_failure(&self, tenant_id: TenantId, request_key: &str, err: &LedgerError) {
        let outcome = match serde_json::to_value(err) {
            Ok(v) => v,
            Err(e) => {
                warn!(%tenant_id, request_key, error = %e, "could not serialize failure outcome");
                return;
            }
        };

        let result: Result<(), StoreError> = (|| {
            let mut tx = self.store.begin(tenant_id)?;
            if let IdempotencyInsert::Inserted = tx.insert_idempotency(request_key)? {
                tx.update_idempotency(request_key, IdempotencyStatus::Failed, outcome)?;
                tx.commit()?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            warn!(%tenant_id, request_key, error = %e, "could not persist failure outcome");
        }
    }
}

fn replay(
    tenant_id: TenantId,
    request_key: &str,
    record: IdempotencyRecord,
) -> LedgerResult<IdempotentOutcome> {
    match record.status {
        IdempotencyStatus::Completed => {
            debug!(%tenant_id, request_key, "replaying stored outcome for duplicate request");
            Ok(IdempotentOutcome {
                result: record.result.unwrap_or(JsonValue::Null),
                replayed: true,
            })
        }
        IdempotencyStatus::Failed => {
            let stored = record.result.ok_or_else(|| {
                LedgerError::storage("failed idempotency record has no stored outcome")
            })?;
            let original: LedgerError = serde_json::from_value(stored).map_err(|e| {
                LedgerError::storage(format!("corrupt failure outcome for {request_key}: {e}"))
            })?;
            Err(original)
        }
        IdempotencyStatus::Pending => Err(LedgerError::conflict(format!(
            "request {request_key} is already in flight"
        ))),
    }
}
