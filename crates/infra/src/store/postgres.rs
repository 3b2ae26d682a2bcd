//! Postgres-backed `LedgerStore`.
//!
//! Transactions run at `SERIALIZABLE`; the database's serialization failures
//! (SQLSTATE `40001`/`40P01`) are mapped to `StoreError::Conflict` so the
//! posting engine's retry loop treats them uniformly with the in-memory
//! backend. Unique violations (`23505`) back the idempotency-key race and
//! duplicate-entry detection. See `schema.sql` for the table definitions.
//!
//! The `LedgerStore` trait is synchronous, so every operation bridges onto
//! the ambient tokio runtime via `Handle::try_current` + `block_on`, the
//! same way the rest of the process calls into sqlx.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use uuid::Uuid;

use tally_core::{AccountId, Currency, EntryId, MessageId, Money, TenantId};
use tally_ledger::{Account, AccountType, Direction, JournalEntry, Posting};

use super::r#trait::{
    IdempotencyInsert, IdempotencyRecord, IdempotencyStatus, LedgerStore, LedgerTx, OutboxMessage,
    OutboxStatus, StoreError,
};

/// Postgres-backed ledger store. Cheap to clone; all clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn runtime_handle() -> Result<Handle, StoreError> {
    Handle::try_current().map_err(|_| {
        StoreError::storage(
            "PostgresLedgerStore requires a tokio runtime; call from within a runtime context",
        )
    })
}

/// Map sqlx errors onto the store taxonomy.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Serialization failure / deadlock detected: retryable.
                Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                Some("23505") => StoreError::UniqueViolation(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::storage(format!("connection pool closed in {operation}"))
        }
        other => StoreError::storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn status_str(status: IdempotencyStatus) -> &'static str {
    match status {
        IdempotencyStatus::Pending => "pending",
        IdempotencyStatus::Completed => "completed",
        IdempotencyStatus::Failed => "failed",
    }
}

fn parse_idempotency_status(s: &str) -> Result<IdempotencyStatus, StoreError> {
    match s {
        "pending" => Ok(IdempotencyStatus::Pending),
        "completed" => Ok(IdempotencyStatus::Completed),
        "failed" => Ok(IdempotencyStatus::Failed),
        other => Err(StoreError::storage(format!(
            "unknown idempotency status '{other}'"
        ))),
    }
}

fn outbox_status_str(status: OutboxStatus) -> &'static str {
    match status {
        OutboxStatus::Pending => "pending",
        OutboxStatus::Published => "published",
        OutboxStatus::Failed => "failed",
    }
}

fn parse_outbox_status(s: &str) -> Result<OutboxStatus, StoreError> {
    match s {
        "pending" => Ok(OutboxStatus::Pending),
        "published" => Ok(OutboxStatus::Published),
        "failed" => Ok(OutboxStatus::Failed),
        other => Err(StoreError::storage(format!(
            "unknown outbox status '{other}'"
        ))),
    }
}

fn account_type_str(account_type: AccountType) -> &'static str {
    match account_type {
        AccountType::Asset => "asset",
        AccountType::Liability => "liability",
        AccountType::Equity => "equity",
        AccountType::Income => "income",
        AccountType::Expense => "expense",
    }
}

fn parse_account_type(s: &str) -> Result<AccountType, StoreError> {
    match s {
        "asset" => Ok(AccountType::Asset),
        "liability" => Ok(AccountType::Liability),
        "equity" => Ok(AccountType::Equity),
        "income" => Ok(AccountType::Income),
        "expense" => Ok(AccountType::Expense),
        other => Err(StoreError::storage(format!("unknown account type '{other}'"))),
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Debit => "debit",
        Direction::Credit => "credit",
    }
}

fn parse_direction(s: &str) -> Result<Direction, StoreError> {
    match s {
        "debit" => Ok(Direction::Debit),
        "credit" => Ok(Direction::Credit),
        other => Err(StoreError::storage(format!("unknown direction '{other}'"))),
    }
}

// Row types

#[derive(Debug)]
struct AccountRow {
    tenant_id: Uuid,
    account_id: Uuid,
    name: String,
    account_type: String,
    currency_code: String,
    currency_scale: i16,
    balance_minor: i64,
    version: i64,
    allow_negative: bool,
    closed: bool,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AccountRow {
            tenant_id: row.try_get("tenant_id")?,
            account_id: row.try_get("account_id")?,
            name: row.try_get("name")?,
            account_type: row.try_get("account_type")?,
            currency_code: row.try_get("currency_code")?,
            currency_scale: row.try_get("currency_scale")?,
            balance_minor: row.try_get("balance_minor")?,
            version: row.try_get("version")?,
            allow_negative: row.try_get("allow_negative")?,
            closed: row.try_get("closed")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, StoreError> {
        let currency = Currency::new(&row.currency_code, row.currency_scale as u8)
            .map_err(|e| StoreError::storage(format!("corrupt account row: {e}")))?;
        Ok(Account {
            tenant_id: TenantId::from_uuid(row.tenant_id),
            id: AccountId::from_uuid(row.account_id),
            name: row.name,
            account_type: parse_account_type(&row.account_type)?,
            balance: Money::new(row.balance_minor, currency),
            version: row.version as u64,
            allow_negative: row.allow_negative,
            closed: row.closed,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct OutboxRow {
    message_id: Uuid,
    tenant_id: Uuid,
    topic: String,
    partition_key: String,
    headers: serde_json::Value,
    payload: serde_json::Value,
    status: String,
    retry_count: i32,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            message_id: row.try_get("message_id")?,
            tenant_id: row.try_get("tenant_id")?,
            topic: row.try_get("topic")?,
            partition_key: row.try_get("partition_key")?,
            headers: row.try_get("headers")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, StoreError> {
        let headers: HashMap<String, String> = serde_json::from_value(row.headers)
            .map_err(|e| StoreError::storage(format!("corrupt outbox headers: {e}")))?;
        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.message_id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            topic: row.topic,
            partition_key: row.partition_key,
            headers,
            payload: row.payload,
            status: parse_outbox_status(&row.status)?,
            retry_count: row.retry_count as u32,
            created_at: row.created_at,
            published_at: row.published_at,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
        })
    }
}

fn idempotency_from_row(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    let read = |e: sqlx::Error| StoreError::storage(format!("corrupt idempotency row: {e}"));
    let status: String = row.try_get("status").map_err(read)?;
    Ok(IdempotencyRecord {
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(read)?),
        request_key: row.try_get("request_key").map_err(read)?,
        status: parse_idempotency_status(&status)?,
        result: row.try_get("result").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

/// One open serializable Postgres transaction.
pub struct PostgresTx {
    handle: Handle,
    tx: Option<Transaction<'static, Postgres>>,
    tenant_id: TenantId,
}

impl PostgresTx {
    fn tx_mut(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::storage("transaction already finished"))
    }
}

impl LedgerTx for PostgresTx {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn fetch_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError> {
        let tenant_uuid = *self.tenant_id.as_uuid();
        let id_uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let handle = self.handle.clone();
        let tx = self.tx_mut()?;

        let rows = handle.block_on(async {
            sqlx::query(
                r#"
                SELECT tenant_id, account_id, name, account_type, currency_code,
                       currency_scale, balance_minor, version, allow_negative,
                       closed, created_at
                FROM accounts
                WHERE tenant_id = $1 AND account_id = ANY($2)
                "#,
            )
            .bind(tenant_uuid)
            .bind(&id_uuids)
            .fetch_all(&mut **tx)
            .await
        })
        .map_err(|e| map_sqlx_error("fetch_accounts", e))?;

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            let parsed = AccountRow::from_row(&row)
                .map_err(|e| StoreError::storage(format!("corrupt account row: {e}")))?;
            accounts.push(Account::try_from(parsed)?);
        }
        Ok(accounts)
    }

    fn upsert_accounts(&mut self, accounts: &[Account]) -> Result<(), StoreError> {
        for account in accounts {
            if account.tenant_id != self.tenant_id {
                return Err(StoreError::TenantIsolation(format!(
                    "account {} belongs to tenant {}, transaction is scoped to {}",
                    account.id, account.tenant_id, self.tenant_id
                )));
            }
        }

        let handle = self.handle.clone();
        let tx = self.tx_mut()?;
        for account in accounts {
            handle
                .block_on(async {
                    sqlx::query(
                        r#"
                        INSERT INTO accounts (
                            tenant_id, account_id, name, account_type, currency_code,
                            currency_scale, balance_minor, version, allow_negative,
                            closed, created_at
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                        ON CONFLICT (tenant_id, account_id)
                        DO UPDATE SET
                            name = EXCLUDED.name,
                            balance_minor = EXCLUDED.balance_minor,
                            version = EXCLUDED.version,
                            allow_negative = EXCLUDED.allow_negative,
                            closed = EXCLUDED.closed
                        "#,
                    )
                    .bind(account.tenant_id.as_uuid())
                    .bind(account.id.as_uuid())
                    .bind(&account.name)
                    .bind(account_type_str(account.account_type))
                    .bind(account.currency().code())
                    .bind(account.currency().scale() as i16)
                    .bind(account.balance.minor())
                    .bind(account.version as i64)
                    .bind(account.allow_negative)
                    .bind(account.closed)
                    .bind(account.created_at)
                    .execute(&mut **tx)
                    .await
                })
                .map_err(|e| map_sqlx_error("upsert_accounts", e))?;
        }
        Ok(())
    }

    fn insert_entry(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        if entry.tenant_id != self.tenant_id {
            return Err(StoreError::TenantIsolation(format!(
                "entry {} belongs to tenant {}, transaction is scoped to {}",
                entry.id, entry.tenant_id, self.tenant_id
            )));
        }

        let handle = self.handle.clone();
        let tx = self.tx_mut()?;
        handle
            .block_on(async {
                sqlx::query(
                    r#"
                    INSERT INTO journal_entries (tenant_id, entry_id, narration, posted_at)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(entry.tenant_id.as_uuid())
                .bind(entry.id.as_uuid())
                .bind(&entry.narration)
                .bind(entry.posted_at)
                .execute(&mut **tx)
                .await
            })
            .map_err(|e| map_sqlx_error("insert_entry", e))?;

        for (line_no, posting) in entry.postings.iter().enumerate() {
            handle
                .block_on(async {
                    sqlx::query(
                        r#"
                        INSERT INTO postings (
                            tenant_id, entry_id, line_no, account_id, direction,
                            amount_minor, currency_code, currency_scale
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        "#,
                    )
                    .bind(entry.tenant_id.as_uuid())
                    .bind(entry.id.as_uuid())
                    .bind(line_no as i32)
                    .bind(posting.account_id.as_uuid())
                    .bind(direction_str(posting.direction))
                    .bind(posting.amount.minor())
                    .bind(posting.amount.currency().code())
                    .bind(posting.amount.currency().scale() as i16)
                    .execute(&mut **tx)
                    .await
                })
                .map_err(|e| map_sqlx_error("insert_posting", e))?;
        }
        Ok(())
    }

    fn insert_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        if message.tenant_id != self.tenant_id {
            return Err(StoreError::TenantIsolation(format!(
                "outbox message {} belongs to tenant {}, transaction is scoped to {}",
                message.id, message.tenant_id, self.tenant_id
            )));
        }

        let headers = serde_json::to_value(&message.headers)
            .map_err(|e| StoreError::storage(format!("headers serialization failed: {e}")))?;
        let handle = self.handle.clone();
        let tx = self.tx_mut()?;
        handle
            .block_on(async {
                sqlx::query(
                    r#"
                    INSERT INTO outbox (
                        message_id, tenant_id, topic, partition_key, headers,
                        payload, status, retry_count, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(message.id.as_uuid())
                .bind(message.tenant_id.as_uuid())
                .bind(&message.topic)
                .bind(&message.partition_key)
                .bind(&headers)
                .bind(&message.payload)
                .bind(outbox_status_str(message.status))
                .bind(message.retry_count as i32)
                .bind(message.created_at)
                .execute(&mut **tx)
                .await
            })
            .map_err(|e| map_sqlx_error("insert_outbox", e))?;
        Ok(())
    }

    fn insert_idempotency(&mut self, request_key: &str) -> Result<IdempotencyInsert, StoreError> {
        let tenant_uuid = *self.tenant_id.as_uuid();
        let handle = self.handle.clone();
        let tx = self.tx_mut()?;

        let inserted = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    INSERT INTO idempotency (tenant_id, request_key, status)
                    VALUES ($1, $2, 'pending')
                    ON CONFLICT (tenant_id, request_key) DO NOTHING
                    RETURNING request_key
                    "#,
                )
                .bind(tenant_uuid)
                .bind(request_key)
                .fetch_optional(&mut **tx)
                .await
            })
            .map_err(|e| map_sqlx_error("insert_idempotency", e))?;

        if inserted.is_some() {
            return Ok(IdempotencyInsert::Inserted);
        }

        let row = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    SELECT tenant_id, request_key, status, result, created_at, updated_at
                    FROM idempotency
                    WHERE tenant_id = $1 AND request_key = $2
                    "#,
                )
                .bind(tenant_uuid)
                .bind(request_key)
                .fetch_one(&mut **tx)
                .await
            })
            .map_err(|e| map_sqlx_error("read_idempotency", e))?;

        Ok(IdempotencyInsert::Duplicate(idempotency_from_row(&row)?))
    }

    fn update_idempotency(
        &mut self,
        request_key: &str,
        status: IdempotencyStatus,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let tenant_uuid = *self.tenant_id.as_uuid();
        let handle = self.handle.clone();
        let tx = self.tx_mut()?;

        let outcome = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    UPDATE idempotency
                    SET status = $3, result = $4, updated_at = NOW()
                    WHERE tenant_id = $1 AND request_key = $2
                    "#,
                )
                .bind(tenant_uuid)
                .bind(request_key)
                .bind(status_str(status))
                .bind(&result)
                .execute(&mut **tx)
                .await
            })
            .map_err(|e| map_sqlx_error("update_idempotency", e))?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "idempotency key {request_key} is not owned by this transaction"
            )));
        }
        Ok(())
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::storage("transaction already finished"))?;
        self.handle
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

impl LedgerStore for PostgresLedgerStore {
    type Tx = PostgresTx;

    fn begin(&self, tenant_id: TenantId) -> Result<Self::Tx, StoreError> {
        let handle = runtime_handle()?;
        let pool = Arc::clone(&self.pool);

        let tx = handle
            .block_on(async {
                let mut tx = pool.begin().await?;
                sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                    .execute(&mut *tx)
                    .await?;
                Ok::<_, sqlx::Error>(tx)
            })
            .map_err(|e| map_sqlx_error("begin", e))?;

        Ok(PostgresTx {
            handle,
            tx: Some(tx),
            tenant_id,
        })
    }

    fn create_account(&self, account: Account) -> Result<(), StoreError> {
        let handle = runtime_handle()?;
        handle
            .block_on(async {
                sqlx::query(
                    r#"
                    INSERT INTO accounts (
                        tenant_id, account_id, name, account_type, currency_code,
                        currency_scale, balance_minor, version, allow_negative,
                        closed, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    "#,
                )
                .bind(account.tenant_id.as_uuid())
                .bind(account.id.as_uuid())
                .bind(&account.name)
                .bind(account_type_str(account.account_type))
                .bind(account.currency().code())
                .bind(account.currency().scale() as i16)
                .bind(account.balance.minor())
                .bind(account.version as i64)
                .bind(account.allow_negative)
                .bind(account.closed)
                .bind(account.created_at)
                .execute(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("create_account", e))?;
        Ok(())
    }

    fn get_account(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> Result<Option<Account>, StoreError> {
        let handle = runtime_handle()?;
        let row = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    SELECT tenant_id, account_id, name, account_type, currency_code,
                           currency_scale, balance_minor, version, allow_negative,
                           closed, created_at
                    FROM accounts
                    WHERE tenant_id = $1 AND account_id = $2
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(account_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("get_account", e))?;

        match row {
            Some(row) => {
                let parsed = AccountRow::from_row(&row)
                    .map_err(|e| StoreError::storage(format!("corrupt account row: {e}")))?;
                Ok(Some(Account::try_from(parsed)?))
            }
            None => Ok(None),
        }
    }

    fn get_entry(
        &self,
        tenant_id: TenantId,
        entry_id: EntryId,
    ) -> Result<Option<JournalEntry>, StoreError> {
        let handle = runtime_handle()?;

        let entry_row = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    SELECT tenant_id, entry_id, narration, posted_at
                    FROM journal_entries
                    WHERE tenant_id = $1 AND entry_id = $2
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(entry_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("get_entry", e))?;

        let Some(entry_row) = entry_row else {
            return Ok(None);
        };

        let posting_rows = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    SELECT account_id, direction, amount_minor, currency_code, currency_scale
                    FROM postings
                    WHERE tenant_id = $1 AND entry_id = $2
                    ORDER BY line_no ASC
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(entry_id.as_uuid())
                .fetch_all(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("get_entry_postings", e))?;

        let read = |e: sqlx::Error| StoreError::storage(format!("corrupt posting row: {e}"));
        let mut postings = Vec::with_capacity(posting_rows.len());
        for row in posting_rows {
            let direction: String = row.try_get("direction").map_err(read)?;
            let code: String = row.try_get("currency_code").map_err(read)?;
            let scale: i16 = row.try_get("currency_scale").map_err(read)?;
            let currency = Currency::new(&code, scale as u8)
                .map_err(|e| StoreError::storage(format!("corrupt posting row: {e}")))?;
            postings.push(Posting {
                account_id: AccountId::from_uuid(row.try_get("account_id").map_err(read)?),
                amount: Money::new(row.try_get("amount_minor").map_err(read)?, currency),
                direction: parse_direction(&direction)?,
            });
        }

        let read_entry =
            |e: sqlx::Error| StoreError::storage(format!("corrupt entry row: {e}"));
        Ok(Some(JournalEntry {
            id: EntryId::from_uuid(entry_row.try_get("entry_id").map_err(read_entry)?),
            tenant_id: TenantId::from_uuid(entry_row.try_get("tenant_id").map_err(read_entry)?),
            narration: entry_row.try_get("narration").map_err(read_entry)?,
            postings,
            posted_at: entry_row.try_get("posted_at").map_err(read_entry)?,
            posted: true,
        }))
    }

    fn get_idempotency(
        &self,
        tenant_id: TenantId,
        request_key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let handle = runtime_handle()?;
        let row = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    SELECT tenant_id, request_key, status, result, created_at, updated_at
                    FROM idempotency
                    WHERE tenant_id = $1 AND request_key = $2
                    "#,
                )
                .bind(tenant_id.as_uuid())
                .bind(request_key)
                .fetch_optional(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("get_idempotency", e))?;

        row.map(|r| idempotency_from_row(&r)).transpose()
    }

    fn claim_ready_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let handle = runtime_handle()?;
        let lease_until = now + lease;

        // SKIP LOCKED keeps concurrent dispatchers from claiming the same
        // rows; the lease keeps them apart across polls.
        let rows = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    UPDATE outbox
                    SET next_attempt_at = $3
                    WHERE message_id IN (
                        SELECT message_id FROM outbox
                        WHERE status = 'pending'
                          AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                        ORDER BY created_at ASC
                        LIMIT $2
                        FOR UPDATE SKIP LOCKED
                    )
                    RETURNING message_id, tenant_id, topic, partition_key, headers,
                              payload, status, retry_count, created_at, published_at,
                              next_attempt_at, last_error
                    "#,
                )
                .bind(now)
                .bind(limit as i64)
                .bind(lease_until)
                .fetch_all(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("claim_ready_outbox", e))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let parsed = OutboxRow::from_row(&row)
                .map_err(|e| StoreError::storage(format!("corrupt outbox row: {e}")))?;
            messages.push(OutboxMessage::try_from(parsed)?);
        }
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    fn mark_outbox_published(
        &self,
        id: MessageId,
        published_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let handle = runtime_handle()?;
        let outcome = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    UPDATE outbox
                    SET status = 'published', published_at = $2,
                        next_attempt_at = NULL, last_error = NULL
                    WHERE message_id = $1
                    "#,
                )
                .bind(id.as_uuid())
                .bind(published_at)
                .execute(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("mark_outbox_published", e))?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("outbox message {id}")));
        }
        Ok(())
    }

    fn mark_outbox_retry(
        &self,
        id: MessageId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let handle = runtime_handle()?;
        let outcome = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    UPDATE outbox
                    SET retry_count = retry_count + 1, last_error = $2, next_attempt_at = $3
                    WHERE message_id = $1
                    "#,
                )
                .bind(id.as_uuid())
                .bind(error)
                .bind(next_attempt_at)
                .execute(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("mark_outbox_retry", e))?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("outbox message {id}")));
        }
        Ok(())
    }

    fn mark_outbox_failed(&self, id: MessageId, error: &str) -> Result<(), StoreError> {
        let handle = runtime_handle()?;
        let outcome = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    UPDATE outbox
                    SET status = 'failed', retry_count = retry_count + 1,
                        last_error = $2, next_attempt_at = NULL
                    WHERE message_id = $1
                    "#,
                )
                .bind(id.as_uuid())
                .bind(error)
                .execute(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("mark_outbox_failed", e))?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("outbox message {id}")));
        }
        Ok(())
    }

    fn prune_published_outbox(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let handle = runtime_handle()?;
        let outcome = handle
            .block_on(async {
                sqlx::query(
                    "DELETE FROM outbox WHERE status = 'published' AND published_at < $1",
                )
                .bind(older_than)
                .execute(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("prune_published_outbox", e))?;
        Ok(outcome.rows_affected() as usize)
    }

    fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        let handle = runtime_handle()?;
        let row = handle
            .block_on(async {
                sqlx::query(
                    r#"
                    SELECT message_id, tenant_id, topic, partition_key, headers,
                           payload, status, retry_count, created_at, published_at,
                           next_attempt_at, last_error
                    FROM outbox
                    WHERE message_id = $1
                    "#,
                )
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
            })
            .map_err(|e| map_sqlx_error("get_outbox_message", e))?;

        match row {
            Some(row) => {
                let parsed = OutboxRow::from_row(&row)
                    .map_err(|e| StoreError::storage(format!("corrupt outbox row: {e}")))?;
                Ok(Some(OutboxMessage::try_from(parsed)?))
            }
            None => Ok(None),
        }
    }
}
