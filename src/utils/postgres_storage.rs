//! PostgreSQL storage backend
//!
//! Every query is written once as a function generic over [`PgExecutor`], so
//! the same SQL runs on the pool (ambient) and inside a transaction.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | LedgerError |
//! |------------|----------|-------------|
//! | foreign key violation | `23503` | `ConstraintViolation` |
//! | unique violation | `23505` | `ConstraintViolation` |
//! | check violation | `23514` | `ConstraintViolation` |
//! | numeric value out of range | `22003` | `ConstraintViolation` |
//! | deadlock detected | `40P01` | `Transaction` |
//! | lock not available | `55P03` | `Transaction` |
//! | serialization failure | `40001` | `Transaction` |
//! | anything else | | `Storage` |

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgExecutor, Postgres, Row};
use std::time::Duration;

use crate::traits::*;
use crate::types::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id         BIGSERIAL PRIMARY KEY,
    owner      VARCHAR NOT NULL,
    balance    BIGINT NOT NULL,
    currency   VARCHAR NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT owner_currency_key UNIQUE (owner, currency)
);

CREATE INDEX IF NOT EXISTS accounts_owner_idx ON accounts (owner);

CREATE TABLE IF NOT EXISTS entries (
    id         BIGSERIAL PRIMARY KEY,
    account_id BIGINT NOT NULL REFERENCES accounts (id),
    amount     BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id);

CREATE TABLE IF NOT EXISTS transfers (
    id              BIGSERIAL PRIMARY KEY,
    from_account_id BIGINT NOT NULL REFERENCES accounts (id),
    to_account_id   BIGINT NOT NULL REFERENCES accounts (id),
    amount          BIGINT NOT NULL CHECK (amount > 0),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS transfers_from_account_id_idx ON transfers (from_account_id);
CREATE INDEX IF NOT EXISTS transfers_to_account_id_idx ON transfers (to_account_id);
"#;

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";

/// PostgreSQL-backed ledger storage
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Create storage on top of an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`
    ///
    /// With a `lock_timeout`, every pooled session sets Postgres'
    /// `lock_timeout` so that lock waits fail instead of blocking forever.
    pub async fn connect(database_url: &str, lock_timeout: Option<Duration>) -> LedgerResult<Self> {
        let mut options = PgPoolOptions::new().max_connections(16);

        if let Some(timeout) = lock_timeout {
            let statement = format!("SET lock_timeout = {}", timeout.as_millis());
            options = options.after_connect(move |conn, _meta| {
                let statement = statement.clone();
                Box::pin(async move {
                    sqlx::query(&statement).execute(conn).await?;
                    Ok(())
                })
            });
        }

        let pool = options
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        tracing::info!("connected to postgres");

        Ok(Self::new(pool))
    }

    /// Create the ledger tables if they do not exist yet
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStorage for PgStorage {
    type Conn = PgStorage;
    type Tx = PgTx;

    fn conn(&self) -> Self::Conn {
        self.clone()
    }

    async fn begin(&self) -> LedgerResult<Self::Tx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::Transaction(format!("failed to begin transaction: {}", e)))?;
        Ok(PgTx { tx })
    }
}

/// Open PostgreSQL transaction; sqlx rolls it back when dropped
pub struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl TxHandle for PgTx {
    async fn commit(self) -> LedgerResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| LedgerError::Transaction(format!("failed to commit: {}", e)))
    }

    async fn rollback(self) -> LedgerResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| LedgerError::Transaction(format!("failed to roll back: {}", e)))
    }
}

/// Implements [`Querier`] by forwarding to the shared query functions
macro_rules! impl_querier {
    ($ty:ty, |$this:ident| $executor:expr) => {
        #[async_trait]
        impl Querier for $ty {
            async fn create_account(&mut self, params: CreateAccountParams) -> LedgerResult<Account> {
                let $this = self;
                create_account($executor, params).await
            }

            async fn get_account(&mut self, id: i64) -> LedgerResult<Account> {
                let $this = self;
                get_account($executor, id, false).await
            }

            async fn get_account_for_update(&mut self, id: i64) -> LedgerResult<Account> {
                let $this = self;
                get_account($executor, id, true).await
            }

            async fn list_accounts(
                &mut self,
                params: ListAccountsParams,
            ) -> LedgerResult<Vec<Account>> {
                let $this = self;
                list_accounts($executor, params).await
            }

            async fn add_account_balance(
                &mut self,
                params: AddAccountBalanceParams,
            ) -> LedgerResult<Account> {
                let $this = self;
                add_account_balance($executor, params).await
            }

            async fn delete_account(&mut self, id: i64) -> LedgerResult<()> {
                let $this = self;
                delete_account($executor, id).await
            }

            async fn create_entry(&mut self, params: CreateEntryParams) -> LedgerResult<Entry> {
                let $this = self;
                create_entry($executor, params).await
            }

            async fn get_entry(&mut self, id: i64) -> LedgerResult<Entry> {
                let $this = self;
                get_entry($executor, id).await
            }

            async fn list_entries(&mut self, params: ListEntriesParams) -> LedgerResult<Vec<Entry>> {
                let $this = self;
                list_entries($executor, params).await
            }

            async fn create_transfer(
                &mut self,
                params: CreateTransferParams,
            ) -> LedgerResult<Transfer> {
                let $this = self;
                create_transfer($executor, params).await
            }

            async fn get_transfer(&mut self, id: i64) -> LedgerResult<Transfer> {
                let $this = self;
                get_transfer($executor, id).await
            }
        }
    };
}

impl_querier!(PgStorage, |this| &this.pool);
impl_querier!(PgTx, |this| &mut *this.tx);

async fn create_account<'e, E: PgExecutor<'e>>(
    executor: E,
    params: CreateAccountParams,
) -> LedgerResult<Account> {
    let row = sqlx::query(&format!(
        "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {}",
        ACCOUNT_COLUMNS
    ))
    .bind(&params.owner)
    .bind(params.balance)
    .bind(params.currency.code())
    .fetch_one(executor)
    .await
    .map_err(|e| map_sqlx_error("create_account", e))?;

    account_from_row(&row)
}

async fn get_account<'e, E: PgExecutor<'e>>(
    executor: E,
    id: i64,
    for_update: bool,
) -> LedgerResult<Account> {
    // NO KEY UPDATE does not conflict with the KEY SHARE locks taken by
    // foreign key checks on entries and transfers.
    let lock_clause = if for_update { " FOR NO KEY UPDATE" } else { "" };
    let row = sqlx::query(&format!(
        "SELECT {} FROM accounts WHERE id = $1{}",
        ACCOUNT_COLUMNS, lock_clause
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("get_account", e))?;

    match row {
        Some(row) => account_from_row(&row),
        None => Err(LedgerError::AccountNotFound(id)),
    }
}

async fn list_accounts<'e, E: PgExecutor<'e>>(
    executor: E,
    params: ListAccountsParams,
) -> LedgerResult<Vec<Account>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3",
        ACCOUNT_COLUMNS
    ))
    .bind(&params.owner)
    .bind(params.limit)
    .bind(params.offset)
    .fetch_all(executor)
    .await
    .map_err(|e| map_sqlx_error("list_accounts", e))?;

    rows.iter().map(account_from_row).collect()
}

async fn add_account_balance<'e, E: PgExecutor<'e>>(
    executor: E,
    params: AddAccountBalanceParams,
) -> LedgerResult<Account> {
    let row = sqlx::query(&format!(
        "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {}",
        ACCOUNT_COLUMNS
    ))
    .bind(params.amount)
    .bind(params.id)
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("add_account_balance", e))?;

    match row {
        Some(row) => account_from_row(&row),
        None => Err(LedgerError::AccountNotFound(params.id)),
    }
}

async fn delete_account<'e, E: PgExecutor<'e>>(executor: E, id: i64) -> LedgerResult<()> {
    let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await
        .map_err(|e| map_sqlx_error("delete_account", e))?;

    if result.rows_affected() == 0 {
        return Err(LedgerError::AccountNotFound(id));
    }
    Ok(())
}

async fn create_entry<'e, E: PgExecutor<'e>>(
    executor: E,
    params: CreateEntryParams,
) -> LedgerResult<Entry> {
    let row = sqlx::query(
        "INSERT INTO entries (account_id, amount) VALUES ($1, $2) \
         RETURNING id, account_id, amount, created_at",
    )
    .bind(params.account_id)
    .bind(params.amount)
    .fetch_one(executor)
    .await
    .map_err(|e| map_sqlx_error("create_entry", e))?;

    entry_from_row(&row)
}

async fn get_entry<'e, E: PgExecutor<'e>>(executor: E, id: i64) -> LedgerResult<Entry> {
    let row = sqlx::query("SELECT id, account_id, amount, created_at FROM entries WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error("get_entry", e))?;

    match row {
        Some(row) => entry_from_row(&row),
        None => Err(LedgerError::EntryNotFound(id)),
    }
}

async fn list_entries<'e, E: PgExecutor<'e>>(
    executor: E,
    params: ListEntriesParams,
) -> LedgerResult<Vec<Entry>> {
    let rows = sqlx::query(
        "SELECT id, account_id, amount, created_at FROM entries \
         WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3",
    )
    .bind(params.account_id)
    .bind(params.limit)
    .bind(params.offset)
    .fetch_all(executor)
    .await
    .map_err(|e| map_sqlx_error("list_entries", e))?;

    rows.iter().map(entry_from_row).collect()
}

async fn create_transfer<'e, E: PgExecutor<'e>>(
    executor: E,
    params: CreateTransferParams,
) -> LedgerResult<Transfer> {
    let row = sqlx::query(
        "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) \
         RETURNING id, from_account_id, to_account_id, amount, created_at",
    )
    .bind(params.from_account_id)
    .bind(params.to_account_id)
    .bind(params.amount)
    .fetch_one(executor)
    .await
    .map_err(|e| map_sqlx_error("create_transfer", e))?;

    transfer_from_row(&row)
}

async fn get_transfer<'e, E: PgExecutor<'e>>(executor: E, id: i64) -> LedgerResult<Transfer> {
    let row = sqlx::query(
        "SELECT id, from_account_id, to_account_id, amount, created_at FROM transfers WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("get_transfer", e))?;

    match row {
        Some(row) => transfer_from_row(&row),
        None => Err(LedgerError::TransferNotFound(id)),
    }
}

fn account_from_row(row: &PgRow) -> LedgerResult<Account> {
    let currency: String = row.try_get("currency")?;
    Ok(Account {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        balance: row.try_get("balance")?,
        currency: currency.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> LedgerResult<Entry> {
    Ok(Entry {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> LedgerResult<Transfer> {
    Ok(Transfer {
        id: row.try_get("id")?,
        from_account_id: row.try_get("from_account_id")?,
        to_account_id: row.try_get("to_account_id")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        map_sqlx_error("decode", err)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{} failed: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23503") | Some("23505") | Some("23514") | Some("22003") => {
                    LedgerError::ConstraintViolation(msg)
                }
                Some("40P01") | Some("55P03") | Some("40001") => LedgerError::Transaction(msg),
                _ => LedgerError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => LedgerError::Transaction(format!(
            "{} failed: no database connection available ({})",
            operation, err
        )),
        _ => LedgerError::Storage(format!("{} failed: {}", operation, err)),
    }
}
