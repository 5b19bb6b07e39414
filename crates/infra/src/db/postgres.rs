//! Postgres-backed ledger database.
//!
//! [`PgQueries`] runs the single-statement queries over anything that derefs
//! to a `PgConnection`: a pooled connection ([`PgConn`], autocommit) or an
//! open transaction ([`PgTx`]). Every transaction starts with
//! `SET LOCAL lock_timeout` so a blocked row lock surfaces as a transient
//! error instead of hanging.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate username, email, or owner+currency |
//! | Database (foreign key violation) | `23503` | `InvalidReference` | Unknown account or owner |
//! | Database (check constraint violation) | `23514` | `Validation` | Non-positive transfer amount |
//! | Database (deadlock / serialization / lock timeout) | `40P01`, `40001`, `55P03` | `Transient` | Contention |
//! | Database (other) | Any other | `Database` | Other database errors |
//! | PoolTimedOut, PoolClosed, Io | N/A | `Transient` | Pool exhausted or connection lost |
//! | RowNotFound | N/A | `NotFound` | No row for the given key |
//! | Other | N/A | `Database` | Decode errors, protocol errors, etc. |

use std::ops::DerefMut;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument};

use simplebank_core::{AccountId, EntryId, TransferId, VerifyEmailId};
use simplebank_ledger::{
    Account, BalanceAdjustment, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    CreateUserParams, CreateVerifyEmailParams, Currency, Entry, ListAccountsParams,
    ListEntriesParams, ListTransfersParams, Transfer, UpdateAccountParams, User, VerifyEmail,
};

use super::{Database, Queries, StoreError, StoreResult, TxHandle};
use crate::config::DatabaseConfig;

/// Table definitions applied by [`PgDatabase::apply_schema`].
pub const SCHEMA: &str = include_str!("schema.sql");

/// Pooled connection accessor (autocommit).
pub type PgConn = PgQueries<PoolConnection<Postgres>>;

/// Transaction accessor.
pub type PgTx = PgQueries<Transaction<'static, Postgres>>;

/// Postgres database handle.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgDatabase {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Opens a pool sized per `config`.
    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        info!("connected to postgres");
        Ok(Self::new(pool, config.lock_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates missing tables and indexes.
    #[instrument(skip(self), err)]
    pub async fn apply_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Conn = PgConn;
    type Tx = PgTx;

    async fn acquire(&self) -> StoreResult<PgConn> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        Ok(PgQueries::new(conn))
    }

    async fn begin(&self) -> StoreResult<PgTx> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // SET does not take bind parameters; the value is a plain integer.
        let set_timeout = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        );
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(PgQueries::new(tx))
    }
}

/// Query set over a single Postgres connection.
#[derive(Debug)]
pub struct PgQueries<C> {
    conn: C,
}

impl<C> PgQueries<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<C> Queries for PgQueries<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn create_account(&mut self, params: &CreateAccountParams) -> StoreResult<Account> {
        let row = sqlx::query(
            r#"
            INSERT INTO accounts (owner, balance, currency)
            VALUES ($1, $2, $3)
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(&params.owner)
        .bind(params.balance)
        .bind(params.currency.as_str())
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_account", e))?;
        decode::<AccountRow, _>(&row, "create_account")
    }

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account> {
        let row = sqlx::query(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("get_account", e))?;
        decode::<AccountRow, _>(&row, "get_account")
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> StoreResult<Account> {
        // NO KEY UPDATE does not conflict with the KEY SHARE lock taken by
        // inserting entries that reference the account.
        let row = sqlx::query(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts
            WHERE id = $1
            LIMIT 1
            FOR NO KEY UPDATE
            "#,
        )
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("get_account_for_update", e))?;
        decode::<AccountRow, _>(&row, "get_account_for_update")
    }

    async fn list_accounts(&mut self, params: &ListAccountsParams) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts
            WHERE owner = $1
            ORDER BY id
            LIMIT $2
            OFFSET $3
            "#,
        )
        .bind(&params.owner)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("list_accounts", e))?;
        decode_all::<AccountRow, _>(&rows, "list_accounts")
    }

    async fn update_account(&mut self, params: UpdateAccountParams) -> StoreResult<Account> {
        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $2
            WHERE id = $1
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(params.id.get())
        .bind(params.balance)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("update_account", e))?;
        decode::<AccountRow, _>(&row, "update_account")
    }

    async fn add_account_balance(
        &mut self,
        adjustment: BalanceAdjustment,
    ) -> StoreResult<Account> {
        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + $1
            WHERE id = $2
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(adjustment.amount)
        .bind(adjustment.account_id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("add_account_balance", e))?;
        decode::<AccountRow, _>(&row, "add_account_balance")
    }

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("delete_account", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("account {id}")));
        }
        Ok(())
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry> {
        let row = sqlx::query(
            r#"
            INSERT INTO entries (account_id, amount)
            VALUES ($1, $2)
            RETURNING id, account_id, amount, created_at
            "#,
        )
        .bind(params.account_id.get())
        .bind(params.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_entry", e))?;
        decode::<EntryRow, _>(&row, "create_entry")
    }

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, amount, created_at
            FROM entries
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("get_entry", e))?;
        decode::<EntryRow, _>(&row, "get_entry")
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, amount, created_at
            FROM entries
            WHERE account_id = $1
            ORDER BY id
            LIMIT $2
            OFFSET $3
            "#,
        )
        .bind(params.account_id.get())
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("list_entries", e))?;
        decode_all::<EntryRow, _>(&rows, "list_entries")
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> StoreResult<Transfer> {
        let row = sqlx::query(
            r#"
            INSERT INTO transfers (from_account_id, to_account_id, amount)
            VALUES ($1, $2, $3)
            RETURNING id, from_account_id, to_account_id, amount, created_at
            "#,
        )
        .bind(params.from_account_id.get())
        .bind(params.to_account_id.get())
        .bind(params.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_transfer", e))?;
        decode::<TransferRow, _>(&row, "create_transfer")
    }

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer> {
        let row = sqlx::query(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("get_transfer", e))?;
        decode::<TransferRow, _>(&row, "get_transfer")
    }

    async fn list_transfers(&mut self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        let rows = sqlx::query(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers
            WHERE from_account_id = $1 OR to_account_id = $2
            ORDER BY id
            LIMIT $3
            OFFSET $4
            "#,
        )
        .bind(params.from_account_id.get())
        .bind(params.to_account_id.get())
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("list_transfers", e))?;
        decode_all::<TransferRow, _>(&rows, "list_transfers")
    }

    async fn create_user(&mut self, params: &CreateUserParams) -> StoreResult<User> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (username, hashed_password, full_name, email)
            VALUES ($1, $2, $3, $4)
            RETURNING username, hashed_password, full_name, email, password_changed_at, created_at
            "#,
        )
        .bind(&params.username)
        .bind(&params.hashed_password)
        .bind(&params.full_name)
        .bind(&params.email)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_user", e))?;
        decode::<UserRow, _>(&row, "create_user")
    }

    async fn get_user(&mut self, username: &str) -> StoreResult<User> {
        let row = sqlx::query(
            r#"
            SELECT username, hashed_password, full_name, email, password_changed_at, created_at
            FROM users
            WHERE username = $1
            LIMIT 1
            "#,
        )
        .bind(username)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("get_user", e))?;
        decode::<UserRow, _>(&row, "get_user")
    }

    async fn create_verify_email(
        &mut self,
        params: &CreateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail> {
        let row = sqlx::query(
            r#"
            INSERT INTO verify_emails (username, email, secret_code)
            VALUES ($1, $2, $3)
            RETURNING id, username, email, secret_code, is_used, created_at, expired_at
            "#,
        )
        .bind(&params.username)
        .bind(&params.email)
        .bind(&params.secret_code)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_verify_email", e))?;
        decode::<VerifyEmailRow, _>(&row, "create_verify_email")
    }
}

#[async_trait]
impl TxHandle for PgTx {
    async fn commit(self) -> StoreResult<()> {
        self.conn
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> StoreResult<()> {
        self.conn
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{} in {}", db_err.message(), operation);
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::InvalidReference(msg),
                Some("23514") => StoreError::Validation(msg),
                // deadlock_detected, serialization_failure, lock_not_available
                Some("40P01") | Some("40001") | Some("55P03") => StoreError::Transient(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("no rows in {operation}")),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Transient(format!("connection error in {operation}: {err}"))
        }
        _ => StoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}

fn decode<R, T>(row: &PgRow, operation: &str) -> StoreResult<T>
where
    R: for<'r> FromRow<'r, PgRow> + Into<T>,
{
    R::from_row(row)
        .map(Into::into)
        .map_err(|e| StoreError::Database(format!("failed to decode row in {operation}: {e}")))
}

fn decode_all<R, T>(rows: &[PgRow], operation: &str) -> StoreResult<Vec<T>>
where
    R: for<'r> FromRow<'r, PgRow> + Into<T>,
{
    rows.iter().map(|row| decode::<R, T>(row, operation)).collect()
}

// SQLx row types

#[derive(Debug)]
struct AccountRow {
    id: i64,
    owner: String,
    balance: i64,
    currency: Currency,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let currency: String = row.try_get("currency")?;
        Ok(AccountRow {
            id: row.try_get("id")?,
            owner: row.try_get("owner")?,
            balance: row.try_get("balance")?,
            currency: currency
                .parse()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: AccountId::new(row.id),
            owner: row.owner,
            balance: row.balance,
            currency: row.currency,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug)]
struct EntryRow {
    id: i64,
    account_id: i64,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EntryRow {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            amount: row.try_get("amount")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<EntryRow> for Entry {
    fn from(row: EntryRow) -> Self {
        Entry {
            id: EntryId::new(row.id),
            account_id: AccountId::new(row.account_id),
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug)]
struct TransferRow {
    id: i64,
    from_account_id: i64,
    to_account_id: i64,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TransferRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransferRow {
            id: row.try_get("id")?,
            from_account_id: row.try_get("from_account_id")?,
            to_account_id: row.try_get("to_account_id")?,
            amount: row.try_get("amount")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<TransferRow> for Transfer {
    fn from(row: TransferRow) -> Self {
        Transfer {
            id: TransferId::new(row.id),
            from_account_id: AccountId::new(row.from_account_id),
            to_account_id: AccountId::new(row.to_account_id),
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug)]
struct UserRow {
    username: String,
    hashed_password: String,
    full_name: String,
    email: String,
    password_changed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for UserRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(UserRow {
            username: row.try_get("username")?,
            hashed_password: row.try_get("hashed_password")?,
            full_name: row.try_get("full_name")?,
            email: row.try_get("email")?,
            password_changed_at: row.try_get("password_changed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            username: row.username,
            hashed_password: row.hashed_password,
            full_name: row.full_name,
            email: row.email,
            password_changed_at: row.password_changed_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug)]
struct VerifyEmailRow {
    id: i64,
    username: String,
    email: String,
    secret_code: String,
    is_used: bool,
    created_at: DateTime<Utc>,
    expired_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for VerifyEmailRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(VerifyEmailRow {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            secret_code: row.try_get("secret_code")?,
            is_used: row.try_get("is_used")?,
            created_at: row.try_get("created_at")?,
            expired_at: row.try_get("expired_at")?,
        })
    }
}

impl From<VerifyEmailRow> for VerifyEmail {
    fn from(row: VerifyEmailRow) -> Self {
        VerifyEmail {
            id: VerifyEmailId::new(row.id),
            username: row.username,
            email: row.email,
            secret_code: row.secret_code,
            is_used: row.is_used,
            created_at: row.created_at,
            expired_at: row.expired_at,
        }
    }
}
