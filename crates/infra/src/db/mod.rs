//! Ledger persistence: data-access interface, backends, and workflows.
//!
//! ## Layers
//!
//! - [`Queries`]: the narrow single-statement interface (CRUD plus the
//!   balance-adjustment statement). Implemented by every backend for both
//!   plain connections and open transactions.
//! - [`TxHandle`]: a [`Queries`] accessor bound to an open transaction.
//! - [`Database`]: hands out base accessors (`acquire`) and transaction
//!   accessors (`begin`).
//! - [`LedgerStore`]: the Transaction Executor plus the multi-statement
//!   workflows (`transfer_money`, `create_user_with_side_effect`).
//!
//! ## Backends
//!
//! - [`postgres::PgDatabase`]: sqlx over a `PgPool`.
//! - [`in_memory::InMemoryDatabase`]: read-committed store with per-row locks
//!   for tests and local development.

use async_trait::async_trait;

use simplebank_core::{AccountId, DomainError, EntryId, TransferId};
use simplebank_ledger::{
    Account, BalanceAdjustment, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    CreateUserParams, CreateVerifyEmailParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, UpdateAccountParams, User, VerifyEmail,
};

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::{InMemoryDatabase, InMemorySession};
pub use postgres::{PgConn, PgDatabase, PgQueries, PgTx};
pub use store::LedgerStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Ledger store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Rejected input; nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unique constraint violation (duplicate username, email, owner+currency).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Foreign-key violation (e.g. unknown account or owner).
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Lock timeout, deadlock, serialization failure, or lost connection.
    /// Safe for the caller to retry the whole workflow.
    #[error("transient store error: {0}")]
    Transient(String),

    /// The unit of work failed and the rollback failed too.
    #[error("tx err: {cause}, rb err: {rollback}")]
    RollbackFailed {
        cause: Box<StoreError>,
        rollback: Box<StoreError>,
    },

    /// The post-insert callback of `create_user_with_side_effect` failed.
    #[error("after-create callback failed: {0:#}")]
    AfterCreate(anyhow::Error),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Rollback failures leave the connection in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::RollbackFailed { .. })
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                StoreError::Validation(msg)
            }
            DomainError::InvariantViolation(msg) => StoreError::Database(msg),
        }
    }
}

/// Single-statement data access.
///
/// Each call is one SQL statement (or its in-memory equivalent). Whether it
/// commits on its own depends on the accessor: base accessors autocommit,
/// transaction accessors defer to [`TxHandle::commit`].
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, params: &CreateAccountParams) -> StoreResult<Account>;

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account>;

    /// Reads the account and holds its row lock until the transaction ends.
    async fn get_account_for_update(&mut self, id: AccountId) -> StoreResult<Account>;

    async fn list_accounts(&mut self, params: &ListAccountsParams) -> StoreResult<Vec<Account>>;

    async fn update_account(&mut self, params: UpdateAccountParams) -> StoreResult<Account>;

    /// `balance = balance + amount` in one statement. Locks the row.
    async fn add_account_balance(&mut self, adjustment: BalanceAdjustment)
    -> StoreResult<Account>;

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()>;

    async fn create_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry>;

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry>;

    async fn list_entries(&mut self, params: ListEntriesParams) -> StoreResult<Vec<Entry>>;

    async fn create_transfer(&mut self, params: CreateTransferParams) -> StoreResult<Transfer>;

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer>;

    /// Transfers leaving `from_account_id` or arriving at `to_account_id`.
    async fn list_transfers(&mut self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>>;

    async fn create_user(&mut self, params: &CreateUserParams) -> StoreResult<User>;

    async fn get_user(&mut self, username: &str) -> StoreResult<User>;

    async fn create_verify_email(
        &mut self,
        params: &CreateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail>;
}

/// Accessor bound to an open transaction.
///
/// Dropping the handle without calling either method rolls back.
#[async_trait]
pub trait TxHandle: Queries + Sized {
    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// Source of base and transaction-scoped accessors.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Base accessor (pooled connection, autocommit).
    type Conn: Queries + 'static;

    /// Transaction accessor.
    type Tx: TxHandle + 'static;

    async fn acquire(&self) -> StoreResult<Self::Conn>;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}
