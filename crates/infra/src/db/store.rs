//! Ledger Store: transaction executor and multi-statement workflows.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, instrument};

use simplebank_core::{AccountId, EntryId, TransferId};
use simplebank_ledger::{
    into_roles, ordered_adjustments, Account, CreateAccountParams, CreateUserParams,
    CreateVerifyEmailParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer, TransferMoneyParams, TransferMoneyResult, UpdateAccountParams, User, VerifyEmail,
};

use super::{Database, Queries, StoreError, StoreResult, TxHandle};

/// Entry point for all ledger reads and writes.
///
/// Cheap to clone; clones share the underlying database handle.
#[derive(Debug)]
pub struct LedgerStore<D> {
    db: Arc<D>,
}

impl<D> Clone for LedgerStore<D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}

impl<D: Database> LedgerStore<D> {
    pub fn new(db: D) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    /// Runs `f` inside one database transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`. If the
    /// rollback fails as well, both errors are returned in
    /// [`StoreError::RollbackFailed`]. Dropping the returned future before it
    /// completes drops the transaction, which rolls it back.
    ///
    /// ```ignore
    /// let id = store
    ///     .exec_tx(|q| Box::pin(async move {
    ///         let account = q.get_account_for_update(id).await?;
    ///         Ok(account.id)
    ///     }))
    ///     .await?;
    /// ```
    #[instrument(skip_all, err)]
    pub async fn exec_tx<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut D::Tx) -> BoxFuture<'c, StoreResult<T>> + Send,
    {
        let mut tx = self.db.begin().await?;

        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(cause) => match tx.rollback().await {
                Ok(()) => {
                    debug!(error = %cause, "transaction rolled back");
                    Err(cause)
                }
                Err(rollback) => {
                    error!(error = %cause, rollback_error = %rollback, "rollback failed");
                    Err(StoreError::RollbackFailed {
                        cause: Box::new(cause),
                        rollback: Box::new(rollback),
                    })
                }
            },
        }
    }

    /// Moves `amount` from one account to another.
    ///
    /// Writes the transfer record, a debit and a credit entry, and both
    /// balance changes in one transaction. Balances are always updated lower
    /// account id first so that concurrent transfers over the same pair of
    /// accounts, in either direction, cannot deadlock.
    #[instrument(
        skip(self),
        fields(
            from = %params.from_account_id,
            to = %params.to_account_id,
            amount = params.amount
        ),
        err
    )]
    pub async fn transfer_money(
        &self,
        params: TransferMoneyParams,
    ) -> StoreResult<TransferMoneyResult> {
        params.validate()?;

        self.exec_tx(move |q| {
            Box::pin(async move {
                let transfer = q.create_transfer(params.transfer_params()).await?;

                let [debit, credit] = params.entry_params();
                let from_entry = q.create_entry(debit).await?;
                let to_entry = q.create_entry(credit).await?;

                let [first, second] = ordered_adjustments(&params);
                let first = q.add_account_balance(first).await?;
                let second = q.add_account_balance(second).await?;
                let (from_account, to_account) = into_roles(&params, [first, second]);

                Ok(TransferMoneyResult {
                    transfer,
                    from_entry,
                    to_entry,
                    from_account,
                    to_account,
                })
            })
        })
        .await
    }

    /// Inserts a user and runs `after_create` in the same transaction.
    ///
    /// An error from `after_create` rolls the insert back and is returned as
    /// [`StoreError::AfterCreate`]. Side effects the callback already
    /// performed outside the database (such as enqueueing a task) are not
    /// undone.
    #[instrument(skip(self, params, after_create), fields(username = %params.username), err)]
    pub async fn create_user_with_side_effect<F, Fut>(
        &self,
        params: CreateUserParams,
        after_create: F,
    ) -> StoreResult<User>
    where
        F: FnOnce(User) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.exec_tx(move |q| {
            Box::pin(async move {
                let user = q.create_user(&params).await?;
                after_create(user.clone())
                    .await
                    .map_err(StoreError::AfterCreate)?;
                Ok(user)
            })
        })
        .await
    }

    pub async fn create_account(&self, params: &CreateAccountParams) -> StoreResult<Account> {
        let mut conn = self.db.acquire().await?;
        conn.create_account(params).await
    }

    pub async fn get_account(&self, id: AccountId) -> StoreResult<Account> {
        let mut conn = self.db.acquire().await?;
        conn.get_account(id).await
    }

    pub async fn list_accounts(&self, params: &ListAccountsParams) -> StoreResult<Vec<Account>> {
        params.validate()?;
        let mut conn = self.db.acquire().await?;
        conn.list_accounts(params).await
    }

    pub async fn update_account(&self, params: UpdateAccountParams) -> StoreResult<Account> {
        let mut conn = self.db.acquire().await?;
        conn.update_account(params).await
    }

    pub async fn delete_account(&self, id: AccountId) -> StoreResult<()> {
        let mut conn = self.db.acquire().await?;
        conn.delete_account(id).await
    }

    pub async fn get_entry(&self, id: EntryId) -> StoreResult<Entry> {
        let mut conn = self.db.acquire().await?;
        conn.get_entry(id).await
    }

    pub async fn list_entries(&self, params: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        params.validate()?;
        let mut conn = self.db.acquire().await?;
        conn.list_entries(params).await
    }

    pub async fn get_transfer(&self, id: TransferId) -> StoreResult<Transfer> {
        let mut conn = self.db.acquire().await?;
        conn.get_transfer(id).await
    }

    pub async fn list_transfers(&self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        params.validate()?;
        let mut conn = self.db.acquire().await?;
        conn.list_transfers(params).await
    }

    pub async fn create_user(&self, params: &CreateUserParams) -> StoreResult<User> {
        let mut conn = self.db.acquire().await?;
        conn.create_user(params).await
    }

    pub async fn get_user(&self, username: &str) -> StoreResult<User> {
        let mut conn = self.db.acquire().await?;
        conn.get_user(username).await
    }

    pub async fn create_verify_email(
        &self,
        params: &CreateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail> {
        let mut conn = self.db.acquire().await?;
        conn.create_verify_email(params).await
    }
}
