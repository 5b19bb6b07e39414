//! In-memory ledger database for tests/dev.
//!
//! Mirrors the Postgres behaviour the workflows rely on:
//!
//! - **Read committed**: a transaction sees committed rows plus its own
//!   uncommitted changes; its changes become visible to others at commit.
//! - **Row locks**: balance updates (and `get_account_for_update`) lock the
//!   account row until commit/rollback. Waiting longer than the lock timeout
//!   fails with [`StoreError::Transient`], like `lock_timeout` in Postgres.
//! - **Constraints**: unique keys (username, email, owner+currency) and
//!   foreign keys are checked on insert; unique keys again at commit.
//! - **Sequences**: ids are never reused, rolled-back inserts leave gaps.
//!
//! Dropping a session without committing discards its changes and releases
//! its locks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use simplebank_core::{AccountId, Entity, EntryId, TransferId, VerifyEmailId};
use simplebank_ledger::{
    Account, BalanceAdjustment, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    CreateUserParams, CreateVerifyEmailParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, UpdateAccountParams, User, VerifyEmail,
    VERIFY_EMAIL_TTL_MINUTES,
};

use super::{Database, Queries, StoreError, StoreResult, TxHandle};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory database shared by all sessions created from it.
#[derive(Debug, Clone)]
pub struct InMemoryDatabase {
    shared: Arc<Shared>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                sequences: Sequences::default(),
                lock_timeout,
                fail_next_rollback: AtomicBool::new(false),
            }),
        }
    }

    /// Makes the next rollback report a failure (its changes are still
    /// discarded). Lets callers exercise rollback error reporting.
    pub fn fail_next_rollback(&self) {
        self.shared.fail_next_rollback.store(true, Ordering::SeqCst);
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    type Conn = InMemorySession;
    type Tx = InMemorySession;

    async fn acquire(&self) -> StoreResult<InMemorySession> {
        Ok(InMemorySession::new(Arc::clone(&self.shared), true))
    }

    async fn begin(&self) -> StoreResult<InMemorySession> {
        Ok(InMemorySession::new(Arc::clone(&self.shared), false))
    }
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
    sequences: Sequences,
    lock_timeout: Duration,
    fail_next_rollback: AtomicBool,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, id: AccountId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }

    /// Publishes a change set. Unique keys are re-checked against rows other
    /// transactions committed in the meantime.
    fn apply(&self, changes: Changes) -> StoreResult<()> {
        let mut tables = self.tables();
        changes.check_unique(&tables)?;
        changes.apply_to(&mut tables);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Sequences {
    accounts: AtomicI64,
    entries: AtomicI64,
    transfers: AtomicI64,
    verify_emails: AtomicI64,
}

fn next_val(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Debug)]
struct Table<E: Entity> {
    rows: BTreeMap<E::Id, E>,
}

impl<E: Entity> Default for Table<E> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

/// Uncommitted changes to one table.
#[derive(Debug)]
struct Overlay<E: Entity> {
    upserts: BTreeMap<E::Id, E>,
    deletes: BTreeSet<E::Id>,
}

impl<E: Entity> Default for Overlay<E> {
    fn default() -> Self {
        Self {
            upserts: BTreeMap::new(),
            deletes: BTreeSet::new(),
        }
    }
}

impl<E: Entity + Clone> Overlay<E> {
    fn get(&self, base: &Table<E>, id: &E::Id) -> Option<E> {
        if self.deletes.contains(id) {
            return None;
        }
        self.upserts.get(id).or_else(|| base.rows.get(id)).cloned()
    }

    /// Rows visible to the owning session (unordered).
    fn visible<'a>(&'a self, base: &'a Table<E>) -> impl Iterator<Item = &'a E> + 'a {
        base.rows
            .iter()
            .filter(move |(id, _)| !self.deletes.contains(*id) && !self.upserts.contains_key(*id))
            .map(|(_, row)| row)
            .chain(self.upserts.values())
    }

    fn put(&mut self, row: E) {
        let id = row.id().clone();
        self.deletes.remove(&id);
        self.upserts.insert(id, row);
    }

    fn delete(&mut self, id: E::Id) {
        self.upserts.remove(&id);
        self.deletes.insert(id);
    }

    /// Rows this overlay inserts (as opposed to updates).
    fn inserted<'a>(&'a self, base: &'a Table<E>) -> impl Iterator<Item = &'a E> + 'a {
        self.upserts
            .iter()
            .filter(move |(id, _)| !base.rows.contains_key(*id))
            .map(|(_, row)| row)
    }

    fn apply_to(self, base: &mut Table<E>) {
        for id in self.deletes {
            base.rows.remove(&id);
        }
        base.rows.extend(self.upserts);
    }
}

#[derive(Debug, Default)]
struct Tables {
    users: Table<User>,
    accounts: Table<Account>,
    entries: Table<Entry>,
    transfers: Table<Transfer>,
    verify_emails: Table<VerifyEmail>,
}

#[derive(Debug, Default)]
struct Changes {
    users: Overlay<User>,
    accounts: Overlay<Account>,
    entries: Overlay<Entry>,
    transfers: Overlay<Transfer>,
    verify_emails: Overlay<VerifyEmail>,
}

impl Changes {
    fn check_unique(&self, tables: &Tables) -> StoreResult<()> {
        // Users are never updated, so every pending user row is an insert.
        for user in self.users.upserts.values() {
            if tables.users.rows.contains_key(&user.username) {
                return Err(StoreError::Conflict(format!(
                    "username {} is already taken",
                    user.username
                )));
            }
            if tables.users.rows.values().any(|u| u.email == user.email) {
                return Err(duplicate_email(&user.email));
            }
        }
        for account in self.accounts.inserted(&tables.accounts) {
            if tables
                .accounts
                .rows
                .values()
                .any(|a| a.owner == account.owner && a.currency == account.currency)
            {
                return Err(duplicate_account(account));
            }
        }
        Ok(())
    }

    fn apply_to(self, tables: &mut Tables) {
        self.users.apply_to(&mut tables.users);
        self.accounts.apply_to(&mut tables.accounts);
        self.entries.apply_to(&mut tables.entries);
        self.transfers.apply_to(&mut tables.transfers);
        self.verify_emails.apply_to(&mut tables.verify_emails);
    }
}

fn duplicate_email(email: &str) -> StoreError {
    StoreError::Conflict(format!("email {email} is already registered"))
}

fn duplicate_account(account: &Account) -> StoreError {
    StoreError::Conflict(format!(
        "owner {} already has a {} account",
        account.owner, account.currency
    ))
}

fn page<T>(rows: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    rows.into_iter().skip(offset).take(limit).collect()
}

/// A connection to an [`InMemoryDatabase`].
///
/// Sessions from [`Database::begin`] buffer their changes until commit.
/// Sessions from [`Database::acquire`] autocommit every statement.
#[derive(Debug)]
pub struct InMemorySession {
    shared: Arc<Shared>,
    changes: Changes,
    locks: HashMap<AccountId, OwnedMutexGuard<()>>,
    autocommit: bool,
}

impl InMemorySession {
    fn new(shared: Arc<Shared>, autocommit: bool) -> Self {
        Self {
            shared,
            changes: Changes::default(),
            locks: HashMap::new(),
            autocommit,
        }
    }

    /// Takes the row lock for `id` unless this session already holds it.
    async fn lock_row(&mut self, id: AccountId) -> StoreResult<()> {
        if self.locks.contains_key(&id) {
            return Ok(());
        }
        let mutex = self.shared.row_lock(id);
        match tokio::time::timeout(self.shared.lock_timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                self.locks.insert(id, guard);
                Ok(())
            }
            Err(_) => Err(StoreError::Transient(format!(
                "lock timeout waiting for account {id}"
            ))),
        }
    }

    /// Ends a statement. In autocommit mode this publishes the statement's
    /// changes (or discards them on error) and releases its locks.
    fn finish<T>(&mut self, result: StoreResult<T>) -> StoreResult<T> {
        if !self.autocommit {
            return result;
        }
        let changes = std::mem::take(&mut self.changes);
        let result = match result {
            Ok(value) => self.shared.apply(changes).map(|()| value),
            Err(err) => Err(err),
        };
        self.locks.clear();
        result
    }

    fn account(&self, id: AccountId) -> StoreResult<Account> {
        let tables = self.shared.tables();
        self.changes
            .accounts
            .get(&tables.accounts, &id)
            .ok_or_else(|| StoreError::NotFound(format!("account {id}")))
    }

    fn ensure_account(&self, tables: &Tables, id: AccountId) -> StoreResult<()> {
        match self.changes.accounts.get(&tables.accounts, &id) {
            Some(_) => Ok(()),
            None => Err(StoreError::InvalidReference(format!(
                "account {id} does not exist"
            ))),
        }
    }

    fn ensure_user(&self, tables: &Tables, username: &str) -> StoreResult<()> {
        match self.changes.users.get(&tables.users, &username.to_string()) {
            Some(_) => Ok(()),
            None => Err(StoreError::InvalidReference(format!(
                "user {username} does not exist"
            ))),
        }
    }

    fn insert_account(&mut self, params: &CreateAccountParams) -> StoreResult<Account> {
        {
            let tables = self.shared.tables();
            self.ensure_user(&tables, &params.owner)?;
            let duplicate = self
                .changes
                .accounts
                .visible(&tables.accounts)
                .any(|a| a.owner == params.owner && a.currency == params.currency);
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "owner {} already has a {} account",
                    params.owner, params.currency
                )));
            }
        }

        let account = Account {
            id: AccountId::new(next_val(&self.shared.sequences.accounts)),
            owner: params.owner.clone(),
            balance: params.balance,
            currency: params.currency,
            created_at: Utc::now(),
        };
        self.changes.accounts.put(account.clone());
        Ok(account)
    }

    fn select_accounts(&self, params: &ListAccountsParams) -> Vec<Account> {
        let tables = self.shared.tables();
        let mut rows: Vec<Account> = self
            .changes
            .accounts
            .visible(&tables.accounts)
            .filter(|a| a.owner == params.owner)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.id);
        page(rows, params.limit, params.offset)
    }

    fn remove_account(&mut self, id: AccountId) -> StoreResult<()> {
        {
            let tables = self.shared.tables();
            if self.changes.accounts.get(&tables.accounts, &id).is_none() {
                return Err(StoreError::NotFound(format!("account {id}")));
            }
            let referenced = self
                .changes
                .entries
                .visible(&tables.entries)
                .any(|e| e.account_id == id)
                || self
                    .changes
                    .transfers
                    .visible(&tables.transfers)
                    .any(|t| t.from_account_id == id || t.to_account_id == id);
            if referenced {
                return Err(StoreError::InvalidReference(format!(
                    "account {id} is still referenced by entries or transfers"
                )));
            }
        }
        self.changes.accounts.delete(id);
        Ok(())
    }

    fn insert_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry> {
        {
            let tables = self.shared.tables();
            self.ensure_account(&tables, params.account_id)?;
        }
        let entry = Entry {
            id: EntryId::new(next_val(&self.shared.sequences.entries)),
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.changes.entries.put(entry.clone());
        Ok(entry)
    }

    fn entry(&self, id: EntryId) -> StoreResult<Entry> {
        let tables = self.shared.tables();
        self.changes
            .entries
            .get(&tables.entries, &id)
            .ok_or_else(|| StoreError::NotFound(format!("entry {id}")))
    }

    fn select_entries(&self, params: ListEntriesParams) -> Vec<Entry> {
        let tables = self.shared.tables();
        let mut rows: Vec<Entry> = self
            .changes
            .entries
            .visible(&tables.entries)
            .filter(|e| e.account_id == params.account_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.id);
        page(rows, params.limit, params.offset)
    }

    fn insert_transfer(&mut self, params: CreateTransferParams) -> StoreResult<Transfer> {
        if params.amount <= 0 {
            return Err(StoreError::Validation(
                "transfer amount must be positive".to_string(),
            ));
        }
        {
            let tables = self.shared.tables();
            self.ensure_account(&tables, params.from_account_id)?;
            self.ensure_account(&tables, params.to_account_id)?;
        }
        let transfer = Transfer {
            id: TransferId::new(next_val(&self.shared.sequences.transfers)),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.changes.transfers.put(transfer.clone());
        Ok(transfer)
    }

    fn transfer(&self, id: TransferId) -> StoreResult<Transfer> {
        let tables = self.shared.tables();
        self.changes
            .transfers
            .get(&tables.transfers, &id)
            .ok_or_else(|| StoreError::NotFound(format!("transfer {id}")))
    }

    fn select_transfers(&self, params: ListTransfersParams) -> Vec<Transfer> {
        let tables = self.shared.tables();
        let mut rows: Vec<Transfer> = self
            .changes
            .transfers
            .visible(&tables.transfers)
            .filter(|t| {
                t.from_account_id == params.from_account_id
                    || t.to_account_id == params.to_account_id
            })
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.id);
        page(rows, params.limit, params.offset)
    }

    fn insert_user(&mut self, params: &CreateUserParams) -> StoreResult<User> {
        {
            let tables = self.shared.tables();
            if self
                .changes
                .users
                .get(&tables.users, &params.username)
                .is_some()
            {
                return Err(StoreError::Conflict(format!(
                    "username {} is already taken",
                    params.username
                )));
            }
            if self
                .changes
                .users
                .visible(&tables.users)
                .any(|u| u.email == params.email)
            {
                return Err(duplicate_email(&params.email));
            }
        }
        let user = User {
            username: params.username.clone(),
            hashed_password: params.hashed_password.clone(),
            full_name: params.full_name.clone(),
            email: params.email.clone(),
            password_changed_at: DateTime::<Utc>::default(),
            created_at: Utc::now(),
        };
        self.changes.users.put(user.clone());
        Ok(user)
    }

    fn user(&self, username: &str) -> StoreResult<User> {
        let tables = self.shared.tables();
        self.changes
            .users
            .get(&tables.users, &username.to_string())
            .ok_or_else(|| StoreError::NotFound(format!("user {username}")))
    }

    fn insert_verify_email(&mut self, params: &CreateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        {
            let tables = self.shared.tables();
            self.ensure_user(&tables, &params.username)?;
        }
        let now = Utc::now();
        let row = VerifyEmail {
            id: VerifyEmailId::new(next_val(&self.shared.sequences.verify_emails)),
            username: params.username.clone(),
            email: params.email.clone(),
            secret_code: params.secret_code.clone(),
            is_used: false,
            created_at: now,
            expired_at: now + chrono::Duration::minutes(VERIFY_EMAIL_TTL_MINUTES),
        };
        self.changes.verify_emails.put(row.clone());
        Ok(row)
    }

    async fn adjust_balance(&mut self, adjustment: BalanceAdjustment) -> StoreResult<Account> {
        self.lock_row(adjustment.account_id).await?;
        let mut account = self.account(adjustment.account_id)?;
        account.apply(&adjustment)?;
        self.changes.accounts.put(account.clone());
        Ok(account)
    }

    async fn overwrite_balance(&mut self, params: UpdateAccountParams) -> StoreResult<Account> {
        self.lock_row(params.id).await?;
        let mut account = self.account(params.id)?;
        account.balance = params.balance;
        self.changes.accounts.put(account.clone());
        Ok(account)
    }
}

#[async_trait]
impl Queries for InMemorySession {
    async fn create_account(&mut self, params: &CreateAccountParams) -> StoreResult<Account> {
        let result = self.insert_account(params);
        self.finish(result)
    }

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account> {
        let result = self.account(id);
        self.finish(result)
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> StoreResult<Account> {
        let result = match self.lock_row(id).await {
            Ok(()) => self.account(id),
            Err(err) => Err(err),
        };
        self.finish(result)
    }

    async fn list_accounts(&mut self, params: &ListAccountsParams) -> StoreResult<Vec<Account>> {
        Ok(self.select_accounts(params))
    }

    async fn update_account(&mut self, params: UpdateAccountParams) -> StoreResult<Account> {
        let result = self.overwrite_balance(params).await;
        self.finish(result)
    }

    async fn add_account_balance(
        &mut self,
        adjustment: BalanceAdjustment,
    ) -> StoreResult<Account> {
        let result = self.adjust_balance(adjustment).await;
        self.finish(result)
    }

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        let result = match self.lock_row(id).await {
            Ok(()) => self.remove_account(id),
            Err(err) => Err(err),
        };
        self.finish(result)
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry> {
        let result = self.insert_entry(params);
        self.finish(result)
    }

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry> {
        self.entry(id)
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        Ok(self.select_entries(params))
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> StoreResult<Transfer> {
        let result = self.insert_transfer(params);
        self.finish(result)
    }

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer> {
        self.transfer(id)
    }

    async fn list_transfers(&mut self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        Ok(self.select_transfers(params))
    }

    async fn create_user(&mut self, params: &CreateUserParams) -> StoreResult<User> {
        let result = self.insert_user(params);
        self.finish(result)
    }

    async fn get_user(&mut self, username: &str) -> StoreResult<User> {
        self.user(username)
    }

    async fn create_verify_email(
        &mut self,
        params: &CreateVerifyEmailParams,
    ) -> StoreResult<VerifyEmail> {
        let result = self.insert_verify_email(params);
        self.finish(result)
    }
}

#[async_trait]
impl TxHandle for InMemorySession {
    async fn commit(mut self) -> StoreResult<()> {
        let changes = std::mem::take(&mut self.changes);
        self.shared.apply(changes)
    }

    async fn rollback(self) -> StoreResult<()> {
        if self.shared.fail_next_rollback.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database(
                "rollback failed: connection reset".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simplebank_ledger::Currency;

    fn user_params(name: &str) -> CreateUserParams {
        CreateUserParams {
            username: name.to_string(),
            hashed_password: "hash".to_string(),
            full_name: name.to_string(),
            email: format!("{name}@example.com"),
        }
    }

    async fn with_account(db: &InMemoryDatabase, owner: &str, balance: i64) -> Account {
        let mut conn = db.acquire().await.unwrap();
        conn.create_user(&user_params(owner)).await.unwrap();
        conn.create_account(&CreateAccountParams {
            owner: owner.to_string(),
            balance,
            currency: Currency::Usd,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn uncommitted_changes_are_invisible_to_other_sessions() {
        let db = InMemoryDatabase::new();
        let account = with_account(&db, "alice", 100).await;

        let mut tx = db.begin().await.unwrap();
        tx.add_account_balance(BalanceAdjustment {
            account_id: account.id,
            amount: 25,
        })
        .await
        .unwrap();
        assert_eq!(tx.get_account(account.id).await.unwrap().balance, 125);

        let mut other = db.acquire().await.unwrap();
        assert_eq!(other.get_account(account.id).await.unwrap().balance, 100);

        tx.commit().await.unwrap();
        assert_eq!(other.get_account(account.id).await.unwrap().balance, 125);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_changes_and_releases_locks() {
        let db = InMemoryDatabase::with_lock_timeout(Duration::from_millis(100));
        let account = with_account(&db, "alice", 100).await;

        {
            let mut tx = db.begin().await.unwrap();
            tx.add_account_balance(BalanceAdjustment {
                account_id: account.id,
                amount: -40,
            })
            .await
            .unwrap();
        }

        let mut tx = db.begin().await.unwrap();
        let locked = tx.get_account_for_update(account.id).await.unwrap();
        assert_eq!(locked.balance, 100);
    }

    #[tokio::test]
    async fn waiting_on_a_held_row_lock_times_out_as_transient() {
        let db = InMemoryDatabase::with_lock_timeout(Duration::from_millis(50));
        let account = with_account(&db, "alice", 100).await;

        let mut holder = db.begin().await.unwrap();
        holder.get_account_for_update(account.id).await.unwrap();

        let mut waiter = db.begin().await.unwrap();
        let err = waiter
            .add_account_balance(BalanceAdjustment {
                account_id: account.id,
                amount: 1,
            })
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");

        holder.rollback().await.unwrap();
        waiter
            .add_account_balance(BalanceAdjustment {
                account_id: account.id,
                amount: 1,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let db = InMemoryDatabase::new();
        let mut conn = db.acquire().await.unwrap();

        let err = conn
            .create_account(&CreateAccountParams {
                owner: "ghost".into(),
                balance: 0,
                currency: Currency::Eur,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidReference(_)));

        let err = conn
            .create_entry(CreateEntryParams {
                account_id: AccountId::new(42),
                amount: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn unique_keys_are_enforced_on_insert_and_commit() {
        let db = InMemoryDatabase::new();
        with_account(&db, "alice", 0).await;

        let mut conn = db.acquire().await.unwrap();
        let err = conn
            .create_account(&CreateAccountParams {
                owner: "alice".into(),
                balance: 0,
                currency: Currency::Usd,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Two transactions registering the same email: the second commit loses.
        let mut tx1 = db.begin().await.unwrap();
        let mut tx2 = db.begin().await.unwrap();
        let mut bob = user_params("bob");
        bob.email = "shared@example.com".into();
        let mut carol = user_params("carol");
        carol.email = "shared@example.com".into();
        tx1.create_user(&bob).await.unwrap();
        tx2.create_user(&carol).await.unwrap();
        tx1.commit().await.unwrap();
        assert!(matches!(tx2.commit().await, Err(StoreError::Conflict(_))));
        assert!(matches!(
            conn.get_user("carol").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_rollback() {
        let db = InMemoryDatabase::new();
        let first = with_account(&db, "alice", 0).await;

        let mut tx = db.begin().await.unwrap();
        tx.create_user(&user_params("bob")).await.unwrap();
        let discarded = tx
            .create_account(&CreateAccountParams {
                owner: "bob".into(),
                balance: 0,
                currency: Currency::Usd,
            })
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let third = with_account(&db, "carol", 0).await;
        assert!(first.id < discarded.id);
        assert!(discarded.id < third.id);
    }

    #[tokio::test]
    async fn referenced_account_cannot_be_deleted() {
        let db = InMemoryDatabase::new();
        let account = with_account(&db, "alice", 0).await;
        let mut conn = db.acquire().await.unwrap();
        conn.create_entry(CreateEntryParams {
            account_id: account.id,
            amount: 5,
        })
        .await
        .unwrap();

        let err = conn.delete_account(account.id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidReference(_)));

        let unused = with_account(&db, "bob", 0).await;
        conn.delete_account(unused.id).await.unwrap();
        assert!(matches!(
            conn.get_account(unused.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            conn.delete_account(unused.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn verify_email_expires_after_fifteen_minutes() {
        let db = InMemoryDatabase::new();
        let mut conn = db.acquire().await.unwrap();
        conn.create_user(&user_params("alice")).await.unwrap();

        let row = conn
            .create_verify_email(&CreateVerifyEmailParams {
                username: "alice".into(),
                email: "alice@example.com".into(),
                secret_code: "s3cr3t".into(),
            })
            .await
            .unwrap();
        assert!(!row.is_used);
        assert_eq!(
            row.expired_at - row.created_at,
            chrono::Duration::minutes(15)
        );
        assert!(!row.is_expired(row.created_at));
    }
}
