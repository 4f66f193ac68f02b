//! In-process Entity Store
//!
//! Committed rows live in one table set behind a short-lived `RwLock`. A unit
//! of work ([`MemoryTx`]) stages its writes privately and publishes them at
//! commit; dropping it discards them.
//!
//! Account rows carry a real exclusive lock (`tokio::sync::Mutex`) that a unit
//! of work takes on `add_account_balance`, `update_account` and
//! `delete_account` and keeps until it ends, mirroring Postgres row locks:
//! a second writer of the same row waits, and two writers taking the same two
//! rows in opposite order deadlock.
//!
//! Plain reads never wait for row locks and only see committed rows plus the
//! reader's own staged writes.
//!
//! A unit of work yields after every row lock it takes (or sleeps for the
//! configured lock delay), so concurrent transfers interleave between their
//! first and second balance update.
//!
//! [`MemoryBackend::fail_nth`] arms one-shot failures for fault-injection tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::error::{ConstraintKind, Entity, StoreError, StoreResult};
use super::querier::{Backend, Querier};
use crate::core_types::{AccountId, EntryId, TransferId};
use crate::db::schema::{ACCOUNTS_OWNER_CURRENCY_KEY, TRANSFERS_IDEMPOTENCY_KEY};
use crate::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, UpdateAccountParams, User,
};

/// Operations that can be armed to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Begin,
    Commit,
    Rollback,
    CreateAccount,
    AddAccountBalance,
    CreateEntry,
    CreateTransfer,
}

#[derive(Debug)]
struct Fault {
    op: Operation,
    skip: usize,
    error: StoreError,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    faults: Mutex<Vec<Fault>>,
    lock_delay: Duration,
}

impl MemoryState {
    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Vec<Fault>> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, id: AccountId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id).or_default().clone()
    }

    /// Forget row locks nobody holds or waits for
    fn prune_row_locks(&self, ids: impl IntoIterator<Item = AccountId>) {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            if locks.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&id);
            }
        }
    }

    /// Fail if a fault is armed for `op`
    fn check(&self, op: Operation) -> StoreResult<()> {
        let mut faults = self.faults();
        let Some(pos) = faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        if faults[pos].skip > 0 {
            faults[pos].skip -= 1;
            return Ok(());
        }
        let fault = faults.remove(pos);
        debug!(op = ?fault.op, error = %fault.error, "Injected fault fired");
        Err(fault.error)
    }
}

fn next_id(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

/// Shared in-memory database. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose units of work sleep for `delay` after taking each row
    /// lock, widening the window in which concurrent transfers overlap
    pub fn with_lock_delay(delay: Duration) -> Self {
        Self {
            state: Arc::new(MemoryState {
                lock_delay: delay,
                ..MemoryState::default()
            }),
        }
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: Operation, error: StoreError) {
        self.fail_nth(op, 0, error);
    }

    /// Let `skip` calls of `op` succeed, then fail the following one with `error`
    pub fn fail_nth(&self, op: Operation, skip: usize, error: StoreError) {
        self.state.faults().push(Fault { op, skip, error });
    }

    /// Number of armed faults that have not fired yet
    pub fn pending_faults(&self) -> usize {
        self.state.faults().len()
    }

    /// Number of account rows with a live lock entry
    pub fn tracked_row_locks(&self) -> usize {
        self.state
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn handle(&self, autocommit: bool) -> Box<MemoryTx> {
        Box::new(MemoryTx {
            state: self.state.clone(),
            autocommit,
            row_guards: HashMap::new(),
            staged: Staged::default(),
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Querier = MemoryTx;
    type Tx = Box<MemoryTx>;
    type Conn = Box<MemoryTx>;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> StoreResult<Self::Tx> {
        self.state.check(Operation::Begin)?;
        Ok(self.handle(false))
    }

    async fn commit(&self, mut tx: Self::Tx) -> StoreResult<()> {
        tx.publish()
    }

    async fn rollback(&self, mut tx: Self::Tx) -> StoreResult<()> {
        // The staged writes are gone either way; the fault only decides what
        // the caller is told
        tx.discard();
        self.state.check(Operation::Rollback)
    }

    async fn acquire(&self) -> StoreResult<Self::Conn> {
        Ok(self.handle(true))
    }
}

#[derive(Debug, Default)]
struct Staged {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<AccountId, Account>,
    deleted_accounts: BTreeSet<AccountId>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.accounts.is_empty()
            && self.deleted_accounts.is_empty()
            && self.entries.is_empty()
            && self.transfers.is_empty()
    }
}

/// Query handle over [`MemoryBackend`]: a unit of work, or an autocommit
/// connection that publishes after every write.
#[derive(Debug)]
pub struct MemoryTx {
    state: Arc<MemoryState>,
    autocommit: bool,
    row_guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    staged: Staged,
}

impl MemoryTx {
    /// Block until this unit of work holds the row lock of `id`
    async fn lock_row(&mut self, id: AccountId) {
        if self.row_guards.contains_key(&id) {
            return;
        }
        let lock = self.state.row_lock(id);
        let guard = lock.lock_owned().await;
        self.row_guards.insert(id, guard);

        if self.state.lock_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.state.lock_delay).await;
        }
    }

    fn release_rows(&mut self) {
        if self.row_guards.is_empty() {
            return;
        }
        let ids: Vec<AccountId> = self.row_guards.keys().copied().collect();
        self.row_guards.clear();
        self.state.prune_row_locks(ids);
    }

    /// Latest visible version of an account (own staged writes first)
    fn account(&self, id: AccountId) -> Option<Account> {
        if self.staged.deleted_accounts.contains(&id) {
            return None;
        }
        if let Some(account) = self.staged.accounts.get(&id) {
            return Some(account.clone());
        }
        self.state.read().accounts.get(&id).cloned()
    }

    fn user_exists(&self, username: &str) -> bool {
        self.staged.users.contains_key(username) || self.state.read().users.contains_key(username)
    }

    /// Whether ledger rows, committed or staged, reference account `id`
    fn is_referenced(&self, id: AccountId) -> bool {
        self.staged.entries.values().any(|e| e.account_id == id)
            || self
                .staged
                .transfers
                .values()
                .any(|t| t.from_account_id == id || t.to_account_id == id)
            || is_referenced(&self.state.read(), id)
    }

    fn idempotency_key_match(&self, key: &str) -> Option<Transfer> {
        let matches = |t: &&Transfer| t.idempotency_key.as_deref() == Some(key);
        if let Some(transfer) = self.staged.transfers.values().find(matches) {
            return Some(transfer.clone());
        }
        self.state.read().transfers.values().find(matches).cloned()
    }

    /// Validate staged writes against the latest committed rows and publish
    /// them, then release row locks.
    fn publish(&mut self) -> StoreResult<()> {
        if let Err(err) = self.state.check(Operation::Commit) {
            self.discard();
            return Err(err);
        }
        if self.staged.is_empty() {
            self.release_rows();
            return Ok(());
        }

        let mut tables = self.state.write();
        let mut next = tables.clone();
        overlay(&mut next, &self.staged);
        if let Err(err) = check_constraints(&tables, &next, &self.staged) {
            drop(tables);
            self.discard();
            return Err(err);
        }
        *tables = next;
        drop(tables);

        self.staged = Staged::default();
        self.release_rows();
        Ok(())
    }

    fn discard(&mut self) {
        self.staged = Staged::default();
        self.release_rows();
    }

    /// Publish immediately when running as an autocommit connection
    fn finish<T>(&mut self, value: T) -> StoreResult<T> {
        if self.autocommit {
            self.publish()?;
        }
        Ok(value)
    }

    /// Undo a failed statement in autocommit mode
    fn fail<T>(&mut self, err: StoreError) -> StoreResult<T> {
        if self.autocommit {
            self.discard();
        }
        Err(err)
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.release_rows();
    }
}

/// Committed rows matching `keep`, with staged versions taking precedence
fn visible<K, V>(
    committed: &BTreeMap<K, V>,
    staged: &BTreeMap<K, V>,
    keep: impl Fn(&V) -> bool,
) -> BTreeMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    let mut rows: BTreeMap<K, V> = committed
        .iter()
        .filter(|(k, v)| !staged.contains_key(*k) && keep(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    rows.extend(
        staged
            .iter()
            .filter(|(_, v)| keep(v))
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    rows
}

fn overlay(tables: &mut Tables, staged: &Staged) {
    for (username, user) in &staged.users {
        tables.users.insert(username.clone(), user.clone());
    }
    for (id, account) in &staged.accounts {
        tables.accounts.insert(*id, account.clone());
    }
    for id in &staged.deleted_accounts {
        tables.accounts.remove(id);
    }
    for (id, entry) in &staged.entries {
        tables.entries.insert(*id, entry.clone());
    }
    for (id, transfer) in &staged.transfers {
        tables.transfers.insert(*id, transfer.clone());
    }
}

/// Constraints touched by `staged`, checked against the rows committed
/// meanwhile and the post-commit view
fn check_constraints(committed: &Tables, view: &Tables, staged: &Staged) -> StoreResult<()> {
    for user in staged.users.values() {
        if committed.users.contains_key(&user.username) {
            return Err(unique_violation("users_pkey"));
        }
        let same_email = view
            .users
            .values()
            .filter(|u| u.email == user.email)
            .count();
        if same_email > 1 {
            return Err(unique_violation("users_email_key"));
        }
    }

    for account in staged.accounts.values() {
        if !view.users.contains_key(&account.owner) {
            return Err(StoreError::NotFound(Entity::User));
        }
        let same_key = view
            .accounts
            .values()
            .filter(|a| a.owner == account.owner && a.currency == account.currency)
            .count();
        if same_key > 1 {
            return Err(unique_violation(ACCOUNTS_OWNER_CURRENCY_KEY));
        }
    }

    for entry in staged.entries.values() {
        if !view.accounts.contains_key(&entry.account_id) {
            return Err(StoreError::NotFound(Entity::Account));
        }
    }

    for transfer in staged.transfers.values() {
        if !view.accounts.contains_key(&transfer.from_account_id)
            || !view.accounts.contains_key(&transfer.to_account_id)
        {
            return Err(StoreError::NotFound(Entity::Account));
        }
        if let Some(key) = &transfer.idempotency_key {
            let same_key = view
                .transfers
                .values()
                .filter(|t| t.idempotency_key.as_ref() == Some(key))
                .count();
            if same_key > 1 {
                return Err(StoreError::DuplicateTransfer { key: key.clone() });
            }
        }
    }

    for id in &staged.deleted_accounts {
        if is_referenced(view, *id) {
            return Err(referenced_violation());
        }
    }
    Ok(())
}

fn is_referenced(view: &Tables, id: AccountId) -> bool {
    view.entries.values().any(|e| e.account_id == id)
        || view
            .transfers
            .values()
            .any(|t| t.from_account_id == id || t.to_account_id == id)
}

fn unique_violation(constraint: &str) -> StoreError {
    StoreError::ConstraintViolation {
        kind: ConstraintKind::Unique,
        constraint: constraint.to_string(),
        message: format!("duplicate key value violates unique constraint \"{constraint}\""),
    }
}

fn referenced_violation() -> StoreError {
    StoreError::ConstraintViolation {
        kind: ConstraintKind::ForeignKey,
        constraint: "entries_account_id_fkey".to_string(),
        message: "account is still referenced by ledger rows".to_string(),
    }
}

fn page<T>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = usize::try_from(offset).unwrap_or(0);
    let limit = usize::try_from(limit).unwrap_or(0);
    rows.skip(offset).take(limit).collect()
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[async_trait]
impl Querier for MemoryTx {
    async fn create_user(&mut self, params: CreateUserParams) -> StoreResult<User> {
        if self.user_exists(&params.username) {
            return self.fail(unique_violation("users_pkey"));
        }
        let user = User {
            username: params.username,
            hashed_password: params.hashed_password,
            full_name: params.full_name,
            email: params.email,
            password_changed_at: DateTime::<Utc>::UNIX_EPOCH,
            created_at: now(),
        };
        self.staged.users.insert(user.username.clone(), user.clone());
        self.finish(user)
    }

    async fn get_user(&mut self, username: &str) -> StoreResult<User> {
        if let Some(user) = self.staged.users.get(username) {
            return Ok(user.clone());
        }
        self.state
            .read()
            .users
            .get(username)
            .cloned()
            .ok_or(StoreError::NotFound(Entity::User))
    }

    async fn create_account(&mut self, params: CreateAccountParams) -> StoreResult<Account> {
        if let Err(err) = self.state.check(Operation::CreateAccount) {
            return self.fail(err);
        }
        if !self.user_exists(&params.owner) {
            return self.fail(StoreError::NotFound(Entity::User));
        }
        let account = Account {
            id: next_id(&self.state.account_seq),
            owner: params.owner,
            balance: 0,
            currency: params.currency,
            created_at: now(),
        };
        self.staged.accounts.insert(account.id, account.clone());
        self.finish(account)
    }

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account> {
        self.account(id).ok_or(StoreError::NotFound(Entity::Account))
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> StoreResult<Vec<Account>> {
        let rows = visible(&self.state.read().accounts, &self.staged.accounts, |a| {
            a.owner == params.owner && !self.staged.deleted_accounts.contains(&a.id)
        });
        Ok(page(rows.into_values(), params.limit, params.offset))
    }

    async fn update_account(&mut self, params: UpdateAccountParams) -> StoreResult<Account> {
        self.lock_row(params.id).await;
        let Some(mut account) = self.account(params.id) else {
            return self.fail(StoreError::NotFound(Entity::Account));
        };
        if !self.user_exists(&params.owner) {
            return self.fail(StoreError::NotFound(Entity::User));
        }
        account.owner = params.owner;
        self.staged.accounts.insert(account.id, account.clone());
        self.finish(account)
    }

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        self.lock_row(id).await;
        if self.account(id).is_none() {
            return self.fail(StoreError::NotFound(Entity::Account));
        }
        if self.is_referenced(id) {
            return self.fail(referenced_violation());
        }
        self.staged.accounts.remove(&id);
        self.staged.deleted_accounts.insert(id);
        self.finish(())
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> StoreResult<Account> {
        if let Err(err) = self.state.check(Operation::AddAccountBalance) {
            return self.fail(err);
        }
        self.lock_row(params.id).await;

        // Read only after the lock is held: the previous holder has published
        let Some(mut account) = self.account(params.id) else {
            return self.fail(StoreError::NotFound(Entity::Account));
        };
        let Some(balance) = account.balance.checked_add(params.delta) else {
            return self.fail(StoreError::ConstraintViolation {
                kind: ConstraintKind::Check,
                constraint: "balance_range".to_string(),
                message: format!("bigint out of range for account {}", params.id),
            });
        };
        account.balance = balance;
        self.staged.accounts.insert(account.id, account.clone());
        self.finish(account)
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry> {
        if let Err(err) = self.state.check(Operation::CreateEntry) {
            return self.fail(err);
        }
        if self.account(params.account_id).is_none() {
            return self.fail(StoreError::NotFound(Entity::Account));
        }
        let entry = Entry {
            id: next_id(&self.state.entry_seq),
            account_id: params.account_id,
            amount: params.amount,
            created_at: now(),
        };
        self.staged.entries.insert(entry.id, entry.clone());
        self.finish(entry)
    }

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry> {
        if let Some(entry) = self.staged.entries.get(&id) {
            return Ok(entry.clone());
        }
        self.state
            .read()
            .entries
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(Entity::Entry))
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        let rows = visible(&self.state.read().entries, &self.staged.entries, |e| {
            e.account_id == params.account_id
        });
        Ok(page(rows.into_values(), params.limit, params.offset))
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> StoreResult<Transfer> {
        if let Err(err) = self.state.check(Operation::CreateTransfer) {
            return self.fail(err);
        }
        if self.account(params.from_account_id).is_none()
            || self.account(params.to_account_id).is_none()
        {
            return self.fail(StoreError::NotFound(Entity::Account));
        }
        if params.amount <= 0 {
            return self.fail(StoreError::ConstraintViolation {
                kind: ConstraintKind::Check,
                constraint: "transfers_amount_positive".to_string(),
                message: "transfer amount must be positive".to_string(),
            });
        }
        if let Some(key) = &params.idempotency_key
            && self.idempotency_key_match(key).is_some()
        {
            let key = key.clone();
            debug!(constraint = TRANSFERS_IDEMPOTENCY_KEY, key = %key, "Duplicate idempotency key");
            return self.fail(StoreError::DuplicateTransfer { key });
        }

        let transfer = Transfer {
            id: next_id(&self.state.transfer_seq),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            idempotency_key: params.idempotency_key,
            created_at: now(),
        };
        self.staged.transfers.insert(transfer.id, transfer.clone());
        self.finish(transfer)
    }

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer> {
        if let Some(transfer) = self.staged.transfers.get(&id) {
            return Ok(transfer.clone());
        }
        self.state
            .read()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(Entity::Transfer))
    }

    async fn get_transfer_by_idempotency_key(&mut self, key: &str) -> StoreResult<Transfer> {
        self.idempotency_key_match(key)
            .ok_or(StoreError::NotFound(Entity::Transfer))
    }

    async fn list_transfers(&mut self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        let rows = visible(&self.state.read().transfers, &self.staged.transfers, |t| {
            t.from_account_id == params.account_id || t.to_account_id == params.account_id
        });
        Ok(page(rows.into_values(), params.limit, params.offset))
    }
}
