//! Entity Store contracts
//!
//! [`Querier`] is the set of point operations on users, accounts, entries and
//! transfers. It is implemented by anything that can run statements: a pooled
//! Postgres connection, an open Postgres transaction, an in-memory unit of work.
//!
//! [`Backend`] hands out query handles: autocommit connections for standalone
//! calls, and transaction-scoped handles for the transfer engine.

use std::ops::DerefMut;

use async_trait::async_trait;

use super::error::StoreResult;
use crate::core_types::{AccountId, EntryId, TransferId};
use crate::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, UpdateAccountParams, User,
};

#[async_trait]
pub trait Querier: Send {
    async fn create_user(&mut self, params: CreateUserParams) -> StoreResult<User>;

    async fn get_user(&mut self, username: &str) -> StoreResult<User>;

    /// New accounts open with a zero balance
    async fn create_account(&mut self, params: CreateAccountParams) -> StoreResult<Account>;

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account>;

    async fn list_accounts(&mut self, params: ListAccountsParams) -> StoreResult<Vec<Account>>;

    /// Reassign ownership. Takes the row lock; never touches the balance.
    async fn update_account(&mut self, params: UpdateAccountParams) -> StoreResult<Account>;

    /// Fails with a foreign key violation while ledger rows reference the account
    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()>;

    /// Atomically add `delta` to the balance and return the updated row.
    ///
    /// Takes the account's row lock and keeps it until the enclosing unit of
    /// work ends. This is the only balance mutator.
    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> StoreResult<Account>;

    async fn create_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry>;

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry>;

    async fn list_entries(&mut self, params: ListEntriesParams) -> StoreResult<Vec<Entry>>;

    async fn create_transfer(&mut self, params: CreateTransferParams) -> StoreResult<Transfer>;

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer>;

    async fn get_transfer_by_idempotency_key(&mut self, key: &str) -> StoreResult<Transfer>;

    async fn list_transfers(&mut self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>>;
}

/// Source of query handles and owner of the unit-of-work lifecycle
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Querier: Querier + 'static;
    /// Open unit of work. Dropping it without `commit` rolls it back.
    type Tx: DerefMut<Target = Self::Querier> + Send;
    /// Autocommit handle: every write is durable on return.
    type Conn: DerefMut<Target = Self::Querier> + Send;

    /// Get backend name for logging
    fn name(&self) -> &'static str;

    async fn begin(&self) -> StoreResult<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> StoreResult<()>;

    async fn rollback(&self, tx: Self::Tx) -> StoreResult<()>;

    async fn acquire(&self) -> StoreResult<Self::Conn>;
}
