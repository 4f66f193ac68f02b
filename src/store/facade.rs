//! Store Facade
//!
//! [`LedgerStore`] owns a [`Backend`] and is the only way callers reach the
//! ledger: point operations run on an autocommit connection, transfers run
//! inside a unit of work driven by [`LedgerStore::exec_tx`].

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{error, info, warn};

use super::error::{StoreError, StoreResult};
use super::querier::{Backend, Querier};
use super::transfer;
use crate::core_types::{AccountId, EntryId, TransferId};
use crate::models::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
    Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams, Transfer, TransferTxParams,
    TransferTxResult, UpdateAccountParams, User,
};

/// Default upper bound for one unit of work
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything callers may do with the ledger.
///
/// Balances are not directly writable here; they only change through
/// [`Store::transfer_tx`].
#[async_trait]
pub trait Store: Send + Sync {
    /// Move `amount` between two accounts atomically, writing one transfer
    /// row and two balancing entries
    async fn transfer_tx(&self, params: TransferTxParams) -> StoreResult<TransferTxResult>;

    async fn create_user(&self, params: CreateUserParams) -> StoreResult<User>;
    async fn get_user(&self, username: &str) -> StoreResult<User>;

    async fn create_account(&self, params: CreateAccountParams) -> StoreResult<Account>;
    async fn get_account(&self, id: AccountId) -> StoreResult<Account>;
    async fn list_accounts(&self, params: ListAccountsParams) -> StoreResult<Vec<Account>>;
    async fn update_account(&self, params: UpdateAccountParams) -> StoreResult<Account>;
    async fn delete_account(&self, id: AccountId) -> StoreResult<()>;

    async fn create_entry(&self, params: CreateEntryParams) -> StoreResult<Entry>;
    async fn get_entry(&self, id: EntryId) -> StoreResult<Entry>;
    async fn list_entries(&self, params: ListEntriesParams) -> StoreResult<Vec<Entry>>;

    async fn create_transfer(&self, params: CreateTransferParams) -> StoreResult<Transfer>;
    async fn get_transfer(&self, id: TransferId) -> StoreResult<Transfer>;
    async fn get_transfer_by_idempotency_key(&self, key: &str) -> StoreResult<Transfer>;
    async fn list_transfers(&self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>>;
}

pub struct LedgerStore<B: Backend> {
    backend: B,
    tx_timeout: Duration,
}

impl<B: Backend> LedgerStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            tx_timeout: DEFAULT_TX_TIMEOUT,
        }
    }

    pub fn with_tx_timeout(mut self, tx_timeout: Duration) -> Self {
        self.tx_timeout = tx_timeout;
        self
    }

    /// Run `work` inside one unit of work.
    ///
    /// Commits when `work` succeeds, rolls back when it fails or outlives the
    /// transaction timeout. Exactly one of the two happens per call. The error
    /// of `work` is returned unchanged unless the rollback also fails.
    pub async fn exec_tx<T, F>(&self, label: &'static str, work: F) -> StoreResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut B::Querier) -> BoxFuture<'t, StoreResult<T>> + Send,
    {
        let mut tx = self.backend.begin().await?;

        let outcome = match tokio::time::timeout(self.tx_timeout, work(&mut *tx)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "{label} exceeded {}ms",
                self.tx_timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(value) => {
                self.backend.commit(tx).await?;
                Ok(value)
            }
            Err(err) => match self.backend.rollback(tx).await {
                Ok(()) => {
                    warn!(
                        backend = self.backend.name(),
                        op = label,
                        code = err.code(),
                        error = %err,
                        "Unit of work rolled back"
                    );
                    Err(err)
                }
                Err(rollback_err) => {
                    error!(
                        backend = self.backend.name(),
                        op = label,
                        error = %err,
                        rollback_error = %rollback_err,
                        "Rollback failed"
                    );
                    Err(StoreError::rollback_failed(err, rollback_err))
                }
            },
        }
    }
}

#[async_trait]
impl<B: Backend> Store for LedgerStore<B> {
    async fn transfer_tx(&self, params: TransferTxParams) -> StoreResult<TransferTxResult> {
        transfer::validate(&params)?;

        let result = self
            .exec_tx("transfer_tx", move |q| {
                Box::pin(transfer::transfer_tx(q, params))
            })
            .await?;

        info!(
            transfer_id = result.transfer.id,
            from = result.transfer.from_account_id,
            to = result.transfer.to_account_id,
            amount = result.transfer.amount,
            "Transfer committed"
        );
        Ok(result)
    }

    async fn create_user(&self, params: CreateUserParams) -> StoreResult<User> {
        self.backend.acquire().await?.create_user(params).await
    }

    async fn get_user(&self, username: &str) -> StoreResult<User> {
        self.backend.acquire().await?.get_user(username).await
    }

    async fn create_account(&self, params: CreateAccountParams) -> StoreResult<Account> {
        self.backend.acquire().await?.create_account(params).await
    }

    async fn get_account(&self, id: AccountId) -> StoreResult<Account> {
        self.backend.acquire().await?.get_account(id).await
    }

    async fn list_accounts(&self, params: ListAccountsParams) -> StoreResult<Vec<Account>> {
        self.backend.acquire().await?.list_accounts(params).await
    }

    async fn update_account(&self, params: UpdateAccountParams) -> StoreResult<Account> {
        self.backend.acquire().await?.update_account(params).await
    }

    async fn delete_account(&self, id: AccountId) -> StoreResult<()> {
        self.backend.acquire().await?.delete_account(id).await
    }

    async fn create_entry(&self, params: CreateEntryParams) -> StoreResult<Entry> {
        self.backend.acquire().await?.create_entry(params).await
    }

    async fn get_entry(&self, id: EntryId) -> StoreResult<Entry> {
        self.backend.acquire().await?.get_entry(id).await
    }

    async fn list_entries(&self, params: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        self.backend.acquire().await?.list_entries(params).await
    }

    async fn create_transfer(&self, params: CreateTransferParams) -> StoreResult<Transfer> {
        self.backend.acquire().await?.create_transfer(params).await
    }

    async fn get_transfer(&self, id: TransferId) -> StoreResult<Transfer> {
        self.backend.acquire().await?.get_transfer(id).await
    }

    async fn get_transfer_by_idempotency_key(&self, key: &str) -> StoreResult<Transfer> {
        self.backend
            .acquire()
            .await?
            .get_transfer_by_idempotency_key(key)
            .await
    }

    async fn list_transfers(&self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        self.backend.acquire().await?.list_transfers(params).await
    }
}
