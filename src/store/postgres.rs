//! PostgreSQL Entity Store
//!
//! [`Querier`] is implemented directly on `PgConnection`, so the same
//! statements run on a pooled connection (autocommit) and inside a
//! `Transaction` (which derefs to its connection).
//!
//! Balance updates are a single `UPDATE ... SET balance = balance + $2`; the
//! row lock it takes is held by Postgres until the transaction ends.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{Postgres, Transaction};

use super::error::{ConstraintKind, Entity, StoreError, StoreResult};
use super::querier::{Backend, Querier};
use crate::core_types::{AccountId, EntryId, TransferId};
use crate::db::Database;
use crate::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, UpdateAccountParams, User,
};

const USER_COLUMNS: &str = "username, hashed_password, full_name, email, password_changed_at, created_at";
const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str =
    "id, from_account_id, to_account_id, amount, idempotency_key, created_at";

#[async_trait]
impl Querier for PgConnection {
    async fn create_user(&mut self, params: CreateUserParams) -> StoreResult<User> {
        sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (username, hashed_password, full_name, email)
             VALUES ($1, $2, $3, $4)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(&params.username)
        .bind(&params.hashed_password)
        .bind(&params.full_name)
        .bind(&params.email)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::User))
    }

    async fn get_user(&mut self, username: &str) -> StoreResult<User> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::User))
    }

    async fn create_account(&mut self, params: CreateAccountParams) -> StoreResult<Account> {
        sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO accounts (owner, balance, currency)
             VALUES ($1, 0, $2)
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&params.owner)
        .bind(&params.currency)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Account))
    }

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Account))
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> StoreResult<Vec<Account>> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts
             WHERE owner = $1
             ORDER BY id
             LIMIT $2 OFFSET $3"
        ))
        .bind(&params.owner)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Account))
    }

    async fn update_account(&mut self, params: UpdateAccountParams) -> StoreResult<Account> {
        sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET owner = $2
             WHERE id = $1
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(params.id)
        .bind(&params.owner)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Account))
    }

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&mut *self)
            .await
            .map_err(|e| StoreError::from_sqlx_on_delete(e, Entity::Account))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(Entity::Account));
        }
        Ok(())
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> StoreResult<Account> {
        sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET balance = balance + $2
             WHERE id = $1
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(params.id)
        .bind(params.delta)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Account))
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> StoreResult<Entry> {
        sqlx::query_as::<_, Entry>(&format!(
            "INSERT INTO entries (account_id, amount)
             VALUES ($1, $2)
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(params.account_id)
        .bind(params.amount)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Entry))
    }

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry> {
        sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Entry))
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries
             WHERE account_id = $1
             ORDER BY id
             LIMIT $2 OFFSET $3"
        ))
        .bind(params.account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Entry))
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> StoreResult<Transfer> {
        sqlx::query_as::<_, Transfer>(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount, idempotency_key)
             VALUES ($1, $2, $3, $4)
             RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.amount)
        .bind(&params.idempotency_key)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| match StoreError::from_sqlx(e, Entity::Transfer) {
            StoreError::ConstraintViolation {
                kind: ConstraintKind::Unique,
                ..
            } if params.idempotency_key.is_some() => StoreError::DuplicateTransfer {
                key: params.idempotency_key.clone().unwrap_or_default(),
            },
            other => other,
        })
    }

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer> {
        sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Transfer))
    }

    async fn get_transfer_by_idempotency_key(&mut self, key: &str) -> StoreResult<Transfer> {
        sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_one(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Transfer))
    }

    async fn list_transfers(&mut self, params: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE from_account_id = $1 OR to_account_id = $1
             ORDER BY id
             LIMIT $2 OFFSET $3"
        ))
        .bind(params.account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self)
        .await
        .map_err(|e| StoreError::from_sqlx(e, Entity::Transfer))
    }
}

/// Postgres-backed unit-of-work source
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgBackend {
    pub fn new(db: &Database, lock_timeout: Duration) -> Self {
        Self {
            pool: db.pool().clone(),
            lock_timeout,
        }
    }
}

#[async_trait]
impl Backend for PgBackend {
    type Querier = PgConnection;
    type Tx = Transaction<'static, Postgres>;
    type Conn = PoolConnection<Postgres>;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> StoreResult<Self::Tx> {
        let mut tx = self.pool.begin().await?;

        // Transaction-local: a transfer waiting longer than this on a row
        // lock fails with lock_not_available instead of hanging
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        Ok(tx)
    }

    async fn commit(&self, tx: Self::Tx) -> StoreResult<()> {
        tx.commit().await.map_err(StoreError::from)
    }

    async fn rollback(&self, tx: Self::Tx) -> StoreResult<()> {
        tx.rollback().await.map_err(StoreError::from)
    }

    async fn acquire(&self) -> StoreResult<Self::Conn> {
        self.pool.acquire().await.map_err(StoreError::from)
    }
}
