//! Ledger data model
//!
//! Row types map 1:1 onto the `users`, `accounts`, `entries` and `transfers`
//! tables. Parameter structs are the inputs of the Entity Store operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::core_types::{AccountId, Amount, EntryId, TransferId};

// ============================================================================
// Rows
// ============================================================================

/// Account holder. Owns zero or more accounts, one per currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub username: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Account with a signed balance in the smallest unit of `currency`.
///
/// `balance` is only ever changed through `add_account_balance` inside a
/// transfer's unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub balance: Amount,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable ledger line: positive = credit, negative = debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of one movement of funds. `amount` is always positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Entity Store parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

/// New accounts always open with a zero balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAccountsParams {
    pub owner: String,
    pub limit: i64,
    pub offset: i64,
}

/// Reassigns an account to another user. The balance is not updatable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAccountParams {
    pub id: AccountId,
    pub owner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAccountBalanceParams {
    pub id: AccountId,
    pub delta: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntryParams {
    pub account_id: AccountId,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntriesParams {
    pub account_id: AccountId,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
    pub idempotency_key: Option<String>,
}

/// Transfers in which `account_id` is either the source or the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTransfersParams {
    pub account_id: AccountId,
    pub limit: i64,
    pub offset: i64,
}

// ============================================================================
// Transfer engine input / output
// ============================================================================

/// Input of `transfer_tx`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
    /// Caller-supplied key; a repeated key is rejected instead of moving
    /// funds twice.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl TransferTxParams {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: Amount) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Everything one committed transfer wrote, with account balances as of
/// the end of the unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}
