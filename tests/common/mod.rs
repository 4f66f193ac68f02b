//! Shared fixtures for integration tests
//!
//! Everything goes through `&dyn Store` so the same scenarios run against the
//! in-memory backend and against PostgreSQL.

#![allow(dead_code)]

use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;

use ledger_bank::models::{CreateAccountParams, CreateUserParams};
use ledger_bank::store::Store;
use ledger_bank::{Account, Amount, Currency, TransferTxParams, User};

pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn random_owner() -> String {
    format!("user_{}", random_string(8))
}

pub fn random_currency() -> Currency {
    *Currency::ALL
        .choose(&mut rand::thread_rng())
        .expect("currency list is not empty")
}

pub async fn create_random_user(store: &dyn Store) -> User {
    let username = random_owner();
    store
        .create_user(CreateUserParams {
            username: username.clone(),
            hashed_password: random_string(32),
            full_name: format!("Test {username}"),
            email: format!("{username}@example.com"),
        })
        .await
        .expect("create user")
}

pub async fn create_account(store: &dyn Store, owner: &str, currency: Currency) -> Account {
    store
        .create_account(CreateAccountParams {
            owner: owner.to_string(),
            currency: currency.code().to_string(),
        })
        .await
        .expect("create account")
}

/// Account of a fresh user; may go negative and is used to fund others
pub async fn create_treasury(store: &dyn Store, currency: Currency) -> Account {
    let user = create_random_user(store).await;
    create_account(store, &user.username, currency).await
}

/// Fresh user with one account holding `balance`, funded from `treasury`
pub async fn create_funded_account(
    store: &dyn Store,
    treasury: &Account,
    balance: Amount,
) -> Account {
    let user = create_random_user(store).await;
    let currency = treasury
        .currency
        .parse::<Currency>()
        .expect("treasury currency is supported");
    let account = create_account(store, &user.username, currency).await;
    if balance > 0 {
        store
            .transfer_tx(TransferTxParams::new(treasury.id, account.id, balance))
            .await
            .expect("fund account");
    }
    store.get_account(account.id).await.expect("reload account")
}
