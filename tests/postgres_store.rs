//! The same transfer scenarios against PostgreSQL.
//!
//! Run with `DATABASE_URL=... cargo test --test postgres_store -- --ignored`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ledger_bank::config::DatabaseConfig;
use ledger_bank::db::Database;
use ledger_bank::store::{Entity, LedgerStore, PgBackend, Store, StoreError};
use ledger_bank::{Currency, TransferTxParams};

use common::{create_funded_account, create_treasury, random_currency};

async fn pg_store() -> Arc<dyn Store> {
    let config = DatabaseConfig {
        url: std::env::var("DATABASE_URL").unwrap_or_else(|_| DatabaseConfig::default().url),
        ..DatabaseConfig::default()
    };
    let db = Database::connect(&config).await.expect("Failed to connect");
    db.init_schema().await.expect("Failed to init schema");

    let backend = PgBackend::new(&db, config.lock_timeout());
    Arc::new(LedgerStore::new(backend).with_tx_timeout(config.tx_timeout()))
}

#[tokio::test]
#[ignore = "requires PostgreSQL database"]
async fn pg_transfer_moves_funds() {
    let store = pg_store().await;
    let treasury = create_treasury(store.as_ref(), random_currency()).await;
    let from = create_funded_account(store.as_ref(), &treasury, 100).await;
    let to = create_funded_account(store.as_ref(), &treasury, 50).await;

    let result = store
        .transfer_tx(TransferTxParams::new(from.id, to.id, 30))
        .await
        .unwrap();
    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.balance, 80);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.to_entry.amount, 30);
}

#[tokio::test]
#[ignore = "requires PostgreSQL database"]
async fn pg_unknown_account_rolls_back() {
    let store = pg_store().await;
    let treasury = create_treasury(store.as_ref(), Currency::Usd).await;
    let from = create_funded_account(store.as_ref(), &treasury, 100).await;

    let err = store
        .transfer_tx(TransferTxParams::new(from.id, i64::MAX, 10))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::NotFound(Entity::Account));
    assert_eq!(store.get_account(from.id).await.unwrap().balance, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn pg_opposite_direction_transfers_do_not_deadlock() {
    let store = pg_store().await;
    let treasury = create_treasury(store.as_ref(), Currency::Usd).await;
    let a = create_funded_account(store.as_ref(), &treasury, 500).await;
    let b = create_funded_account(store.as_ref(), &treasury, 500).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let (from, to) = if i % 2 == 1 { (b.id, a.id) } else { (a.id, b.id) };
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.transfer_tx(TransferTxParams::new(from, to, 10)).await
        }));
    }

    tokio::time::timeout(Duration::from_secs(30), async {
        for handle in handles {
            handle.await.expect("task panicked").expect("transfer");
        }
    })
    .await
    .expect("opposite-direction transfers deadlocked");

    assert_eq!(store.get_account(a.id).await.unwrap().balance, 500);
    assert_eq!(store.get_account(b.id).await.unwrap().balance, 500);
}
