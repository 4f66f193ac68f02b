//! Transfer Service
//!
//! Caller-facing checks in front of the Transfer Engine: request validation
//! and currency agreement between both accounts. History queries are paged.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core_types::{AccountId, Amount};
use crate::currency::Currency;
use crate::models::{
    Account, Entry, ListEntriesParams, ListTransfersParams, Transfer, TransferTxParams,
    TransferTxResult,
};
use crate::store::{Entity, Store, StoreError};

pub const MIN_PAGE_SIZE: i32 = 5;
pub const MAX_PAGE_SIZE: i32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
    pub currency: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// 1-based page of a history listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page_id: i32,
    pub page_size: i32,
}

impl Page {
    pub fn new(page_id: i32, page_size: i32) -> Result<Self, TransferError> {
        if page_id < 1 {
            return Err(TransferError::InvalidPage(format!(
                "page_id must be at least 1, got {page_id}"
            )));
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(TransferError::InvalidPage(format!(
                "page_size must be within {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}, got {page_size}"
            )));
        }
        Ok(Self { page_id, page_size })
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page_id - 1) * i64::from(self.page_size)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Source and target account cannot be the same")]
    SameAccount,

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("Invalid page: {0}")]
    InvalidPage(String),

    // === Account Errors ===
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),

    #[error("Account {account_id} currency mismatch: {actual} vs {expected}")]
    CurrencyMismatch {
        account_id: AccountId,
        expected: String,
        actual: String,
    },

    // === Store Errors ===
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            TransferError::InvalidPage(_) => "INVALID_PAGE",
            TransferError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TransferError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            TransferError::Store(e) => e.code(),
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::InvalidAmount
            | TransferError::SameAccount
            | TransferError::UnsupportedCurrency(_)
            | TransferError::InvalidPage(_)
            | TransferError::CurrencyMismatch { .. } => 400,
            TransferError::AccountNotFound(_) => 404,
            TransferError::Store(e) => e.http_status(),
        }
    }
}

/// Validating front of a [`Store`]
pub struct TransferService<S: Store + ?Sized> {
    store: Arc<S>,
}

impl<S: Store + ?Sized> TransferService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Validate `req` against both accounts, then run the transfer
    pub async fn create_transfer(
        &self,
        req: TransferRequest,
    ) -> Result<TransferTxResult, TransferError> {
        if req.amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }
        let currency: Currency = req
            .currency
            .parse()
            .map_err(|_| TransferError::UnsupportedCurrency(req.currency.clone()))?;
        if req.from_account_id == req.to_account_id {
            return Err(TransferError::SameAccount);
        }

        self.valid_account(req.from_account_id, currency).await?;
        self.valid_account(req.to_account_id, currency).await?;

        let mut params = TransferTxParams::new(req.from_account_id, req.to_account_id, req.amount);
        if let Some(key) = req.idempotency_key {
            params = params.with_idempotency_key(key);
        }

        info!(
            from = req.from_account_id,
            to = req.to_account_id,
            amount = req.amount,
            currency = %currency,
            "Transfer requested"
        );
        Ok(self.store.transfer_tx(params).await?)
    }

    /// Transfer in the source account's own currency; the destination must
    /// hold the same currency
    pub async fn create_transfer_from_source(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Amount,
    ) -> Result<TransferTxResult, TransferError> {
        let source = self.load_account(from_account_id).await?;
        self.create_transfer(TransferRequest {
            from_account_id,
            to_account_id,
            amount,
            currency: source.currency,
            idempotency_key: None,
        })
        .await
    }

    /// Ledger entries of an account, oldest first
    pub async fn account_history(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>, TransferError> {
        self.load_account(account_id).await?;
        let entries = self
            .store
            .list_entries(ListEntriesParams {
                account_id,
                limit: page.limit(),
                offset: page.offset(),
            })
            .await?;
        debug!(account_id, count = entries.len(), "Account history loaded");
        Ok(entries)
    }

    /// Transfers touching an account on either side, oldest first
    pub async fn transfer_history(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>, TransferError> {
        self.load_account(account_id).await?;
        let transfers = self
            .store
            .list_transfers(ListTransfersParams {
                account_id,
                limit: page.limit(),
                offset: page.offset(),
            })
            .await?;
        debug!(account_id, count = transfers.len(), "Transfer history loaded");
        Ok(transfers)
    }

    async fn load_account(&self, id: AccountId) -> Result<Account, TransferError> {
        match self.store.get_account(id).await {
            Ok(account) => Ok(account),
            Err(StoreError::NotFound(Entity::Account)) => Err(TransferError::AccountNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn valid_account(
        &self,
        id: AccountId,
        currency: Currency,
    ) -> Result<Account, TransferError> {
        let account = self.load_account(id).await?;
        if account.currency != currency.code() {
            return Err(TransferError::CurrencyMismatch {
                account_id: id,
                expected: currency.code().to_string(),
                actual: account.currency,
            });
        }
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateAccountParams, CreateUserParams};
    use crate::store::{LedgerStore, MemoryBackend};

    /// alice: USD #1 (100), EUR #2 (0); bob: USD #3 (0); bank: USD #4
    async fn setup() -> TransferService<dyn Store> {
        let store: Arc<dyn Store> = Arc::new(LedgerStore::new(MemoryBackend::new()));
        for name in ["alice", "bob", "bank"] {
            store
                .create_user(CreateUserParams {
                    username: name.into(),
                    hashed_password: "hash".into(),
                    full_name: name.into(),
                    email: format!("{name}@example.com"),
                })
                .await
                .unwrap();
        }
        for (owner, currency) in [
            ("alice", "USD"),
            ("alice", "EUR"),
            ("bob", "USD"),
            ("bank", "USD"),
        ] {
            store
                .create_account(CreateAccountParams {
                    owner: owner.into(),
                    currency: currency.into(),
                })
                .await
                .unwrap();
        }
        store
            .transfer_tx(TransferTxParams::new(4, 1, 100))
            .await
            .unwrap();
        TransferService::new(store)
    }

    fn request(from: AccountId, to: AccountId, amount: Amount, currency: &str) -> TransferRequest {
        TransferRequest {
            from_account_id: from,
            to_account_id: to,
            amount,
            currency: currency.to_string(),
            idempotency_key: None,
        }
    }

    #[test]
    fn test_page_bounds() {
        assert!(Page::new(1, 5).is_ok());
        assert!(Page::new(3, 100).is_ok());
        assert!(Page::new(0, 10).is_err());
        assert!(Page::new(1, 4).is_err());
        assert!(Page::new(1, 101).is_err());

        let page = Page::new(3, 10).unwrap();
        assert_eq!(page.limit(), 10);
        assert_eq!(page.offset(), 20);
    }

    #[test]
    fn test_error_codes_and_status() {
        assert_eq!(TransferError::AccountNotFound(1).http_status(), 404);
        assert_eq!(TransferError::InvalidAmount.code(), "INVALID_AMOUNT");
        let store_err = TransferError::from(StoreError::Timeout("lock".into()));
        assert_eq!(store_err.code(), "TIMEOUT");
        assert_eq!(store_err.http_status(), 504);
    }

    #[tokio::test]
    async fn test_create_transfer_happy_path() {
        let service = setup().await;
        let result = service
            .create_transfer(request(1, 3, 40, "USD"))
            .await
            .unwrap();
        assert_eq!(result.from_account.balance, 60);
        assert_eq!(result.to_account.balance, 40);
    }

    #[tokio::test]
    async fn test_create_transfer_rejections() {
        let service = setup().await;

        let cases = [
            (request(1, 3, 0, "USD"), "INVALID_AMOUNT"),
            (request(1, 3, 10, "XYZ"), "UNSUPPORTED_CURRENCY"),
            (request(1, 1, 10, "USD"), "SAME_ACCOUNT"),
            (request(1, 999, 10, "USD"), "ACCOUNT_NOT_FOUND"),
            (request(999, 1, 10, "USD"), "ACCOUNT_NOT_FOUND"),
            (request(2, 3, 10, "EUR"), "CURRENCY_MISMATCH"),
            (request(1, 2, 10, "USD"), "CURRENCY_MISMATCH"),
        ];
        for (req, code) in cases {
            let err = service.create_transfer(req).await.unwrap_err();
            assert_eq!(err.code(), code, "{err}");
        }

        // Nothing moved
        let alice = service.store().get_account(1).await.unwrap();
        assert_eq!(alice.balance, 100);
    }

    #[tokio::test]
    async fn test_transfer_from_source_uses_source_currency() {
        let service = setup().await;

        let result = service.create_transfer_from_source(1, 3, 25).await.unwrap();
        assert_eq!(result.from_account.balance, 75);
        assert_eq!(result.to_account.balance, 25);

        // USD #1 into EUR #2
        let err = service
            .create_transfer_from_source(1, 2, 10)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::CurrencyMismatch {
                account_id: 2,
                expected: "USD".into(),
                actual: "EUR".into(),
            }
        );

        let err = service
            .create_transfer_from_source(999, 1, 10)
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::AccountNotFound(999));

        let err = service
            .create_transfer_from_source(1, 3, 0)
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::InvalidAmount);

        let alice = service.store().get_account(1).await.unwrap();
        let alice_eur = service.store().get_account(2).await.unwrap();
        assert_eq!(alice.balance, 75);
        assert_eq!(alice_eur.balance, 0);
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_passes_through() {
        let service = setup().await;
        let mut req = request(1, 3, 10, "USD");
        req.idempotency_key = Some("abc".into());

        service.create_transfer(req.clone()).await.unwrap();
        let err = service.create_transfer(req).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_TRANSFER");
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn test_history_is_paged() {
        let service = setup().await;
        for _ in 0..7 {
            service
                .create_transfer(request(1, 3, 1, "USD"))
                .await
                .unwrap();
        }

        let first = service
            .account_history(1, Page::new(1, 5).unwrap())
            .await
            .unwrap();
        let second = service
            .account_history(1, Page::new(2, 5).unwrap())
            .await
            .unwrap();
        // funding credit + 7 debits
        assert_eq!(first.len(), 5);
        assert_eq!(second.len(), 3);
        assert!(first.iter().all(|e| e.account_id == 1));

        let transfers = service
            .transfer_history(3, Page::new(1, 100).unwrap())
            .await
            .unwrap();
        assert_eq!(transfers.len(), 7);

        let err = service
            .transfer_history(999, Page::new(1, 5).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::AccountNotFound(999));
    }
}
