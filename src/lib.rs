//! Ledger Bank - double-entry transfer engine
//!
//! Moves funds between accounts atomically and records every movement as one
//! transfer row plus two balancing ledger entries.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier and amount aliases
//! - [`models`] - Row types and operation parameters
//! - [`currency`] - Supported currencies
//! - [`config`] - YAML configuration
//! - [`logging`] - Tracing subscriber setup
//! - [`db`] - PostgreSQL pool and schema
//! - [`store`] - Entity Store, Transfer Engine and Store Facade
//! - [`transfer_service`] - Validating caller layer

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod currency;
pub mod db;
pub mod logging;
pub mod models;
pub mod store;
pub mod transfer_service;

// Convenient re-exports at crate root
pub use core_types::{AccountId, Amount, EntryId, TransferId};
pub use currency::Currency;
pub use models::{Account, Entry, Transfer, TransferTxParams, TransferTxResult, User};
pub use store::{
    Backend, LedgerStore, MemoryBackend, PgBackend, Querier, Store, StoreError, StoreErrorKind,
    StoreResult,
};
pub use transfer_service::{Page, TransferError, TransferRequest, TransferService};
