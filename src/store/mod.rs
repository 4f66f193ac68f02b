//! Ledger store
//!
//! Layers, bottom up:
//!
//! ```text
//! Querier / Backend    point operations + unit-of-work lifecycle
//!   ├── postgres       PgConnection, PgBackend
//!   └── memory         MemoryBackend (row locks, fault injection)
//! transfer             the Transfer Engine, generic over any Querier
//! facade               Store trait, LedgerStore<B>::exec_tx
//! ```

pub mod error;
pub mod facade;
pub mod memory;
pub mod postgres;
pub mod querier;
pub mod transfer;

pub use error::{ConstraintKind, Entity, StoreError, StoreErrorKind, StoreResult};
pub use facade::{DEFAULT_TX_TIMEOUT, LedgerStore, Store};
pub use memory::{MemoryBackend, Operation};
pub use postgres::PgBackend;
pub use querier::{Backend, Querier};
