//! Core types used throughout the system
//!
//! Identifier aliases match the `BIGSERIAL` columns of the ledger tables.

/// Account ID - primary key of `accounts`.
///
/// # Constraints:
/// - **Immutable**: Once assigned, NEVER changes
/// - **Totally ordered**: The transfer engine takes row locks in ascending
///   `AccountId` order, so every concurrent transfer agrees on the same order
pub type AccountId = i64;

/// Entry ID - primary key of `entries`
pub type EntryId = i64;

/// Transfer ID - primary key of `transfers`
pub type TransferId = i64;

/// Amount in the smallest currency unit (cents, paise, ...).
///
/// Signed: entries carry negative amounts for debits.
pub type Amount = i64;
