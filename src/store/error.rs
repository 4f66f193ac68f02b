//! Store Error Types
//!
//! Every backend reports failures through [`StoreError`]. Postgres errors are
//! classified once, by SQLSTATE and sqlx error kind, in [`StoreError::from_sqlx`];
//! callers match on variants instead of inspecting driver internals.

use std::fmt;

use sqlx::error::{DatabaseError, ErrorKind};
use thiserror::Error;

use crate::db::schema::ACCOUNTS_OWNER_FKEY;

pub type StoreResult<T> = Result<T, StoreError>;

/// Row type a lookup or reference was about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User,
    Account,
    Entry,
    Transfer,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::User => "user",
            Entity::Account => "account",
            Entity::Entry => "entry",
            Entity::Transfer => "transfer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConstraintKind::Unique => "unique",
            ConstraintKind::ForeignKey => "foreign key",
            ConstraintKind::Check => "check",
            ConstraintKind::NotNull => "not null",
        })
    }
}

/// Coarse grouping used by callers to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    Constraint,
    Invalid,
    Transient,
    Internal,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(Entity),

    #[error("{kind} constraint violation ({constraint}): {message}")]
    ConstraintViolation {
        kind: ConstraintKind,
        constraint: String,
        message: String,
    },

    #[error("Duplicate transfer for idempotency key '{key}'")]
    DuplicateTransfer { key: String },

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Connection failure: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Rollback failed: {rollback} (transaction error: {original})")]
    RollbackFailed {
        original: Box<StoreError>,
        rollback: Box<StoreError>,
    },
}

impl StoreError {
    /// Combine a unit-of-work failure with the failure to unwind it
    pub fn rollback_failed(original: StoreError, rollback: StoreError) -> Self {
        StoreError::RollbackFailed {
            original: Box::new(original),
            rollback: Box::new(rollback),
        }
    }

    /// Classify a sqlx error raised by a query about `entity`.
    ///
    /// `RowNotFound` becomes `NotFound(entity)`; everything else goes through
    /// the generic classification.
    pub fn from_sqlx(err: sqlx::Error, entity: Entity) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(entity),
            other => StoreError::from(other),
        }
    }

    /// Classify a sqlx error raised by a DELETE of `entity`.
    ///
    /// A foreign key violation there means other rows still reference the
    /// deleted row, which is a constraint violation rather than a missing
    /// referenced row.
    pub fn from_sqlx_on_delete(err: sqlx::Error, entity: Entity) -> Self {
        if let sqlx::Error::Database(db) = &err
            && db.kind() == ErrorKind::ForeignKeyViolation
        {
            return StoreError::ConstraintViolation {
                kind: ConstraintKind::ForeignKey,
                constraint: db.constraint().unwrap_or_default().to_string(),
                message: db.message().to_string(),
            };
        }
        StoreError::from_sqlx(err, entity)
    }

    pub fn kind(&self) -> StoreErrorKind {
        match self {
            StoreError::NotFound(_) => StoreErrorKind::NotFound,
            StoreError::ConstraintViolation { .. } | StoreError::DuplicateTransfer { .. } => {
                StoreErrorKind::Constraint
            }
            StoreError::InvalidTransfer(_) => StoreErrorKind::Invalid,
            StoreError::Connection(_) | StoreError::Timeout(_) | StoreError::Transient(_) => {
                StoreErrorKind::Transient
            }
            StoreError::Database(_) | StoreError::RollbackFailed { .. } => {
                StoreErrorKind::Internal
            }
        }
    }

    /// Retrying is a caller decision; the engine never retries on its own.
    pub fn is_retryable(&self) -> bool {
        self.kind() == StoreErrorKind::Transient
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(Entity::User) => "USER_NOT_FOUND",
            StoreError::NotFound(Entity::Account) => "ACCOUNT_NOT_FOUND",
            StoreError::NotFound(Entity::Entry) => "ENTRY_NOT_FOUND",
            StoreError::NotFound(Entity::Transfer) => "TRANSFER_NOT_FOUND",
            StoreError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            StoreError::DuplicateTransfer { .. } => "DUPLICATE_TRANSFER",
            StoreError::InvalidTransfer(_) => "INVALID_TRANSFER",
            StoreError::Connection(_) => "CONNECTION_FAILURE",
            StoreError::Timeout(_) => "TIMEOUT",
            StoreError::Transient(_) => "TRANSIENT_FAILURE",
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::RollbackFailed { .. } => "ROLLBACK_FAILED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 404,
            StoreError::ConstraintViolation { kind, .. } => match kind {
                ConstraintKind::Unique | ConstraintKind::ForeignKey => 403,
                ConstraintKind::Check | ConstraintKind::NotNull => 400,
            },
            StoreError::DuplicateTransfer { .. } => 409,
            StoreError::InvalidTransfer(_) => 400,
            StoreError::Connection(_) | StoreError::Transient(_) => 503,
            StoreError::Timeout(_) => 504,
            StoreError::Database(_) | StoreError::RollbackFailed { .. } => 500,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => classify_database_error(db.as_ref()),
            sqlx::Error::PoolTimedOut => {
                StoreError::Timeout("timed out acquiring a pooled connection".to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

fn classify_database_error(db: &dyn DatabaseError) -> StoreError {
    let constraint = db.constraint().unwrap_or_default().to_string();
    let message = db.message().to_string();

    match db.kind() {
        // Every foreign key in the schema points at accounts, except the owner
        ErrorKind::ForeignKeyViolation if constraint == ACCOUNTS_OWNER_FKEY => {
            return StoreError::NotFound(Entity::User);
        }
        ErrorKind::ForeignKeyViolation => return StoreError::NotFound(Entity::Account),
        ErrorKind::UniqueViolation => {
            return StoreError::ConstraintViolation {
                kind: ConstraintKind::Unique,
                constraint,
                message,
            };
        }
        ErrorKind::CheckViolation => {
            return StoreError::ConstraintViolation {
                kind: ConstraintKind::Check,
                constraint,
                message,
            };
        }
        ErrorKind::NotNullViolation => {
            return StoreError::ConstraintViolation {
                kind: ConstraintKind::NotNull,
                constraint,
                message,
            };
        }
        _ => {}
    }

    let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
    match code.as_str() {
        // lock_not_available, query_canceled
        "55P03" | "57014" => StoreError::Timeout(message),
        // deadlock_detected, serialization_failure
        "40P01" | "40001" => StoreError::Transient(message),
        // numeric_value_out_of_range: balance overflow
        "22003" => StoreError::ConstraintViolation {
            kind: ConstraintKind::Check,
            constraint: "balance_range".to_string(),
            message,
        },
        c if c.starts_with("08") || c == "57P01" => StoreError::Connection(message),
        _ => StoreError::Database(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            StoreError::NotFound(Entity::Account).code(),
            "ACCOUNT_NOT_FOUND"
        );
        assert_eq!(
            StoreError::DuplicateTransfer { key: "k".into() }.code(),
            "DUPLICATE_TRANSFER"
        );
        assert_eq!(
            StoreError::rollback_failed(
                StoreError::Timeout("lock".into()),
                StoreError::Connection("gone".into())
            )
            .code(),
            "ROLLBACK_FAILED"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(StoreError::NotFound(Entity::User).http_status(), 404);
        assert_eq!(StoreError::InvalidTransfer("x".into()).http_status(), 400);
        assert_eq!(
            StoreError::ConstraintViolation {
                kind: ConstraintKind::Unique,
                constraint: "users_email_key".into(),
                message: "dup".into(),
            }
            .http_status(),
            403
        );
        assert_eq!(StoreError::Timeout("t".into()).http_status(), 504);
        assert_eq!(StoreError::Database("d".into()).http_status(), 500);
    }

    #[test]
    fn test_retryable_only_for_transient_kind() {
        assert!(StoreError::Transient("deadlock".into()).is_retryable());
        assert!(StoreError::Timeout("lock".into()).is_retryable());
        assert!(StoreError::Connection("reset".into()).is_retryable());
        assert!(!StoreError::NotFound(Entity::Account).is_retryable());
        assert!(!StoreError::InvalidTransfer("same".into()).is_retryable());
    }

    #[test]
    fn test_rollback_failure_keeps_both_causes() {
        let err = StoreError::rollback_failed(
            StoreError::NotFound(Entity::Account),
            StoreError::Connection("broken pipe".into()),
        );
        let text = err.to_string();
        assert!(text.contains("account not found"));
        assert!(text.contains("broken pipe"));

        let StoreError::RollbackFailed { original, rollback } = err else {
            panic!("expected RollbackFailed");
        };
        assert_eq!(*original, StoreError::NotFound(Entity::Account));
        assert_eq!(*rollback, StoreError::Connection("broken pipe".into()));
    }

    #[test]
    fn test_from_sqlx_row_not_found() {
        assert_eq!(
            StoreError::from_sqlx(sqlx::Error::RowNotFound, Entity::Transfer),
            StoreError::NotFound(Entity::Transfer)
        );
    }

    #[test]
    fn test_from_sqlx_pool_errors() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Timeout(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolClosed),
            StoreError::Connection(_)
        ));
    }
}
