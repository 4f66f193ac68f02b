//! Ledger schema
//!
//! One statement per constant: prepared statements cannot batch.
//! Constraint names are referenced by error classification and must stay stable.

use sqlx::PgPool;

pub const ACCOUNTS_OWNER_FKEY: &str = "accounts_owner_fkey";
pub const ACCOUNTS_OWNER_CURRENCY_KEY: &str = "accounts_owner_currency_key";
pub const TRANSFERS_IDEMPOTENCY_KEY: &str = "transfers_idempotency_key_key";

pub const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    username            VARCHAR PRIMARY KEY,
    hashed_password     VARCHAR NOT NULL,
    full_name           VARCHAR NOT NULL,
    email               VARCHAR NOT NULL CONSTRAINT users_email_key UNIQUE,
    password_changed_at TIMESTAMPTZ NOT NULL DEFAULT '1970-01-01 00:00:00Z',
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id         BIGSERIAL PRIMARY KEY,
    owner      VARCHAR NOT NULL CONSTRAINT accounts_owner_fkey REFERENCES users (username),
    balance    BIGINT NOT NULL DEFAULT 0,
    currency   VARCHAR NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT accounts_owner_currency_key UNIQUE (owner, currency)
)
"#;

pub const CREATE_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id         BIGSERIAL PRIMARY KEY,
    account_id BIGINT NOT NULL CONSTRAINT entries_account_id_fkey REFERENCES accounts (id),
    amount     BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id              BIGSERIAL PRIMARY KEY,
    from_account_id BIGINT NOT NULL CONSTRAINT transfers_from_account_id_fkey REFERENCES accounts (id),
    to_account_id   BIGINT NOT NULL CONSTRAINT transfers_to_account_id_fkey REFERENCES accounts (id),
    amount          BIGINT NOT NULL CONSTRAINT transfers_amount_positive CHECK (amount > 0),
    idempotency_key VARCHAR CONSTRAINT transfers_idempotency_key_key UNIQUE,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_from_account_id_idx ON transfers (from_account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_to_account_id_idx ON transfers (to_account_id)",
    "CREATE INDEX IF NOT EXISTS transfers_from_to_idx ON transfers (from_account_id, to_account_id)",
];

/// Create tables and indexes if they do not exist yet
pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    tracing::info!("Initializing ledger schema...");

    for (name, ddl) in [
        ("users", CREATE_USERS_TABLE),
        ("accounts", CREATE_ACCOUNTS_TABLE),
        ("entries", CREATE_ENTRIES_TABLE),
        ("transfers", CREATE_TRANSFERS_TABLE),
    ] {
        sqlx::query(ddl).execute(pool).await.inspect_err(|e| {
            tracing::error!(table = name, error = %e, "Failed to create table");
        })?;
    }

    for ddl in CREATE_INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::info!("Ledger schema initialized successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_names_present_in_ddl() {
        assert!(CREATE_ACCOUNTS_TABLE.contains(ACCOUNTS_OWNER_FKEY));
        assert!(CREATE_ACCOUNTS_TABLE.contains(ACCOUNTS_OWNER_CURRENCY_KEY));
        assert!(CREATE_TRANSFERS_TABLE.contains(TRANSFERS_IDEMPOTENCY_KEY));
    }

    #[test]
    fn test_single_statement_per_constant() {
        for ddl in [
            CREATE_USERS_TABLE,
            CREATE_ACCOUNTS_TABLE,
            CREATE_ENTRIES_TABLE,
            CREATE_TRANSFERS_TABLE,
        ] {
            assert!(!ddl.contains(';'));
        }
    }
}
