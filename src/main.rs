//! Ledger Bank - operator CLI
//!
//! ```text
//! ledger_bank [--env dev] --migrate
//! ledger_bank [--env dev] --health
//! ledger_bank [--env dev] --account <id>
//! ledger_bank [--env dev] --transfer <from> <to> <amount>
//! ```
//!
//! Output is JSON on stdout; logs go to the configured log file.

use std::sync::Arc;

use anyhow::{Context, Result, bail};

use ledger_bank::config::AppConfig;
use ledger_bank::db::Database;
use ledger_bank::store::{LedgerStore, PgBackend, Store};
use ledger_bank::transfer_service::TransferService;
use ledger_bank::{AccountId, Amount};

// ============================================================
// ARGUMENTS
// ============================================================

enum Command {
    Migrate,
    Health,
    Account(AccountId),
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: Amount,
    },
}

fn get_env(args: &[String]) -> String {
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn arg_value<'a>(args: &'a [String], flag: &str, n: usize) -> Option<&'a [String]> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1..pos + 1 + n)
}

fn parse_id(raw: &str, what: &str) -> Result<i64> {
    raw.parse()
        .with_context(|| format!("Invalid {what}: '{raw}'"))
}

fn parse_command(args: &[String]) -> Result<Command> {
    if args.iter().any(|a| a == "--migrate") {
        return Ok(Command::Migrate);
    }
    if args.iter().any(|a| a == "--health") {
        return Ok(Command::Health);
    }
    if args.iter().any(|a| a == "--account") {
        let Some([id]) = arg_value(args, "--account", 1) else {
            bail!("--account requires <id>");
        };
        return Ok(Command::Account(parse_id(id, "account id")?));
    }
    if args.iter().any(|a| a == "--transfer") {
        let Some([from, to, amount]) = arg_value(args, "--transfer", 3) else {
            bail!("--transfer requires <from> <to> <amount>");
        };
        return Ok(Command::Transfer {
            from: parse_id(from, "source account id")?,
            to: parse_id(to, "destination account id")?,
            amount: parse_id(amount, "amount")?,
        });
    }
    bail!("usage: ledger_bank [--env <env>] --migrate | --health | --account <id> | --transfer <from> <to> <amount>")
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let env = get_env(&args);
    let command = parse_command(&args)?;

    let app_config = AppConfig::load(&env)?;
    let _log_guard = ledger_bank::logging::init_logging(&app_config);
    tracing::info!("Starting ledger_bank in {} mode", env);

    let db = Database::connect(&app_config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;

    match command {
        Command::Migrate => {
            db.init_schema().await.context("Schema migration failed")?;
            println!(r#"{{"status":"migrated"}}"#);
        }
        Command::Health => {
            db.health_check().await.context("Health check failed")?;
            println!(r#"{{"status":"ok"}}"#);
        }
        Command::Account(id) => {
            let store = build_store(&db, &app_config);
            let account = store.get_account(id).await?;
            println!("{}", serde_json::to_string_pretty(&account)?);
        }
        Command::Transfer { from, to, amount } => {
            // Same checks as any other caller: existence and matching currency
            let service = TransferService::new(build_store(&db, &app_config));
            let result = service
                .create_transfer_from_source(from, to, amount)
                .await
                .inspect_err(|e| {
                    tracing::error!(code = e.code(), status = e.http_status(), "{}", e)
                })?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

fn build_store(db: &Database, config: &AppConfig) -> Arc<dyn Store> {
    let backend = PgBackend::new(db, config.database.lock_timeout());
    Arc::new(LedgerStore::new(backend).with_tx_timeout(config.database.tx_timeout()))
}
