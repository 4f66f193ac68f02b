//! Transfer Engine
//!
//! Moves funds between two accounts inside one unit of work:
//!
//! ```text
//! transfers  INSERT (from, to, amount)
//! entries    INSERT (from, -amount)
//! entries    INSERT (to,   +amount)
//! accounts   balance += delta   ── lower account id first
//! accounts   balance += delta   ── higher account id second
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Ascending lock order**: balance updates take row locks, and the row
//!    with the lower `AccountId` is always updated first, whichever side of
//!    the transfer it is. A→B and B→A running together therefore queue on
//!    the same first row instead of each holding what the other needs.
//! 2. **Relative updates only**: balances change through
//!    `add_account_balance`, never by writing back a value computed outside
//!    the lock.
//! 3. **No partial effects**: any error aborts the whole unit of work; the
//!    caller rolls it back and gets the error unchanged. No retries here.

use tracing::debug;

use super::error::{StoreError, StoreResult};
use super::querier::Querier;
use crate::core_types::{AccountId, Amount};
use crate::models::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, TransferTxParams,
    TransferTxResult,
};

/// Reject transfers that must never open a unit of work
pub fn validate(params: &TransferTxParams) -> StoreResult<()> {
    if params.amount <= 0 {
        return Err(StoreError::InvalidTransfer(format!(
            "amount must be positive, got {}",
            params.amount
        )));
    }
    if params.from_account_id == params.to_account_id {
        return Err(StoreError::InvalidTransfer(format!(
            "source and destination are the same account ({})",
            params.from_account_id
        )));
    }
    Ok(())
}

/// Run the five transfer writes against `q`, which must be scoped to an open
/// unit of work. Commit and rollback belong to the caller.
pub async fn transfer_tx<Q>(q: &mut Q, params: TransferTxParams) -> StoreResult<TransferTxResult>
where
    Q: Querier + ?Sized,
{
    validate(&params)?;
    let TransferTxParams {
        from_account_id,
        to_account_id,
        amount,
        idempotency_key,
    } = params;

    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id,
            to_account_id,
            amount,
            idempotency_key,
        })
        .await?;
    debug!(transfer_id = transfer.id, "Transfer row created");

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: from_account_id,
            amount: -amount,
        })
        .await?;
    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: to_account_id,
            amount,
        })
        .await?;
    debug!(
        transfer_id = transfer.id,
        from_entry = from_entry.id,
        to_entry = to_entry.id,
        "Ledger entries created"
    );

    let (from_account, to_account) = if from_account_id < to_account_id {
        add_money(q, (from_account_id, -amount), (to_account_id, amount)).await?
    } else {
        let (to_account, from_account) =
            add_money(q, (to_account_id, amount), (from_account_id, -amount)).await?;
        (from_account, to_account)
    };

    Ok(TransferTxResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

/// Apply two balance deltas in the given order, returning the updated rows in
/// the same order
async fn add_money<Q>(
    q: &mut Q,
    (first_id, first_delta): (AccountId, Amount),
    (second_id, second_delta): (AccountId, Amount),
) -> StoreResult<(Account, Account)>
where
    Q: Querier + ?Sized,
{
    let first = q
        .add_account_balance(AddAccountBalanceParams {
            id: first_id,
            delta: first_delta,
        })
        .await?;
    debug!(account_id = first_id, balance = first.balance, "Row locked and updated");

    let second = q
        .add_account_balance(AddAccountBalanceParams {
            id: second_id,
            delta: second_delta,
        })
        .await?;
    debug!(account_id = second_id, balance = second.balance, "Row locked and updated");

    Ok((first, second))
}
