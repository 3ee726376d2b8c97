//! Derived balances and the withdrawal guard.

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::store::{LedgerStore, StoreError, WithdrawOutcome};
use crate::types::{Balance, Withdrawal};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds: balance {current}, requested {requested}")]
    InsufficientFunds { current: Decimal, requested: Decimal },
    #[error("withdrawal sum must be positive")]
    NonPositiveSum,
    #[error("withdrawal sum {0} has more than two decimal places")]
    TooPrecise(Decimal),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Computes the user's balance from two independent aggregate reads.
///
/// The reads are not isolated from each other; a reconciliation or withdrawal
/// landing between them shows up in one sum and not the other.
pub async fn get_balance(store: &dyn LedgerStore, username: &str) -> Result<Balance, StoreError> {
    let debit = store.processed_accrual_sum(username).await?;
    let credit = store.withdrawn_sum(username).await?;
    debug!(%username, %debit, %credit, "balance computed");
    Ok(Balance::from_sums(debit, credit))
}

/// Whether `sum` may be taken out of `balance`.
pub fn covers(balance: &Balance, sum: Decimal) -> bool {
    balance.current > Decimal::ZERO && sum <= balance.current
}

/// Records a withdrawal if the user's balance covers it.
///
/// The balance is recomputed under the store's per-user lock, so concurrent
/// withdrawals by the same user cannot jointly overdraw.
pub async fn process_withdraw(store: &dyn LedgerStore, withdrawal: &Withdrawal) -> Result<(), LedgerError> {
    if withdrawal.sum <= Decimal::ZERO {
        return Err(LedgerError::NonPositiveSum);
    }
    if withdrawal.sum.normalize().scale() > 2 {
        return Err(LedgerError::TooPrecise(withdrawal.sum));
    }

    let guard = |balance: &Balance, w: &Withdrawal| covers(balance, w.sum);
    match store.insert_withdrawal_checked(withdrawal, &guard).await? {
        WithdrawOutcome::Inserted => {
            info!(username = %withdrawal.username, order = %withdrawal.order, sum = %withdrawal.sum, "withdrawal accepted");
            Ok(())
        }
        WithdrawOutcome::Rejected(balance) => {
            info!(username = %withdrawal.username, sum = %withdrawal.sum, current = %balance.current, "withdrawal rejected");
            Err(LedgerError::InsufficientFunds {
                current: balance.current,
                requested: withdrawal.sum,
            })
        }
    }
}
