//! Persistence seams for users, orders and withdrawals.

mod memory;
mod postgres;

use async_trait::async_trait;
use rust_decimal::Decimal;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::types::{Balance, Order, OrderStatus, User, Withdrawal};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result of claiming an order number.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOrder {
    Inserted,
    /// The number was already taken; this is the row that holds it.
    Existing(Order),
}

/// Result of a guarded withdrawal.
#[derive(Debug, Clone, PartialEq)]
pub enum WithdrawOutcome {
    Inserted,
    /// The guard refused; carries the balance it was shown.
    Rejected(Balance),
}

/// Decides whether a withdrawal fits the balance computed under the user's lock.
pub type WithdrawGuard<'a> = &'a (dyn Fn(&Balance, &Withdrawal) -> bool + Send + Sync);

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, login: &str) -> Result<Option<User>, StoreError>;
    /// Returns `false` when the login is already registered.
    async fn insert_user(&self, user: &User) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_order(&self, number: &str) -> Result<Option<Order>, StoreError>;
    /// Inserts `order` unless its number exists. Never overwrites.
    async fn insert_order_if_absent(&self, order: &Order) -> Result<InsertOrder, StoreError>;
    /// Sets status and accrual unless the row is already terminal.
    /// Returns whether a row changed.
    async fn update_order_status(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Decimal,
    ) -> Result<bool, StoreError>;
    /// Newest first.
    async fn orders_for_user(&self, username: &str) -> Result<Vec<Order>, StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Sum of accruals over the user's processed orders.
    async fn processed_accrual_sum(&self, username: &str) -> Result<Decimal, StoreError>;
    async fn withdrawn_sum(&self, username: &str) -> Result<Decimal, StoreError>;
    /// Recomputes the balance while holding the user's ledger lock, asks
    /// `guard`, and inserts only if it agrees.
    async fn insert_withdrawal_checked(
        &self,
        withdrawal: &Withdrawal,
        guard: WithdrawGuard<'_>,
    ) -> Result<WithdrawOutcome, StoreError>;
    /// Oldest first.
    async fn withdrawals_for_user(&self, username: &str) -> Result<Vec<Withdrawal>, StoreError>;
}
