use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::{
    InsertOrder, LedgerStore, OrderStore, StoreError, UserStore, WithdrawGuard, WithdrawOutcome,
};
use crate::types::{Balance, Order, OrderStatus, User, Withdrawal};

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    orders: HashMap<String, Order>,
    withdrawals: Vec<Withdrawal>,
}

impl Tables {
    fn debit(&self, username: &str) -> Decimal {
        self.orders
            .values()
            .filter(|o| o.username == username && o.status == OrderStatus::Processed)
            .map(|o| o.accrual)
            .sum()
    }

    fn credit(&self, username: &str) -> Decimal {
        self.withdrawals
            .iter()
            .filter(|w| w.username == username)
            .map(|w| w.sum)
            .sum()
    }
}

/// In-process store with the same contract as [`super::PgStore`]. One lock
/// covers all tables, so every operation is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, login: &str) -> Result<Option<User>, StoreError> {
        Ok(self.tables.lock().await.users.get(login).cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.users.contains_key(&user.login) {
            return Ok(false);
        }
        tables.users.insert(user.login.clone(), user.clone());
        Ok(true)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn find_order(&self, number: &str) -> Result<Option<Order>, StoreError> {
        Ok(self.tables.lock().await.orders.get(number).cloned())
    }

    async fn insert_order_if_absent(&self, order: &Order) -> Result<InsertOrder, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.orders.get(&order.number) {
            return Ok(InsertOrder::Existing(existing.clone()));
        }
        tables.orders.insert(order.number.clone(), order.clone());
        Ok(InsertOrder::Inserted)
    }

    async fn update_order_status(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Decimal,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.orders.get_mut(number) {
            Some(order) if !order.status.is_terminal() => {
                order.status = status;
                order.accrual = accrual;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn orders_for_user(&self, username: &str) -> Result<Vec<Order>, StoreError> {
        let tables = self.tables.lock().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.username == username)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(orders)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn processed_accrual_sum(&self, username: &str) -> Result<Decimal, StoreError> {
        Ok(self.tables.lock().await.debit(username))
    }

    async fn withdrawn_sum(&self, username: &str) -> Result<Decimal, StoreError> {
        Ok(self.tables.lock().await.credit(username))
    }

    async fn insert_withdrawal_checked(
        &self,
        withdrawal: &Withdrawal,
        guard: WithdrawGuard<'_>,
    ) -> Result<WithdrawOutcome, StoreError> {
        let mut tables = self.tables.lock().await;
        let balance = Balance::from_sums(
            tables.debit(&withdrawal.username),
            tables.credit(&withdrawal.username),
        );
        if !guard(&balance, withdrawal) {
            return Ok(WithdrawOutcome::Rejected(balance));
        }
        tables.withdrawals.push(withdrawal.clone());
        Ok(WithdrawOutcome::Inserted)
    }

    async fn withdrawals_for_user(&self, username: &str) -> Result<Vec<Withdrawal>, StoreError> {
        let tables = self.tables.lock().await;
        let mut list: Vec<Withdrawal> = tables
            .withdrawals
            .iter()
            .filter(|w| w.username == username)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.processed_at.cmp(&b.processed_at));
        Ok(list)
    }
}
