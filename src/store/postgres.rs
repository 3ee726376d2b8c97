use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use super::{
    InsertOrder, LedgerStore, OrderStore, StoreError, UserStore, WithdrawGuard, WithdrawOutcome,
};
use crate::types::{Balance, Order, OrderStatus, User, Withdrawal};

/// Postgres-backed store. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    login: String,
    password_hash: String,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    number: String,
    status: String,
    accrual: Decimal,
    username: String,
    uploaded_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status: OrderStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("order {}: {e}", row.number)))?;
        Ok(Order {
            number: row.number,
            status,
            accrual: row.accrual,
            username: row.username,
            uploaded_at: row.uploaded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    number: String,
    sum: Decimal,
    username: String,
    processed_at: DateTime<Utc>,
}

impl From<WithdrawalRow> for Withdrawal {
    fn from(row: WithdrawalRow) -> Self {
        Withdrawal {
            order: row.number,
            sum: row.sum,
            username: row.username,
            processed_at: row.processed_at,
        }
    }
}

async fn debit(conn: &mut PgConnection, username: &str) -> Result<Decimal, sqlx::Error> {
    sqlx::query_scalar::<_, Decimal>(
        r#"SELECT COALESCE(SUM(accrual), 0) FROM orders WHERE username = $1 AND status = 'PROCESSED'"#,
    )
    .bind(username)
    .fetch_one(conn)
    .await
}

async fn credit(conn: &mut PgConnection, username: &str) -> Result<Decimal, sqlx::Error> {
    sqlx::query_scalar::<_, Decimal>(r#"SELECT COALESCE(SUM(sum), 0) FROM withdrawals WHERE username = $1"#)
        .bind(username)
        .fetch_one(conn)
        .await
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_user(&self, login: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(r#"SELECT login, password_hash FROM mart_users WHERE login = $1"#)
            .bind(login)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| User {
            login: r.login,
            password_hash: r.password_hash,
        }))
    }

    async fn insert_user(&self, user: &User) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"INSERT INTO mart_users (login, password_hash) VALUES ($1, $2)
               ON CONFLICT (login) DO NOTHING"#,
        )
        .bind(&user.login)
        .bind(&user.password_hash)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn find_order(&self, number: &str) -> Result<Option<Order>, StoreError> {
        sqlx::query_as::<_, OrderRow>(
            r#"SELECT number, status, accrual, username, uploaded_at FROM orders WHERE number = $1"#,
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    async fn insert_order_if_absent(&self, order: &Order) -> Result<InsertOrder, StoreError> {
        let res = sqlx::query(
            r#"INSERT INTO orders (number, status, accrual, username, uploaded_at) VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (number) DO NOTHING"#,
        )
        .bind(&order.number)
        .bind(order.status.as_str())
        .bind(order.accrual)
        .bind(&order.username)
        .bind(order.uploaded_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(InsertOrder::Inserted);
        }
        match self.find_order(&order.number).await? {
            Some(existing) => Ok(InsertOrder::Existing(existing)),
            None => Err(StoreError::Corrupt(format!(
                "order {} conflicted but cannot be found",
                order.number
            ))),
        }
    }

    async fn update_order_status(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Decimal,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"UPDATE orders SET status = $1, accrual = $2
               WHERE number = $3 AND status NOT IN ('INVALID', 'PROCESSED')"#,
        )
        .bind(status.as_str())
        .bind(accrual)
        .bind(number)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn orders_for_user(&self, username: &str) -> Result<Vec<Order>, StoreError> {
        sqlx::query_as::<_, OrderRow>(
            r#"SELECT number, status, accrual, username, uploaded_at FROM orders
               WHERE username = $1 ORDER BY uploaded_at DESC"#,
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Order::try_from)
        .collect()
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn processed_accrual_sum(&self, username: &str) -> Result<Decimal, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(debit(&mut *conn, username).await?)
    }

    async fn withdrawn_sum(&self, username: &str) -> Result<Decimal, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(credit(&mut *conn, username).await?)
    }

    async fn insert_withdrawal_checked(
        &self,
        withdrawal: &Withdrawal,
        guard: WithdrawGuard<'_>,
    ) -> Result<WithdrawOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // serialises withdrawals per user until commit/rollback
        sqlx::query(r#"SELECT pg_advisory_xact_lock(hashtext($1))"#)
            .bind(&withdrawal.username)
            .execute(tx.as_mut())
            .await?;

        let balance = Balance::from_sums(
            debit(tx.as_mut(), &withdrawal.username).await?,
            credit(tx.as_mut(), &withdrawal.username).await?,
        );
        if !guard(&balance, withdrawal) {
            tx.rollback().await?;
            return Ok(WithdrawOutcome::Rejected(balance));
        }

        sqlx::query(
            r#"INSERT INTO withdrawals (number, sum, username, processed_at) VALUES ($1, $2, $3, $4)"#,
        )
        .bind(&withdrawal.order)
        .bind(withdrawal.sum)
        .bind(&withdrawal.username)
        .bind(withdrawal.processed_at)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;
        debug!(username = %withdrawal.username, sum = %withdrawal.sum, "withdrawal stored");
        Ok(WithdrawOutcome::Inserted)
    }

    async fn withdrawals_for_user(&self, username: &str) -> Result<Vec<Withdrawal>, StoreError> {
        let rows = sqlx::query_as::<_, WithdrawalRow>(
            r#"SELECT number, sum, username, processed_at FROM withdrawals
               WHERE username = $1 ORDER BY processed_at ASC"#,
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Withdrawal::from).collect())
    }
}
