use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The lifecycle state of an uploaded order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Uploaded, not yet seen by the accrual provider.
    New,
    /// Registered by the provider, scoring not finished.
    Processing,
    /// Rejected by the provider. Terminal.
    Invalid,
    /// Scored with a final accrual. Terminal.
    Processed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// An uploaded purchase order.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    /// The order number, unique across all users.
    pub number: String,
    /// The current lifecycle status.
    pub status: OrderStatus,
    /// Points assigned by the provider. Zero unless processed.
    pub accrual: Decimal,
    /// The owning user.
    pub username: String,
    /// When the order was uploaded.
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    pub fn new(number: impl Into<String>, username: impl Into<String>, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            number: number.into(),
            status: OrderStatus::New,
            accrual: Decimal::ZERO,
            username: username.into(),
            uploaded_at,
        }
    }
}

/// A spend of points against a user's balance.
#[derive(Debug, Clone, PartialEq)]
pub struct Withdrawal {
    /// The order number used as a reference.
    pub order: String,
    /// The amount withdrawn.
    pub sum: Decimal,
    /// The user who withdrew.
    pub username: String,
    /// When the withdrawal was accepted.
    pub processed_at: DateTime<Utc>,
}

/// A user's derived balance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Balance {
    /// Points available to spend.
    pub current: Decimal,
    /// Points spent so far.
    pub withdrawn: Decimal,
}

impl Balance {
    /// Builds a balance from the processed accrual total and the withdrawn total.
    pub fn from_sums(debit: Decimal, credit: Decimal) -> Self {
        Self {
            current: debit - credit,
            withdrawn: credit,
        }
    }
}

/// A registered user.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    /// The login name.
    pub login: String,
    /// Salted password hash.
    pub password_hash: String,
}

/// The result of attempting to claim an order number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOrderOutcome {
    /// A new order row was created.
    Accepted,
    /// The caller already uploaded this number.
    OwnedBySelf,
    /// Another user already uploaded this number.
    OwnedByOther,
}

/// Credentials submitted at registration or login.
#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub login: String,
    pub password: String,
}

/// A request to spend points.
#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    /// The order number to charge the spend to.
    pub order: String,
    /// The amount to withdraw.
    pub sum: Decimal,
}

/// An order as shown to its owner.
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub number: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        let accrual = (order.status == OrderStatus::Processed).then_some(order.accrual);
        Self {
            number: order.number,
            status: order.status,
            accrual,
            uploaded_at: order.uploaded_at,
        }
    }
}

/// A withdrawal as shown to its owner.
#[derive(Debug, Serialize)]
pub struct WithdrawalResponse {
    pub order: String,
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl From<Withdrawal> for WithdrawalResponse {
    fn from(w: Withdrawal) -> Self {
        Self {
            order: w.order,
            sum: w.sum,
            processed_at: w.processed_at,
        }
    }
}
