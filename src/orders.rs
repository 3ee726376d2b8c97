use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::store::{InsertOrder, OrderStore, StoreError};
use crate::luhn;
use crate::types::{AddOrderOutcome, Order};

/// Widest order number the `orders` and `withdrawals` tables hold.
pub const MAX_NUMBER_LEN: usize = 42;

/// Whether `number` may be uploaded or used for a withdrawal.
pub fn is_acceptable_number(number: &str) -> bool {
    number.len() <= MAX_NUMBER_LEN && luhn::is_valid(number)
}

/// Claims `number` for `username`.
///
/// An existing number is never overwritten; it is reported as belonging to
/// the caller or to someone else.
pub async fn add_new_order(
    store: &dyn OrderStore,
    number: &str,
    username: &str,
    now: DateTime<Utc>,
) -> Result<AddOrderOutcome, StoreError> {
    let order = Order::new(number, username, now);
    match store.insert_order_if_absent(&order).await? {
        InsertOrder::Inserted => {
            info!(order = %number, %username, "order accepted");
            Ok(AddOrderOutcome::Accepted)
        }
        InsertOrder::Existing(existing) if existing.username == username => {
            debug!(order = %number, %username, "order re-submitted by owner");
            Ok(AddOrderOutcome::OwnedBySelf)
        }
        InsertOrder::Existing(existing) => {
            info!(order = %number, %username, owner = %existing.username, "order already claimed");
            Ok(AddOrderOutcome::OwnedByOther)
        }
    }
}
