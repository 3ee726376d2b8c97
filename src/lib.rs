//! Loyalty points market: order uploads, accrual reconciliation and a
//! withdrawal ledger.

pub mod accrual;
mod api;
pub mod auth;
pub mod config;
pub mod cooldown;
mod error;
pub mod ledger;
pub mod luhn;
pub mod orders;
pub mod reconcile;
mod responses;
pub mod store;
pub mod types;

use anyhow::Context;
use anyhow::Result;
pub use api::{AppState, init_router};
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::config::Config;

/// Initializes the database pool and brings the schema up to date.
pub async fn init_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_uri)
        .await
        .context("Failed to connect to Postgres")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    Ok(pool)
}
