use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use config::{ConfigError, Environment};
use serde::Deserialize;

/// Command-line overrides; each flag wins over its environment variable.
#[derive(Debug, Default, Parser)]
#[command(name = "points-market", about = "Loyalty points market")]
pub struct Cli {
    /// Address to listen on (RUN_ADDRESS).
    #[arg(short = 'a')]
    pub run_address: Option<String>,
    /// Postgres connection string (DATABASE_URI).
    #[arg(short = 'd')]
    pub database_uri: Option<String>,
    /// Base URL of the accrual provider (ACCRUAL_SYSTEM_ADDRESS).
    #[arg(short = 'r')]
    pub accrual_system_address: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub run_address: String,
    pub database_uri: String,
    pub accrual_system_address: String,
    /// Signs session tokens. A random one is used when unset.
    pub auth_secret: Option<String>,
    pub accrual_timeout_secs: u64,
    pub accrual_cooldown_secs: u64,
    pub reconcile_workers: usize,
    pub reconcile_queue: usize,
    pub reconcile_max_attempts: u32,
    pub db_max_connections: u32,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        Self::from_sources(Environment::default(), cli)
    }

    fn from_sources(env: Environment, cli: &Cli) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .set_default("run_address", "")?
            .set_default("database_uri", "")?
            .set_default("accrual_system_address", "")?
            .set_default("accrual_timeout_secs", 10)?
            .set_default("accrual_cooldown_secs", 60)?
            .set_default("reconcile_workers", 4)?
            .set_default("reconcile_queue", 1024)?
            .set_default("reconcile_max_attempts", 10)?
            .set_default("db_max_connections", 8)?
            .add_source(env)
            .set_override_option("run_address", cli.run_address.clone())?
            .set_override_option("database_uri", cli.database_uri.clone())?
            .set_override_option("accrual_system_address", cli.accrual_system_address.clone())?
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Builds from an explicit variable map instead of the process environment.
    pub fn from_map(vars: HashMap<String, String>, cli: &Cli) -> Result<Self, ConfigError> {
        Self::from_sources(Environment::default().source(Some(vars)), cli)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("RUN_ADDRESS", &self.run_address),
            ("DATABASE_URI", &self.database_uri),
            ("ACCRUAL_SYSTEM_ADDRESS", &self.accrual_system_address),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Message(format!("{key} is not set")));
            }
        }
        if self.reconcile_workers == 0 || self.reconcile_queue == 0 {
            return Err(ConfigError::Message(
                "RECONCILE_WORKERS and RECONCILE_QUEUE must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn accrual_timeout(&self) -> Duration {
        Duration::from_secs(self.accrual_timeout_secs)
    }

    pub fn accrual_cooldown(&self) -> Duration {
        Duration::from_secs(self.accrual_cooldown_secs)
    }
}
