use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use points_market::{
    AppState,
    accrual::HttpAccrualClient,
    auth::TokenSigner,
    config::{Cli, Config},
    cooldown::CooldownGate,
    init_pool, init_router,
    reconcile::{Reconciler, ReconcilerConfig},
    store::PgStore,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(&cli).context("Failed to load configuration")?;
    info!(
        run_address = %config.run_address,
        accrual = %config.accrual_system_address,
        "configuration loaded"
    );

    let pool = init_pool(&config).await?;
    let store = Arc::new(PgStore::new(pool));

    let provider = Arc::new(HttpAccrualClient::new(
        config.accrual_system_address.clone(),
        config.accrual_timeout(),
    )?);
    let gate = Arc::new(CooldownGate::new(config.accrual_cooldown()));
    let (reconciler, workers) = Reconciler::start(
        provider,
        store.clone(),
        gate,
        ReconcilerConfig {
            workers: config.reconcile_workers,
            queue: config.reconcile_queue,
            max_attempts: config.reconcile_max_attempts,
            retry_delay: config.accrual_cooldown(),
        },
    );

    let secret = match &config.auth_secret {
        Some(secret) => secret.clone(),
        None => {
            warn!("AUTH_SECRET not set, sessions will not survive a restart");
            Uuid::new_v4().to_string()
        }
    };

    let app_state = AppState {
        users: store.clone(),
        orders: store.clone(),
        ledger: store,
        reconciler: reconciler.clone(),
        signer: TokenSigner::new(secret),
    };
    let app = init_router(app_state);

    let listener = TcpListener::bind(&config.run_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.run_address))?;
    info!("Listening on {}", config.run_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped, waiting for reconcile workers");
    reconciler.shutdown();
    workers.join().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
