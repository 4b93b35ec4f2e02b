use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dca_grid_bot::db::Database;
use dca_grid_bot::trading::recovery::BotRecoveryService;
use dca_grid_bot::trading::supervisor::{BinanceSessionFactory, BotEngine};
use dca_grid_bot::utils::config::Config;
use dca_grid_bot::utils::crypto::CredentialCipher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    config.validate()?;
    info!(
        "🤖 DCA grid bot starting ({})",
        if config.is_production() { "production" } else { "sandbox" }
    );

    let db = Database::connect(&config.database_url).await?;

    let cipher = CredentialCipher::new(&config.encryption_master_key, &config.encryption_salt);
    let factory = Arc::new(BinanceSessionFactory::new(cipher, !config.is_production()));
    let engine = BotEngine::new(db, factory);

    let recovery = BotRecoveryService::new(engine.clone());
    let stats = recovery.recover_all_active_bots().await;
    info!(
        "Recovery done: {} recovered, {} failed in {:.2}s",
        stats.recovered, stats.failed, stats.duration_seconds
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping all supervisors");
    engine
        .registry()
        .stop_all(Duration::from_secs(config.shutdown_timeout_secs))
        .await;
    info!("Shutdown complete");

    Ok(())
}
