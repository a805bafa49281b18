use std::sync::Arc;

use tracing::{error, info};

mod config;
mod error;
mod models;
mod services;
mod storage;

use config::Config;
use services::factory::{PooledDataSourceFactory, PooledSessionFactoryFactory};
use services::registry::DatabaseRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (RUST_LOG lands in logging.level)
    let config = Config::from_env()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .init();

    // Open the configuration record store
    let store = Arc::new(
        storage::SqliteDatabaseStore::new(&config.storage.url)
            .await
            .map_err(|e| {
                error!("Failed to open configuration store: {}", e);
                e
            })?,
    );

    let registry = Arc::new(DatabaseRegistry::new(
        store,
        Arc::new(PooledDataSourceFactory::with_config(
            config.pool.max_size,
            config.pool.min_idle,
        )),
        Arc::new(PooledSessionFactoryFactory),
    ));

    info!(
        "Database registry running ({} configurations)",
        registry.list(None).await?.len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    registry.stop().await;

    Ok(())
}
