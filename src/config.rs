use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub pool: PoolSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path (or sqlite: URL) of the configuration record store
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    pub max_size: usize,
    pub min_idle: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives for the tracing subscriber
    pub level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("storage.url", "./registry.db")?
            .set_default("pool.max_size", 16)?
            .set_default("pool.min_idle", 2)?
            .set_default("logging.level", "info")?;

        // Load from environment variables
        if let Ok(storage_url) = env::var("REGISTRY_DATABASE_URL") {
            builder = builder.set_override("storage.url", storage_url)?;
        }

        if let Ok(max_size) = env::var("POOL_MAX_SIZE") {
            builder = builder
                .set_override("pool.max_size", max_size.parse::<i64>().unwrap_or(16))?;
        }

        if let Ok(min_idle) = env::var("POOL_MIN_IDLE") {
            builder = builder.set_override("pool.min_idle", min_idle.parse::<i64>().unwrap_or(2))?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        // Try to load from .env file
        let _ = dotenv::dotenv();

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_env().unwrap();
        assert!(!config.storage.url.is_empty());
        assert!(config.pool.max_size > 0);
        assert!(!config.logging.level.is_empty());
    }
}
