// ============================================================================
// Courier Config - Centralized configuration management
// ============================================================================
//
// Configuration for the delivery worker and its admin surface.
// Loaded from environment variables (and an optional .env file) with
// sensible defaults for everything except secrets.
//
// ============================================================================

mod admin;
mod constants;
mod logging;
mod rate_limit;
mod redis;
mod transport;
mod worker;

pub use admin::AdminConfig;
pub use constants::NEAR_CAPACITY_RATIO;
pub use logging::LoggingConfig;
pub use rate_limit::RateLimitConfig;
pub use redis::{StoreBackend, StoreConfig};
pub use transport::TransportConfig;
pub use worker::QueueConfig;

use anyhow::Result;

/// Main configuration structure for Courier services
#[derive(Clone, Debug)]
pub struct Config {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub transport: TransportConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            store: StoreConfig::from_env()?,
            queue: QueueConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            transport: TransportConfig::from_env(),
            admin: AdminConfig::from_env(),
            logging: LoggingConfig::from_env()?,
        };
        config.validate()?;

        Ok(config)
    }

    /// Reject combinations the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        self.rate_limit.validate()?;
        Ok(())
    }
}

/// Read and parse an environment variable, falling back to `default` when it is
/// missing or unparsable.
pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key = key, value = %raw, "Invalid value in environment, using default");
                default
            }
        },
        Err(_) => default,
    }
}
