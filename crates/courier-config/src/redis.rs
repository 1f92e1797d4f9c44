// ============================================================================
// Store Configuration
// ============================================================================

use crate::constants::*;
use crate::env_parse;

/// Which shared store backs the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    /// Redis Streams + consumer groups (production, multi-process)
    Redis,
    /// In-process store, only meaningful for a single process (development, tests)
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => anyhow::bail!("Unknown STORE_BACKEND '{}' (expected redis or memory)", other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Namespace for every key: "{prefix}:{destination}:..."
    pub key_prefix: String,
    pub consumer_group: String,
}

impl StoreConfig {
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        let backend = std::env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "redis".to_string())
            .parse()?;

        Ok(Self {
            backend,
            redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            key_prefix: env_parse("REDIS_KEY_PREFIX", DEFAULT_KEY_PREFIX.to_string()),
            consumer_group: env_parse("CONSUMER_GROUP", DEFAULT_CONSUMER_GROUP.to_string()),
        })
    }
}
