// ============================================================================
// Transport Configuration
// ============================================================================

use crate::constants::*;
use crate::env_parse;
use std::time::Duration;

/// Outbound HTTP transport the delivery executor posts to
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub url: Option<String>,
    pub auth_token: Option<String>,
    pub timeout_ms: u64,
}

impl TransportConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            url: std::env::var("TRANSPORT_URL").ok().filter(|u| !u.is_empty()),
            auth_token: std::env::var("TRANSPORT_AUTH_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            timeout_ms: env_parse("TRANSPORT_TIMEOUT_MS", DEFAULT_TRANSPORT_TIMEOUT_MS),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
