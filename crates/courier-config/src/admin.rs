// ============================================================================
// Admin Surface Configuration
// ============================================================================

use crate::constants::*;
use crate::env_parse;

#[derive(Clone, Debug)]
pub struct AdminConfig {
    pub bind_address: String,
    pub port: u16,
    /// When set, admin and producer routes require `Authorization: Bearer <token>`
    pub bearer_token: Option<String>,
}

impl AdminConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            bind_address: env_parse("BIND_ADDRESS", DEFAULT_BIND_ADDRESS.to_string()),
            port: env_parse("ADMIN_PORT", DEFAULT_ADMIN_PORT),
            bearer_token: std::env::var("ADMIN_BEARER_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_ADMIN_PORT,
            bearer_token: None,
        }
    }
}
