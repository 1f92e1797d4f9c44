// ============================================================================
// Delivery Executor
// ============================================================================
//
// Thin boundary to the external transport. One call = exactly one attempt;
// the worker owns every retry, backoff and DLQ decision. The executor only
// classifies a failure as transient (retry later) or permanent (DLQ now).
//
// HttpTransport is the concrete adapter: it POSTs {recipient, payload} as JSON
// to a provider endpoint.
//
//   2xx                         -> Ok(provider_ref)
//   408, 429, 5xx               -> Transient
//   other 4xx / 3xx             -> Permanent
//   timeout, connect, I/O error -> Transient
//
// ============================================================================

use async_trait::async_trait;
use courier_config::TransportConfig;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Network, timeout or provider-side failure; worth retrying
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Invalid recipient or payload; retrying cannot help
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            DeliveryError::Transient(reason) | DeliveryError::Permanent(reason) => reason,
        }
    }
}

/// Successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Provider's reference for the sent message
    pub provider_ref: String,
}

#[async_trait]
pub trait DeliveryExecutor: Send + Sync {
    async fn send(&self, recipient: &str, payload: &Value) -> Result<DeliveryReceipt, DeliveryError>;
}

#[derive(Serialize)]
struct SendRequest<'a> {
    recipient: &'a str,
    payload: &'a Value,
}

/// JSON-over-HTTP transport adapter
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("TRANSPORT_URL must be set"))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            url,
            auth_token: config.auth_token.clone(),
        })
    }
}

/// Map a provider status code onto the failure taxonomy
pub fn classify_status(status: StatusCode) -> Option<DeliveryError> {
    if status.is_success() {
        return None;
    }
    let reason = format!("provider responded {}", status);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Some(DeliveryError::Transient(reason))
    } else {
        Some(DeliveryError::Permanent(reason))
    }
}

fn provider_ref(status: StatusCode, body: &Value) -> String {
    ["id", "message_id"]
        .iter()
        .find_map(|field| body.get(*field))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| format!("http-{}", status.as_u16()))
}

#[async_trait]
impl DeliveryExecutor for HttpTransport {
    async fn send(&self, recipient: &str, payload: &Value) -> Result<DeliveryReceipt, DeliveryError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&SendRequest { recipient, payload });
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                DeliveryError::Permanent(format!("invalid request: {}", e))
            } else {
                DeliveryError::Transient(format!("transport error: {}", e))
            }
        })?;

        let status = response.status();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        // Provider bodies are optional; a non-JSON 2xx is still a success
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(DeliveryReceipt {
            provider_ref: provider_ref(status, &body),
        })
    }
}
