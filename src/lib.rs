// ============================================================================
// Courier - durable outbound chat reply delivery
// ============================================================================
//
// Producers enqueue replies per destination; delivery workers in any number
// of processes drain them through a shared store (Redis Streams + consumer
// groups), rate-limited per destination, with bounded retries and a
// dead-letter stream. The only coordination point between workers is the
// store.
//
// ============================================================================

pub mod admin;
pub mod context;
pub mod delivery_worker;
pub mod error;
pub mod message;
pub mod metrics;
pub mod routes;
pub mod store;
pub mod utils;

pub use courier_config as config;

use anyhow::{Context, Result};
use context::AppContext;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Serve the admin / producer HTTP surface until `shutdown` resolves
pub async fn run_admin_server(
    listener: TcpListener,
    app_context: Arc<AppContext>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read listener address")?;
    tracing::info!("Admin API listening on http://{}", addr);

    axum::serve(listener, routes::create_router(app_context))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Admin server failed")
}
