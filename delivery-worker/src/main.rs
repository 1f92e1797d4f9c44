// ============================================================================
// Delivery Worker - Redis Streams consumer
// ============================================================================
//
// Drains the delivery streams of the configured destinations and hands each
// message to the HTTP transport.
//
// Flow per destination:
// 1. Register an ephemeral consumer ("{prefix}-{pid}-{start_ms}") in the
//    destination's consumer group
// 2. Loop: claim orphaned entries, process owned entries, read new entries
// 3. Each entry: dedup check -> rate-limit token -> send -> ack / retry / DLQ
//
// Guarantees:
// - At-least-once delivery; delivered markers narrow duplicates to the
//   send -> mark window
// - Entries held by a crashed worker are reclaimed after the idle threshold
// - A message leaves the stream only when delivered or dead-lettered
//
// The same process serves the admin API (health, cursor resets, forced claim,
// DLQ management) and the producer enqueue endpoint.
//
// ============================================================================

use anyhow::{Context, Result};
use courier::config::{Config, StoreBackend};
use courier::context::AppContext;
use courier::delivery_worker::{
    DeliveryExecutor, HttpTransport, Worker, WorkerState, consumer_name,
};
use courier::store::{DeliveryStore, MemoryStore, RedisStore};
use courier::utils::mask_redis_url;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    let config = Arc::new(config);

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.logging.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Delivery Worker Starting (Redis Streams) ===");
    info!("Destinations: {}", config.queue.destinations.join(", "));
    info!("Consumer Group: {}", config.store.consumer_group);
    info!(
        "Rate limit: {} tokens/s, capacity {}",
        config.rate_limit.tokens_per_second, config.rate_limit.bucket_capacity
    );

    let executor: Arc<dyn DeliveryExecutor> =
        Arc::new(HttpTransport::new(&config.transport).context("Failed to create HTTP transport")?);

    // Memory mode shares one store between workers and the admin API
    let shared_memory: Option<Arc<dyn DeliveryStore>> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("STORE_BACKEND=memory: queue state is process-local and lost on exit");
            Some(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            info!(
                "Connecting to Redis at: {}",
                mask_redis_url(&config.store.redis_url)
            );
            None
        }
    };

    let admin_store = open_store(&config, shared_memory.as_ref()).await?;
    admin_store
        .ping()
        .await
        .context("Store did not answer PING")?;
    info!("Connected to store");

    // Shutdown flag - set to true on SIGTERM/Ctrl-C
    let shutdown = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.store(true, Ordering::SeqCst);
            let _ = shutdown_tx.send(true);
        });
    }

    // One worker (and, for Redis, one connection) per destination
    let mut workers = JoinSet::new();
    for destination in &config.queue.destinations {
        let store = open_store(&config, shared_memory.as_ref()).await?;
        let state = Arc::new(WorkerState::new(config.clone(), store, executor.clone()));
        let mut worker = Worker::new(
            state,
            destination.clone(),
            consumer_name(&config.queue.worker_name_prefix),
        );
        let shutdown = shutdown.clone();

        info!(
            destination = %destination,
            consumer = %worker.consumer_name(),
            "Spawning delivery worker"
        );
        workers.spawn(async move { worker.run(shutdown).await });
    }

    // Admin API
    let app_context = Arc::new(AppContext::new(config.clone(), admin_store));
    let listener = TcpListener::bind(config.admin.listen_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.admin.listen_addr()))?;
    let mut admin_shutdown = shutdown_rx;
    let admin = tokio::spawn(courier::run_admin_server(listener, app_context, async move {
        let _ = admin_shutdown.wait_for(|stop| *stop).await;
    }));

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Delivery worker exited with error"),
            Err(e) => error!(error = %e, "Delivery worker task panicked"),
        }
    }

    // Workers only return once shutdown was requested
    match admin.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Admin server exited with error"),
        Err(e) => error!(error = %e, "Admin server task panicked"),
    }

    info!("Delivery worker stopped gracefully");
    Ok(())
}

/// A store handle for one worker or for the admin API
async fn open_store(
    config: &Config,
    shared_memory: Option<&Arc<dyn DeliveryStore>>,
) -> Result<Arc<dyn DeliveryStore>> {
    if let Some(store) = shared_memory {
        return Ok(store.clone());
    }
    let store = RedisStore::connect(&config.store)
        .await
        .context("Failed to connect to Redis")?;
    Ok(Arc::new(store))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, initiating graceful shutdown...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("SIGINT received, initiating graceful shutdown...");
                    }
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler, listening for Ctrl-C only");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    info!("SIGINT received, initiating graceful shutdown...");
}
