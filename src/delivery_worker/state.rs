// ============================================================================
// Delivery Worker State
// ============================================================================
//
// Shared state for delivery worker operations: configuration, the injected
// store and transport, and the components built on top of them. Nothing here
// is process-global; a test builds its own WorkerState around a MemoryStore
// and a scripted executor.
//
// ============================================================================

use crate::delivery_worker::backoff::RetryPolicy;
use crate::delivery_worker::deduplication::IdempotencyGuard;
use crate::delivery_worker::dlq::DeadLetterHandler;
use crate::delivery_worker::executor::DeliveryExecutor;
use crate::delivery_worker::rate_limiting::RateLimiter;
use crate::delivery_worker::stream_queue::StreamQueue;
use crate::store::DeliveryStore;
use courier_config::Config;
use std::sync::Arc;

/// Shared state for one worker (one store connection, one executor)
pub struct WorkerState {
    pub config: Arc<Config>,
    pub store: Arc<dyn DeliveryStore>,
    pub executor: Arc<dyn DeliveryExecutor>,
    pub queue: StreamQueue,
    pub guard: IdempotencyGuard,
    pub limiter: RateLimiter,
    pub dead_letters: DeadLetterHandler,
    pub policy: RetryPolicy,
}

impl WorkerState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn DeliveryStore>,
        executor: Arc<dyn DeliveryExecutor>,
    ) -> Self {
        Self {
            queue: StreamQueue::new(store.clone(), &config.queue),
            guard: IdempotencyGuard::new(store.clone(), config.queue.idempotency_ttl()),
            limiter: RateLimiter::new(store.clone(), &config.rate_limit),
            dead_letters: DeadLetterHandler::new(store.clone(), &config.queue),
            policy: RetryPolicy::from_config(&config.queue),
            config,
            store,
            executor,
        }
    }

    pub fn hash_salt(&self) -> &str {
        &self.config.logging.hash_salt
    }
}
