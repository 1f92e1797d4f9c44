// ============================================================================
// Delivery Worker Modules
// ============================================================================
//
// Everything between the producer's enqueue and the transport's send:
//
// - stream_queue.rs  - enqueue (idempotent), requeue, ack_delete
// - deduplication.rs - delivered markers
// - rate_limiting.rs - shared per-destination token bucket
// - executor.rs      - transport boundary (DeliveryExecutor, HttpTransport)
// - backoff.rs       - retry ceiling and jittered exponential backoff
// - processor.rs     - pure outcome -> (next state, side effects) transition
// - dlq.rs           - dead-letter handler
// - state.rs         - WorkerState (injected store, executor, components)
// - worker.rs        - the consumer loop
//
// ============================================================================

pub mod backoff;
pub mod deduplication;
pub mod dlq;
pub mod executor;
pub mod processor;
pub mod rate_limiting;
pub mod state;
pub mod stream_queue;
pub mod worker;

// Re-export commonly used types and functions
pub use dlq::{DeadLetterHandler, DlqRequeue};
pub use executor::{DeliveryError, DeliveryExecutor, DeliveryReceipt, HttpTransport};
pub use processor::{DeliveryOutcome, NextState, SideEffect, Transition, transition};
pub use state::WorkerState;
pub use stream_queue::{EnqueueOutcome, QueueError, StreamQueue};
pub use worker::{Worker, WorkerStats, consumer_name};
