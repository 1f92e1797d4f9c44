use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder, histogram_opts,
    opts, register_histogram, register_histogram_vec, register_int_counter_vec,
    register_int_gauge_vec,
};

pub static MESSAGES_ENQUEUED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_messages_enqueued_total",
            "Messages appended to a delivery stream by producers"
        ),
        &["destination"]
    )
    .unwrap()
});

pub static DUPLICATES_SUPPRESSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_duplicates_suppressed_total",
            "Enqueues and deliveries skipped by the idempotency guard"
        ),
        &["destination", "stage"]
    )
    .unwrap()
});

pub static MESSAGES_DELIVERED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_messages_delivered_total",
            "Messages accepted by the transport"
        ),
        &["destination"]
    )
    .unwrap()
});

pub static DELIVERY_RETRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_delivery_retries_total",
            "Transient failures re-enqueued for another attempt"
        ),
        &["destination"]
    )
    .unwrap()
});

pub static MESSAGES_DEAD_LETTERED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_messages_dead_lettered_total",
            "Messages moved to the dead-letter stream"
        ),
        &["destination"]
    )
    .unwrap()
});

pub static ENTRIES_CLAIMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_entries_claimed_total",
            "Idle entries reclaimed from other consumers"
        ),
        &["destination"]
    )
    .unwrap()
});

pub static DELIVERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "courier_delivery_duration_seconds",
            "Time spent in a single transport send"
        ),
        &["destination"]
    )
    .unwrap()
});

pub static RATE_LIMIT_WAIT: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "courier_rate_limit_wait_seconds",
        "Time a worker waited for a rate-limit token"
    )
    .unwrap()
});

pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!(
            "courier_queue_depth",
            "Entries in the delivery stream at the last health check"
        ),
        &["destination"]
    )
    .unwrap()
});

pub static DLQ_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!(
            "courier_dlq_depth",
            "Entries in the dead-letter stream at the last health check"
        ),
        &["destination"]
    )
    .unwrap()
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
