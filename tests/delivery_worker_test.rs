// ============================================================================
// Delivery Worker Integration Tests
// ============================================================================
//
// End-to-end behaviour of enqueue -> worker -> transport against the
// in-memory store, with a scripted executor standing in for the transport.
// Timing-sensitive tests run on tokio's paused clock.
//
// ============================================================================


use courier::admin::ControlPlane;
use courier::delivery_worker::deduplication::IdempotencyGuard;
use courier::delivery_worker::{DeadLetterHandler, Worker};
use courier::store::{DeliveryStore, MemoryStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use test_utils::*;

/// Run iterations until the executor saw `calls` sends (bounded)
async fn drive_until(worker: &mut Worker, executor: &ScriptedExecutor, calls: usize) {
    for _ in 0..50 {
        if executor.call_count() >= calls {
            break;
        }
        worker.run_once().await.unwrap();
    }
    // One more pass to apply anything the last send scheduled
    worker.run_once().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_enqueue_is_delivered_once() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let queue = queue(&config, store.clone());
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w1").await;

    let first = queue.enqueue(DESTINATION, reply("m1")).await.unwrap();
    let second = queue.enqueue(DESTINATION, reply("m1")).await.unwrap();
    assert!(second.is_duplicate());
    assert_eq!(first.entry_id(), second.entry_id());

    worker.run_once().await.unwrap();
    worker.run_once().await.unwrap();

    assert_eq!(executor.call_count(), 1);
    let stats = store.stream_stats(DESTINATION).await.unwrap();
    assert_eq!((stats.length, stats.pending, stats.dlq_length), (0, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success_within_budget() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::with_script([
        transient("503"),
        transient("503"),
        transient("timeout"),
        transient("429"),
    ]));
    let queue = queue(&config, store.clone());
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w1").await;

    queue.enqueue(DESTINATION, reply("m1")).await.unwrap();
    drive_until(&mut worker, &executor, 5).await;

    // Delivered on the 5th attempt, never dead-lettered
    assert_eq!(executor.call_count(), 5);
    let stats = worker.stats();
    assert_eq!(stats.retried, 4);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.last_delivered_attempt, Some(5));
    assert_eq!(stats.dead_lettered, 0);

    let stream = store.stream_stats(DESTINATION).await.unwrap();
    assert_eq!((stream.length, stream.pending, stream.dlq_length), (0, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_land_in_dlq_exactly_once() {
    let config = test_config();
    let max = config.queue.max_delivery_attempts as usize;
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::with_script(
        (0..=max).map(|i| transient(&format!("503 #{}", i))),
    ));
    let queue = queue(&config, store.clone());
    let dlq = DeadLetterHandler::new(store.clone(), &config.queue);
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w1").await;

    queue.enqueue(DESTINATION, reply("m1")).await.unwrap();
    drive_until(&mut worker, &executor, max + 1).await;

    assert_eq!(executor.call_count(), max + 1);
    let records = dlq.list(DESTINATION, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entry.message.message_id, "m1");
    assert_eq!(records[0].entry.total_attempts, (max + 1) as u32);
    assert!(records[0].entry.failure_reason.contains(&format!("503 #{}", max)));

    let stats = store.stream_stats(DESTINATION).await.unwrap();
    assert_eq!((stats.length, stats.pending, stats.dlq_length), (0, 0, 1));
}

#[tokio::test(start_paused = true)]
async fn test_competing_workers_settle_each_entry_once() {
    let mut config = test_config();
    config.queue.claim_idle_threshold_ms = 1_000;
    config.queue.retry_base_delay_ms = 900;
    config.queue.retry_max_delay_ms = 900;
    let store = Arc::new(MemoryStore::new());
    let failing = Arc::new(ScriptedExecutor::with_script(
        (0..1_000).map(|_| transient("503")),
    ));
    let rejecting = Arc::new(ScriptedExecutor::with_script(
        (0..1_000).map(|_| permanent("invalid recipient")),
    ));
    let queue = queue(&config, store.clone());
    let dlq = DeadLetterHandler::new(store.clone(), &config.queue);

    for id in ["m1", "m2", "m3"] {
        queue.enqueue(DESTINATION, reply(id)).await.unwrap();
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for (name, executor) in [("w-retry", failing.clone()), ("w-reject", rejecting.clone())] {
        let mut worker = worker(state(config.clone(), store.clone(), executor), name).await;
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    for _ in 0..600 {
        let stats = store.stream_stats(DESTINATION).await.unwrap();
        if stats.length == 0 && stats.pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    // Let any in-flight backoff finish before looking at the result
    tokio::time::sleep(Duration::from_secs(5)).await;

    shutdown.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut dead: Vec<String> = dlq
        .list(DESTINATION, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.entry.message.message_id)
        .collect();
    dead.sort();
    assert_eq!(dead, vec!["m1", "m2", "m3"]);

    let stats = store.stream_stats(DESTINATION).await.unwrap();
    assert_eq!((stats.length, stats.pending, stats.dlq_length), (0, 0, 3));
}

#[tokio::test(start_paused = true)]
async fn test_worker_skips_entry_claimed_during_backoff() {
    let mut config = test_config();
    config.queue.retry_base_delay_ms = 900;
    config.queue.retry_max_delay_ms = 900;
    config.queue.read_batch_size = 2;
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::with_script([transient("503"), transient("503")]));
    let queue = queue(&config, store.clone());
    let mut slow = worker(state(config, store.clone(), executor.clone()), "w-slow").await;

    queue.enqueue(DESTINATION, reply("m1")).await.unwrap();
    let m2 = queue.enqueue(DESTINATION, reply("m2")).await.unwrap().entry_id();

    // Another consumer takes m2 while w-slow is still backing off on m1
    let other = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.transfer(DESTINATION, "w-other", &[m2]).await.unwrap()
        })
    };

    slow.run_once().await.unwrap();
    assert_eq!(other.await.unwrap(), vec![m2]);

    // m1 was retried; m2 was never sent by w-slow and still belongs to w-other
    let sent: Vec<String> = executor
        .calls()
        .iter()
        .map(|(_, payload)| payload["text"].as_str().unwrap_or_default().to_string())
        .collect();
    assert!(sent.iter().all(|text| text == "reply m1"), "sent {:?}", sent);
    assert!(slow.stats().retried >= 1);
    assert_eq!(slow.stats().lost, 1);

    let pending = store.pending_entries(DESTINATION, None, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, m2);
    assert_eq!(pending[0].consumer, "w-other");
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_dead_letters_immediately() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::with_script([permanent("invalid recipient")]));
    let queue = queue(&config, store.clone());
    let dlq = DeadLetterHandler::new(store.clone(), &config.queue);
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w1").await;

    queue.enqueue(DESTINATION, reply("m1")).await.unwrap();
    worker.run_once().await.unwrap();
    worker.run_once().await.unwrap();

    assert_eq!(executor.call_count(), 1);
    let records = dlq.list(DESTINATION, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entry.total_attempts, 1);
    assert!(records[0].entry.failure_reason.contains("invalid recipient"));
    assert_eq!(store.stream_stats(DESTINATION).await.unwrap().length, 0);
}

#[tokio::test(start_paused = true)]
async fn test_health_after_partial_drain() {
    let mut config = test_config();
    config.queue.read_batch_size = 1;
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let queue = queue(&config, store.clone());
    let control = ControlPlane::new(store.clone(), &config.queue);
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w1").await;

    for id in ["m1", "m2", "m3"] {
        queue.enqueue(DESTINATION, reply(id)).await.unwrap();
    }
    assert_eq!(worker.run_once().await.unwrap(), 1);

    let health = control.health(DESTINATION).await.unwrap();
    assert_eq!(health.queue_depth, 2);
    assert_eq!(health.dlq_depth, 0);
    assert_eq!(health.pending_count, 0);
    assert_eq!(health.consumers.len(), 1);
    assert_eq!(health.consumers[0].name, "w1");
    assert!(health.last_delivered_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_force_claim_is_processed_on_next_iteration() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let queue = queue(&config, store.clone());
    let control = ControlPlane::new(store.clone(), &config.queue);
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w-target").await;

    for id in ["m1", "m2"] {
        queue.enqueue(DESTINATION, reply(id)).await.unwrap();
    }
    // A stuck consumer takes both entries and never acks
    let stuck = store
        .read_new(DESTINATION, "w-stuck", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(stuck.entries.len(), 2);

    let report = control.force_claim(DESTINATION, "w-target").await.unwrap();
    assert_eq!(report.transferred, 2);

    // Well before the idle threshold: only the owned step can pick these up
    assert_eq!(worker.run_once().await.unwrap(), 2);
    assert_eq!(executor.call_count(), 2);
    let stats = store.stream_stats(DESTINATION).await.unwrap();
    assert_eq!((stats.length, stats.pending), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_crashed_consumer_entries_are_reclaimed_after_idle_threshold() {
    let config = test_config();
    let threshold = config.queue.claim_idle_threshold();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let queue = queue(&config, store.clone());
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w-alive").await;

    queue.enqueue(DESTINATION, reply("m1")).await.unwrap();
    store
        .read_new(DESTINATION, "w-crashed", 10, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(worker.run_once().await.unwrap(), 0);
    assert_eq!(executor.call_count(), 0);

    tokio::time::advance(threshold + Duration::from_millis(1)).await;
    assert_eq!(worker.run_once().await.unwrap(), 1);
    assert_eq!(executor.call_count(), 1);
    assert_eq!(worker.stats().claimed, 1);

    let stats = store.stream_stats(DESTINATION).await.unwrap();
    assert_eq!((stats.length, stats.pending), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_no_loss_under_bounded_transient_failures() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    // Every other send fails transiently, well within the retry budget
    let executor = Arc::new(ScriptedExecutor::with_script(
        (0..20).map(|i| if i % 2 == 0 { transient("flaky") } else { Ok(()) }),
    ));
    let queue = queue(&config, store.clone());
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w1").await;

    let ids: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
    for id in &ids {
        queue.enqueue(DESTINATION, reply(id)).await.unwrap();
    }

    for _ in 0..50 {
        let stats = store.stream_stats(DESTINATION).await.unwrap();
        if stats.length == 0 {
            break;
        }
        worker.run_once().await.unwrap();
    }

    let stats = store.stream_stats(DESTINATION).await.unwrap();
    assert_eq!((stats.length, stats.pending, stats.dlq_length), (0, 0, 0));
    assert_eq!(worker.stats().delivered, 10);

    let delivered_texts: Vec<String> = executor
        .calls()
        .iter()
        .map(|(_, payload)| payload["text"].as_str().unwrap_or_default().to_string())
        .collect();
    for id in &ids {
        assert!(delivered_texts.contains(&format!("reply {}", id)));
    }
}

#[tokio::test(start_paused = true)]
async fn test_delivered_marker_suppresses_resend() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let queue = queue(&config, store.clone());
    let guard = IdempotencyGuard::new(store.clone(), config.queue.idempotency_ttl());
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w1").await;

    // Sent earlier, but the entry survived (the ack never landed)
    queue.enqueue(DESTINATION, reply("m1")).await.unwrap();
    guard.mark_delivered(DESTINATION, "m1").await.unwrap();

    assert_eq!(worker.run_once().await.unwrap(), 1);
    assert_eq!(executor.call_count(), 0);
    assert_eq!(worker.stats().duplicates, 1);
    assert_eq!(store.stream_stats(DESTINATION).await.unwrap().length, 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_dead_lettered() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let dlq = DeadLetterHandler::new(store.clone(), &config.queue);
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w1").await;

    store
        .append(DESTINATION, "m-bad", b"\xc1 not msgpack", 100)
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    assert_eq!(executor.call_count(), 0);
    let records = dlq.list(DESTINATION, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entry.message.message_id, "m-bad");
    assert!(records[0].entry.failure_reason.contains("malformed payload"));
}

#[tokio::test(start_paused = true)]
async fn test_dlq_requeue_gets_a_fresh_budget() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::with_script([permanent("bad template")]));
    let queue = queue(&config, store.clone());
    let dlq = DeadLetterHandler::new(store.clone(), &config.queue);
    let mut worker = worker(state(config, store.clone(), executor.clone()), "w1").await;

    queue.enqueue(DESTINATION, reply("m1")).await.unwrap();
    worker.run_once().await.unwrap();
    let records = dlq.list(DESTINATION, 10).await.unwrap();
    assert_eq!(records.len(), 1);

    dlq.requeue(DESTINATION, records[0].id).await.unwrap().unwrap();
    worker.run_once().await.unwrap();

    assert_eq!(executor.call_count(), 2);
    assert_eq!(worker.stats().delivered, 1);
    let stats = store.stream_stats(DESTINATION).await.unwrap();
    assert_eq!((stats.length, stats.dlq_length), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_shared_rate_limit_across_workers() {
    let mut config = test_config();
    config.rate_limit.tokens_per_second = 10.0;
    config.rate_limit.bucket_capacity = 5;
    // Batches wait on tokens for seconds; keep them from being reclaimed meanwhile
    config.queue.claim_idle_threshold_ms = 60_000;
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let queue = queue(&config, store.clone());

    for i in 0..100 {
        queue
            .enqueue(DESTINATION, reply(&format!("m{}", i)))
            .await
            .unwrap();
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for n in 0..3 {
        let state = state(config.clone(), store.clone(), executor.clone());
        let mut worker = worker(state, &format!("w{}", n)).await;
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    let window = Duration::from_secs(3);
    tokio::time::sleep(window).await;
    let sent = executor.call_count();

    // capacity + refill * elapsed, shared by all three workers
    assert!(sent <= 5 + 30 + 1, "sent {} in {:?}", sent, window);
    assert!(sent >= 25, "sent only {} in {:?}", sent, window);

    shutdown.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown_flag() {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let state = state(config, store.clone(), executor.clone());
    let mut worker = Worker::new(state, DESTINATION, "w1");

    let shutdown = Arc::new(AtomicBool::new(false));
    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.store(true, Ordering::SeqCst);
    handle.await.unwrap().unwrap();

    // run() registered the consumer on its own
    let stats = store.stream_stats(DESTINATION).await.unwrap();
    assert_eq!(stats.consumers.len(), 1);
}
