use super::consumer::trim_targets;
use super::*;
use crate::queue::{CancelToken, QueueError, Server, TypedMessage};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;

const STREAM: &str = "orders";
const GROUP: &str = "billing";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    sku: String,
}

fn order(id: u32) -> Order {
    Order {
        id,
        sku: format!("SKU-{}", id),
    }
}

fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        read_timeout_ms: 500,
        idle_backoff_ms: 20,
        error_backoff_ms: 20,
        trim_interval_ms: 50,
        trim_timeout_ms: 200,
        ..Default::default()
    }
}

async fn publish_orders(log: &MemoryStreamLog, ids: impl IntoIterator<Item = u32>) -> Vec<String> {
    let mut entry_ids = Vec::new();
    for id in ids {
        let entry_id = publish(log, STREAM, &TypedMessage::new(order(id)))
            .await
            .unwrap();
        entry_ids.push(entry_id);
    }
    entry_ids
}

/// Deliver `count` entries to the default consumer without acknowledging them.
async fn deliver_without_ack(log: &MemoryStreamLog, count: usize) {
    log.create_group(STREAM, GROUP, "0").await.unwrap();
    let delivered = log
        .read_group(GroupRead {
            stream: STREAM,
            group: GROUP,
            consumer: DEFAULT_CONSUMER_NAME,
            cursor: ReadCursor::New,
            count,
        })
        .await
        .unwrap();
    assert_eq!(delivered.len(), count);
}

type Seen = Arc<Mutex<Vec<u32>>>;

fn recording_consumer(log: &Arc<MemoryStreamLog>, route: Route, seen: &Seen) -> Consumer {
    let mut consumer = Consumer::new(log.clone(), fast_config());
    let seen = seen.clone();
    consumer.must_add_handler(route, move |_ctx: Context, msg: TypedMessage<Order>| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(msg.payload.id);
            Ok(())
        }
    });
    consumer
}

fn spawn_start(consumer: &Arc<Consumer>) -> JoinHandle<crate::queue::Result<()>> {
    let consumer = consumer.clone();
    tokio::spawn(async move { consumer.start(&CancelToken::never()).await })
}

async fn shutdown(consumer: &Arc<Consumer>, handle: JoinHandle<crate::queue::Result<()>>) {
    consumer
        .stop(&CancelToken::with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    handle.await.unwrap().unwrap();
}

async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn seen_len(seen: &Seen) -> usize {
    seen.lock().unwrap().len()
}

#[tokio::test]
async fn test_consume_and_ack() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, 1..=3).await;

    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { seen_len(&seen) == 3 }).await);
    assert!(eventually(|| async { log.pending_count(STREAM, GROUP).await == 0 }).await);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

    // Live entries keep flowing once the backlog is drained
    publish_orders(&log, [4]).await;
    assert!(eventually(|| async { seen_len(&seen) == 4 }).await);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_route_defaults() {
    let log = Arc::new(MemoryStreamLog::new());
    let seen: Seen = Arc::default();
    let consumer = recording_consumer(&log, Route::new(STREAM, GROUP), &seen);

    let route = consumer.routes().next().unwrap();
    assert_eq!(route.pending_id, "0");
    assert_eq!(route.batch_size, 1);
    assert_eq!(route.max_len, DEFAULT_MAX_LEN);
    assert!(!route.no_pending);
}

#[tokio::test]
async fn test_batch_handler() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, 1..=5).await;

    let batches: Arc<Mutex<Vec<Vec<u32>>>> = Arc::default();
    let mut consumer = Consumer::new(log.clone(), fast_config());
    let recorded = batches.clone();
    consumer.must_add_batch_handler(
        Route::new(STREAM, GROUP).with_batch_size(2),
        move |ctx: Context, msgs: Vec<TypedMessage<Order>>| {
            let recorded = recorded.clone();
            async move {
                assert!(ctx.is_batch());
                recorded
                    .lock()
                    .unwrap()
                    .push(msgs.iter().map(|m| m.payload.id).collect());
                Ok(())
            }
        },
    );
    let consumer = Arc::new(consumer);
    let handle = spawn_start(&consumer);

    assert!(
        eventually(|| async { batches.lock().unwrap().iter().flatten().count() == 5 }).await
    );
    let batches = batches.lock().unwrap().clone();
    assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 2));
    assert_eq!(batches.concat(), vec![1, 2, 3, 4, 5]);
    assert!(eventually(|| async { log.pending_count(STREAM, GROUP).await == 0 }).await);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_partial_ack_leaves_remainder_pending() {
    let log = Arc::new(MemoryStreamLog::new());
    let ids = publish_orders(&log, 1..=5).await;

    let calls = Arc::new(Mutex::new(0));
    let mut consumer = Consumer::new(log.clone(), fast_config());
    let counter = calls.clone();
    consumer.must_add_route(Route::new(STREAM, GROUP).with_batch_size(5).with_handler(
        crate::middleware::handler_fn(move |ctx: Context| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                let first_three: Vec<String> =
                    ctx.msgs().iter().take(3).map(|m| m.id.clone()).collect();
                ctx.ack(first_three);
                Ok(())
            }
        }),
    ));
    let consumer = Arc::new(consumer);
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { log.pending_ids(STREAM, GROUP).await == ids[3..] }).await);
    // Give the worker a few idle cycles
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(log.pending_count(STREAM, GROUP).await, 2);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_pending_recovered_before_new_entries() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, 1..=3).await;
    deliver_without_ack(&log, 3).await;
    publish_orders(&log, 4..=5).await;

    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { seen_len(&seen) == 5 }).await);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    assert!(eventually(|| async { log.pending_count(STREAM, GROUP).await == 0 }).await);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_skip_pending_reads_new_entries_only() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, 1..=3).await;
    deliver_without_ack(&log, 3).await;
    publish_orders(&log, 4..=5).await;

    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(
        &log,
        Route::new(STREAM, GROUP).skip_pending(),
        &seen,
    ));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { seen_len(&seen) == 2 }).await);
    assert_eq!(*seen.lock().unwrap(), vec![4, 5]);
    assert!(eventually(|| async { log.pending_count(STREAM, GROUP).await == 3 }).await);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_deleted_entries_are_acked_and_skipped() {
    let log = Arc::new(MemoryStreamLog::new());
    let ids = publish_orders(&log, 1..=3).await;
    deliver_without_ack(&log, 3).await;
    assert!(log.delete(STREAM, &ids[1]).await.unwrap());

    let batches: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
    let mut consumer = Consumer::new(log.clone(), fast_config());
    let recorded = batches.clone();
    consumer.must_add_route(Route::new(STREAM, GROUP).with_batch_size(3).with_handler(
        crate::middleware::handler_fn(move |ctx: Context| {
            let recorded = recorded.clone();
            async move {
                recorded
                    .lock()
                    .unwrap()
                    .push(ctx.msgs().iter().map(|m| m.id.clone()).collect());
                Ok(())
            }
        }),
    ));
    let consumer = Arc::new(consumer);
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { log.pending_count(STREAM, GROUP).await == 0 }).await);
    assert_eq!(
        *batches.lock().unwrap(),
        vec![vec![ids[0].clone(), ids[2].clone()]]
    );

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_only_deleted_entries_never_reach_handler() {
    let log = Arc::new(MemoryStreamLog::new());
    let ids = publish_orders(&log, 1..=2).await;
    deliver_without_ack(&log, 2).await;
    for id in &ids {
        log.delete(STREAM, id).await.unwrap();
    }

    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { log.pending_count(STREAM, GROUP).await == 0 }).await);
    publish_orders(&log, [3]).await;
    assert!(eventually(|| async { seen_len(&seen) == 1 }).await);
    assert_eq!(*seen.lock().unwrap(), vec![3]);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_handler_error_redelivers_after_restart() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, [1]).await;

    let mut failing = Consumer::new(log.clone(), fast_config());
    let attempts = Arc::new(Mutex::new(0));
    let counter = attempts.clone();
    failing.must_add_handler(
        Route::new(STREAM, GROUP),
        move |_ctx: Context, _msg: TypedMessage<Order>| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Err(HandlerError::other("downstream unavailable"))
            }
        },
    );
    let failing = Arc::new(failing);
    let handle = spawn_start(&failing);

    assert!(eventually(|| async { *attempts.lock().unwrap() >= 1 }).await);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(log.pending_count(STREAM, GROUP).await, 1);
    shutdown(&failing, handle).await;

    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { seen_len(&seen) == 1 }).await);
    assert!(eventually(|| async { log.pending_count(STREAM, GROUP).await == 0 }).await);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_decode_failure_leaves_entry_pending() {
    let log = Arc::new(MemoryStreamLog::new());
    log.append(STREAM, vec![("bd".to_string(), b"{}".to_vec())])
        .await
        .unwrap();

    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { log.pending_count(STREAM, GROUP).await == 1 }).await);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(seen_len(&seen), 0);
    assert_eq!(log.pending_count(STREAM, GROUP).await, 1);

    shutdown(&consumer, handle).await;
}

fn panicking_consumer(log: &Arc<MemoryStreamLog>, middlewares: Vec<Middleware>, seen: &Seen) -> Consumer {
    let mut consumer = Consumer::new(log.clone(), fast_config()).with_middlewares(middlewares);
    let seen = seen.clone();
    consumer.must_add_handler(
        Route::new(STREAM, GROUP),
        move |_ctx: Context, msg: TypedMessage<Order>| {
            let seen = seen.clone();
            async move {
                if msg.payload.id == 13 {
                    panic!("unlucky order");
                }
                seen.lock().unwrap().push(msg.payload.id);
                Ok(())
            }
        },
    );
    consumer
}

#[tokio::test]
async fn test_recovered_panic_keeps_route_running() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, [13, 14]).await;

    let seen: Seen = Arc::default();
    let consumer = Arc::new(panicking_consumer(&log, vec![recover(), trace()], &seen));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { seen_len(&seen) == 1 }).await);
    assert_eq!(*seen.lock().unwrap(), vec![14]);
    assert!(eventually(|| async { log.pending_count(STREAM, GROUP).await == 1 }).await);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_unrecovered_panic_aborts_start() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, [13]).await;

    let seen: Seen = Arc::default();
    let consumer = panicking_consumer(&log, Vec::new(), &seen);

    let result = tokio::time::timeout(Duration::from_secs(2), consumer.start(&CancelToken::never()))
        .await
        .expect("start did not return");
    assert!(matches!(result, Err(QueueError::RouteAborted(_))));
}

#[tokio::test]
async fn test_read_failures_back_off_and_recover() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, [1]).await;
    log.set_fail_reads(3).await;

    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { seen_len(&seen) == 1 }).await);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_trimmer_bounds_stream_length() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, 1..=10).await;

    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(
        &log,
        Route::new(STREAM, GROUP).with_max_len(3),
        &seen,
    ));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { log.len(STREAM).await == 3 }).await);
    assert_eq!(consumer.trim_error_count(), 0);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_trim_errors_are_counted_and_reset() {
    let log = Arc::new(MemoryStreamLog::new());
    log.set_fail_trims(true).await;

    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { consumer.trim_error_count() >= 2 }).await);
    log.set_fail_trims(false).await;
    assert!(eventually(|| async { consumer.trim_error_count() == 0 }).await);

    shutdown(&consumer, handle).await;
}

#[test]
fn test_trim_targets_take_largest_max_len() {
    let routes = [
        Route::new("a", "g1").with_max_len(5),
        Route::new("a", "g2").with_max_len(8),
        Route::new("b", "g1").with_max_len(2),
    ];

    let targets = trim_targets(routes.iter());
    assert_eq!(targets.len(), 2);
    assert_eq!(targets["a"], 8);
    assert_eq!(targets["b"], 2);
}

#[tokio::test]
async fn test_create_groups_on_start() {
    let log = Arc::new(MemoryStreamLog::new());
    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { log.group_exists(STREAM, GROUP).await }).await);
    publish_orders(&log, [1]).await;
    assert!(eventually(|| async { seen_len(&seen) == 1 }).await);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_missing_group_without_bootstrap() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, [1]).await;

    let seen: Seen = Arc::default();
    let mut consumer = Consumer::new(
        log.clone(),
        ConsumerConfig {
            create_groups: false,
            ..fast_config()
        },
    );
    let recorded = seen.clone();
    consumer.must_add_handler(
        Route::new(STREAM, GROUP),
        move |_ctx: Context, msg: TypedMessage<Order>| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(msg.payload.id);
                Ok(())
            }
        },
    );
    let consumer = Arc::new(consumer);
    let handle = spawn_start(&consumer);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(seen_len(&seen), 0);
    assert!(!log.group_exists(STREAM, GROUP).await);

    shutdown(&consumer, handle).await;
}

#[tokio::test]
async fn test_handler_sees_running_context() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, [1]).await;

    let observed: Arc<Mutex<Option<(bool, String)>>> = Arc::default();
    let mut consumer = Consumer::new(log.clone(), fast_config());
    let slot = observed.clone();
    consumer.must_add_handler(
        Route::new(STREAM, GROUP),
        move |ctx: Context, _msg: TypedMessage<Order>| {
            let slot = slot.clone();
            async move {
                *slot.lock().unwrap() = Some((ctx.cancel().is_done(), ctx.route().span_name()));
                Ok(())
            }
        },
    );
    let consumer = Arc::new(consumer);
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { observed.lock().unwrap().is_some() }).await);
    assert_eq!(
        observed.lock().unwrap().clone(),
        Some((false, "/redisq/orders/billing".to_string()))
    );

    shutdown(&consumer, handle).await;
}

#[test]
#[should_panic(expected = "no handler")]
fn test_route_without_handler_panics() {
    let mut consumer = Consumer::new(Arc::new(MemoryStreamLog::new()), fast_config());
    consumer.must_add_route(Route::new(STREAM, GROUP));
}

#[tokio::test]
#[should_panic(expected = "after start")]
async fn test_route_after_start_panics() {
    let log = Arc::new(MemoryStreamLog::new());
    let seen: Seen = Arc::default();
    let mut consumer = recording_consumer(&log, Route::new(STREAM, GROUP), &seen);

    let (cancel, token) = CancelToken::new();
    cancel.cancel();
    consumer.start(&token).await.unwrap();

    consumer.must_add_route(
        Route::new("other", GROUP)
            .with_handler(crate::middleware::handler_fn(|_ctx: Context| async { Ok(()) })),
    );
}

#[tokio::test]
async fn test_stop_before_start() {
    let log = Arc::new(MemoryStreamLog::new());
    let seen: Seen = Arc::default();
    let consumer = recording_consumer(&log, Route::new(STREAM, GROUP), &seen);

    consumer.stop(&CancelToken::never()).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), consumer.start(&CancelToken::never()))
        .await
        .expect("start did not observe the earlier stop");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let log = Arc::new(MemoryStreamLog::new());
    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
    let handle = spawn_start(&consumer);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let result = consumer.start(&CancelToken::never()).await;
    assert!(matches!(result, Err(QueueError::AlreadyStarted)));

    shutdown(&consumer, handle).await;
    consumer.stop(&CancelToken::never()).await.unwrap();
}

#[tokio::test]
async fn test_start_returns_on_caller_signal() {
    let log = Arc::new(MemoryStreamLog::new());
    let seen: Seen = Arc::default();

    let consumer = recording_consumer(&log, Route::new(STREAM, GROUP), &seen);
    let result = consumer
        .start(&CancelToken::with_timeout(Duration::from_millis(50)))
        .await;
    assert!(matches!(result, Err(QueueError::DeadlineExceeded)));

    let consumer = recording_consumer(&log, Route::new(STREAM, GROUP), &seen);
    let (cancel, token) = CancelToken::new();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    assert!(consumer.start(&token).await.is_ok());
    canceller.await.unwrap();
}

#[tokio::test]
async fn test_stop_bounded_by_caller_signal() {
    let log = Arc::new(MemoryStreamLog::new());
    let seen: Seen = Arc::default();
    let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
    let handle = spawn_start(&consumer);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let (cancel, token) = CancelToken::new();
    cancel.cancel();
    let result = consumer.stop(&token).await;
    // Either the run loop already finished or the caller gave up first
    assert!(result.is_ok() || matches!(result, Err(QueueError::Cancelled)));
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_publish_encodes_envelope() {
    let log = MemoryStreamLog::new();
    let msg = TypedMessage::new(order(9)).with_metadata("tenant", "acme");
    let id = publish(&log, STREAM, &msg).await.unwrap();
    assert!(!id.is_empty());

    log.create_group(STREAM, GROUP, "0").await.unwrap();
    let entries = log
        .read_group(GroupRead {
            stream: STREAM,
            group: GROUP,
            consumer: DEFAULT_CONSUMER_NAME,
            cursor: ReadCursor::New,
            count: 1,
        })
        .await
        .unwrap();
    let decoded: TypedMessage<Order> = wire::from_raw(&entries[0]).unwrap().decode().unwrap();
    assert_eq!(decoded.id(), id);
    assert_eq!(decoded.payload, order(9));
    assert_eq!(decoded.metadata().get("tenant").map(String::as_str), Some("acme"));
}

#[tokio::test]
async fn test_publish_rejects_unsupported_content_type() {
    let log = MemoryStreamLog::new();
    let msg = TypedMessage::new(order(1)).with_content_type("text/plain");
    let result = publish(&log, STREAM, &msg).await;
    assert!(matches!(result, Err(QueueError::Codec(_))));
    assert!(log.is_empty(STREAM).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_stop_is_graceful() {
    for round in 0..50 {
        let log = Arc::new(MemoryStreamLog::new());
        publish_orders(&log, [1]).await;
        let seen: Seen = Arc::default();
        let consumer = Arc::new(recording_consumer(&log, Route::new(STREAM, GROUP), &seen));
        let handle = spawn_start(&consumer);
        tokio::time::sleep(Duration::from_millis(5)).await;

        consumer
            .stop(&CancelToken::with_timeout(Duration::from_secs(2)))
            .await
            .unwrap();
        let result = handle.await.unwrap();
        assert!(result.is_ok(), "round {}: {:?}", round, result);
    }
}

#[tokio::test]
async fn test_handler_context_carries_caller_deadline() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, [1]).await;

    let observed: Arc<Mutex<Option<String>>> = Arc::default();
    let mut consumer = Consumer::new(log.clone(), fast_config());
    let slot = observed.clone();
    consumer.must_add_handler(
        Route::new(STREAM, GROUP),
        move |ctx: Context, _msg: TypedMessage<Order>| {
            let slot = slot.clone();
            async move {
                let reason = ctx.cancel().done().await;
                *slot.lock().unwrap() = Some(format!("{:?}", reason));
                Ok(())
            }
        },
    );

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        consumer.start(&CancelToken::with_timeout(Duration::from_millis(100))),
    )
    .await
    .expect("start did not return");

    assert!(matches!(result, Err(QueueError::DeadlineExceeded)));
    assert_eq!(
        observed.lock().unwrap().clone(),
        Some("DeadlineExceeded".to_string())
    );
}

#[tokio::test]
async fn test_hung_read_times_out_and_backs_off() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, [1]).await;
    log.set_hang_reads(true).await;

    let config = ConsumerConfig {
        read_timeout_ms: 50,
        ..fast_config()
    };
    let seen: Seen = Arc::default();
    let mut consumer = Consumer::new(log.clone(), config);
    let recorded = seen.clone();
    consumer.must_add_handler(
        Route::new(STREAM, GROUP),
        move |_ctx: Context, msg: TypedMessage<Order>| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(msg.payload.id);
                Ok(())
            }
        },
    );
    let consumer = Arc::new(consumer);
    let handle = spawn_start(&consumer);

    // Each stalled read is abandoned and retried after the error backoff
    assert!(eventually(|| async { log.read_calls().await >= 3 }).await);
    assert_eq!(seen_len(&seen), 0);

    let started = tokio::time::Instant::now();
    consumer
        .stop(&CancelToken::with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reads_resume_after_stall_clears() {
    let log = Arc::new(MemoryStreamLog::new());
    publish_orders(&log, [1]).await;
    log.set_hang_reads(true).await;

    let config = ConsumerConfig {
        read_timeout_ms: 50,
        ..fast_config()
    };
    let seen: Seen = Arc::default();
    let mut consumer = Consumer::new(log.clone(), config);
    let recorded = seen.clone();
    consumer.must_add_handler(
        Route::new(STREAM, GROUP),
        move |_ctx: Context, msg: TypedMessage<Order>| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(msg.payload.id);
                Ok(())
            }
        },
    );
    let consumer = Arc::new(consumer);
    let handle = spawn_start(&consumer);

    assert!(eventually(|| async { log.read_calls().await >= 2 }).await);
    log.set_hang_reads(false).await;
    assert!(eventually(|| async { seen_len(&seen) == 1 }).await);

    shutdown(&consumer, handle).await;
}
