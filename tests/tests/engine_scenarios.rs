use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use relay_foundation::WorkerEngine;
use relay_kernel::DomainType;
use relay_kernel::batch::{BatchItem, BatchOptions, ItemStatus};
use relay_kernel::config::{EngineConfig, PoolConfig};
use relay_kernel::error::EngineError;
use relay_testing::{MockLauncher, MockReply, assert_action_sent};
use serde_json::json;
use tokio::time::Instant;

fn engine_with(launcher: &MockLauncher, pool: PoolConfig) -> WorkerEngine {
    let config = EngineConfig::new()
        .with_pool(
            pool.with_handshake_timeout(Duration::from_secs(2))
                .with_shutdown_grace(Duration::from_secs(1)),
        )
        .with_default_timeout(Duration::from_secs(5));
    WorkerEngine::with_launcher(config, Arc::new(launcher.clone())).unwrap()
}

fn slow_echo(delay: Duration) -> MockLauncher {
    MockLauncher::new(move |cmd| {
        MockReply::Delayed(delay, Box::new(MockReply::success(cmd.data.clone())))
    })
}

#[tokio::test]
async fn test_concurrent_calls_get_distinct_connections_and_third_waits() {
    let launcher = slow_echo(Duration::from_millis(150));
    let engine = engine_with(
        &launcher,
        PoolConfig::new()
            .with_min_size(1)
            .with_max_size(2)
            .with_acquire_timeout(Duration::from_secs(2)),
    );
    engine.start().await;
    assert_eq!(engine.pool_metrics(DomainType::Model).unwrap().idle_connections, 1);

    let started = Instant::now();
    let calls: Vec<_> = (0..3)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let data = engine
                    .execute(DomainType::Model, "generate", json!({ "call": i }), None)
                    .await;
                (data, started.elapsed())
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let during = engine.pool_metrics(DomainType::Model).unwrap();
    assert_eq!(during.active_connections, 2);
    assert!(during.total_connections <= 2);
    assert_eq!(engine.pending_requests(), 2);

    let mut elapsed = Vec::new();
    for (i, call) in calls.into_iter().enumerate() {
        let (data, took) = call.await.unwrap();
        assert_eq!(data.unwrap(), json!({ "call": i }));
        elapsed.push(took);
    }
    elapsed.sort();
    // Two calls ran side by side; the third had to wait for a release.
    assert!(elapsed[1] < Duration::from_millis(290), "{elapsed:?}");
    assert!(elapsed[2] >= Duration::from_millis(290), "{elapsed:?}");
    assert_eq!(launcher.launched_for(DomainType::Model), 2);

    let after = engine.pool_metrics(DomainType::Model).unwrap();
    assert_eq!(after.pool_hits + after.pool_misses, 3);
    assert_eq!(after.pool_misses, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_worker_exit_mid_request_is_a_connection_error_and_is_replaced() {
    let launcher = MockLauncher::new(|cmd| {
        if cmd.action == "inference.crash" {
            MockReply::Exit
        } else {
            MockReply::success(json!("ok"))
        }
    });
    let engine = engine_with(&launcher, PoolConfig::new().with_max_size(1));

    let err = engine
        .execute(DomainType::Inference, "crash", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Connection(_)), "got {err:?}");

    let data = engine
        .execute(DomainType::Inference, "run", json!({}), None)
        .await
        .unwrap();
    assert_eq!(data, json!("ok"));

    let metrics = engine.pool_metrics(DomainType::Inference).unwrap();
    assert_eq!(launcher.launched(), 2);
    assert_eq!(metrics.evictions, 1);
    assert_eq!(metrics.pool_misses, 2);
    assert_eq!(metrics.total_connections, 1);
}

#[tokio::test]
async fn test_batch_with_one_failing_item() {
    let launcher = MockLauncher::new(|cmd| {
        if cmd.data["index"] == 4 {
            MockReply::failure("cannot process item 4")
        } else {
            MockReply::Delayed(
                Duration::from_millis(10),
                Box::new(MockReply::success(json!({ "processed": cmd.data["index"] }))),
            )
        }
    });
    let engine = engine_with(&launcher, PoolConfig::new().with_max_size(4));

    let items: Vec<BatchItem> = (0..10)
        .map(|i| BatchItem::new(format!("img-{i}"), json!({ "index": i })))
        .collect();
    let options = BatchOptions::new()
        .with_concurrency(3)
        .with_stop_on_first_error(false);

    let result = engine
        .execute_batch(DomainType::Processing, "resize", items, &options)
        .await
        .unwrap();

    assert_eq!(result.total_operations, 10);
    assert_eq!(result.successful, 9);
    assert_eq!(result.failed, 1);
    assert_eq!(result.cancelled, 0);
    assert_eq!(result.success_rate, 90.0);
    for item in &result.results {
        if item.index == 4 {
            assert_eq!(item.status, ItemStatus::Failed);
            assert!(item.error.as_deref().unwrap().contains("cannot process item 4"));
        } else {
            assert_eq!(item.status, ItemStatus::Completed);
            assert_eq!(item.data, Some(json!({ "processed": item.index })));
        }
    }

    // Concurrency 3 never needs more than 3 workers.
    assert!(launcher.launched() <= 3);
    let op = engine.operation_metric("processing.resize").unwrap();
    assert_eq!(op.total_invocations, 10);
    assert_eq!(op.failed_invocations, 1);
}

#[tokio::test]
async fn test_timeout_then_late_reply_is_discarded() {
    let launcher = slow_echo(Duration::from_millis(200));
    let engine = engine_with(&launcher, PoolConfig::new().with_max_size(1));

    let started = Instant::now();
    let err = engine
        .execute(
            DomainType::Memory,
            "allocate",
            json!({ "mb": 512 }),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, EngineError::Timeout { .. }), "got {err:?}");
    assert!(waited >= Duration::from_millis(100), "{waited:?}");
    assert!(waited < Duration::from_millis(190), "{waited:?}");

    // Let the late reply arrive.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = engine.correlator_stats();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(engine.pending_requests(), 0);

    // The connection survived one timeout and still correlates correctly.
    let data = engine
        .execute(DomainType::Memory, "allocate", json!({ "mb": 64 }), None)
        .await
        .unwrap();
    assert_eq!(data, json!({ "mb": 64 }));
    assert_eq!(launcher.launched(), 1);
}

#[tokio::test]
async fn test_pool_exhausted_instead_of_deadlock() {
    let launcher = slow_echo(Duration::from_millis(500));
    let engine = engine_with(
        &launcher,
        PoolConfig::new()
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_millis(100)),
    );

    let busy = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.execute(DomainType::Device, "scan", json!({}), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = engine
        .execute(DomainType::Device, "scan", json!({}), None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, EngineError::PoolExhausted { domain: DomainType::Device, .. }),
        "got {err:?}"
    );
    assert!(busy.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_capabilities_are_idempotent_within_ttl() {
    let launcher = MockLauncher::new(|cmd| {
        MockReply::success(json!({ "actions": ["load_model", "unload_model"], "via": cmd.action }))
    });
    let engine = engine_with(&launcher, PoolConfig::new());

    let first = engine.capabilities(DomainType::Model).await.unwrap();
    let misses = engine.pool_metrics(DomainType::Model).unwrap().pool_misses;
    let second = engine.capabilities(DomainType::Model).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(serde_json::to_vec(&first).unwrap(), serde_json::to_vec(&second).unwrap());
    assert_eq!(engine.pool_metrics(DomainType::Model).unwrap().pool_misses, misses);
    assert_action_sent!(launcher, "model.get_capabilities", 1);
    assert_eq!(engine.capability_entries().len(), 1);
}

#[tokio::test]
async fn test_many_concurrent_requests_correlate() {
    let launcher = MockLauncher::new(|cmd| {
        let delay = cmd.data["delay_ms"].as_u64().unwrap_or(0);
        MockReply::Delayed(
            Duration::from_millis(delay),
            Box::new(MockReply::success(cmd.data.clone())),
        )
    });
    let engine = engine_with(
        &launcher,
        PoolConfig::new()
            .with_max_size(4)
            .with_acquire_timeout(Duration::from_secs(5)),
    );

    let results = join_all((0..24u64).map(|i| {
        let engine = engine.clone();
        async move {
            let payload = json!({ "n": i, "delay_ms": (i * 7) % 20 });
            let reply = engine
                .execute(DomainType::Postprocessing, "format", payload.clone(), None)
                .await;
            (payload, reply)
        }
    }))
    .await;

    for (payload, reply) in results {
        assert_eq!(reply.unwrap(), payload);
    }
    let metrics = engine.pool_metrics(DomainType::Postprocessing).unwrap();
    assert!(metrics.total_connections <= 4);
    assert!(launcher.launched() <= 4);
    assert_eq!(metrics.total_requests, 24);
    assert_eq!(engine.pending_requests(), 0);
}

#[tokio::test]
async fn test_spawn_failure_surfaces_as_spawn_error() {
    let launcher = MockLauncher::echo().with_failing_launch();
    let engine = engine_with(&launcher, PoolConfig::new());

    let err = engine
        .execute(DomainType::Device, "list", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Spawn { domain: DomainType::Device, .. }));
    assert_eq!(engine.pool_metrics(DomainType::Device).unwrap().spawn_failures, 1);
}

#[tokio::test]
async fn test_graceful_shutdown_lets_in_flight_request_finish() {
    let launcher = slow_echo(Duration::from_millis(100));
    let engine = engine_with(&launcher, PoolConfig::new().with_max_size(2));

    let in_flight = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .execute(DomainType::Inference, "run", json!({ "prompt": "hi" }), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    engine.shutdown().await;
    assert_eq!(in_flight.await.unwrap().unwrap(), json!({ "prompt": "hi" }));
    assert!(matches!(
        engine.execute(DomainType::Inference, "run", json!({}), None).await,
        Err(EngineError::Closed(DomainType::Inference))
    ));
    assert_eq!(launcher.terminated(), launcher.launched());
}

/// Workers that stop reading their input while a `slow` request sleeps.
fn stalls_on_slow() -> MockLauncher {
    MockLauncher::new(|cmd| {
        if cmd.action.ends_with(".slow") {
            MockReply::Delayed(
                Duration::from_millis(300),
                Box::new(MockReply::success(json!("slow"))),
            )
        } else {
            MockReply::success(cmd.data.clone())
        }
    })
}

/// Larger than the in-memory pipe, so writing it blocks on a stalled worker.
fn oversized_payload() -> serde_json::Value {
    json!({ "blob": "x".repeat(300 * 1024) })
}

#[tokio::test]
async fn test_write_cut_off_by_deadline_retires_connection() {
    let launcher = stalls_on_slow();
    let engine = engine_with(
        &launcher,
        PoolConfig::new()
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_secs(2)),
    );

    let err = engine
        .execute(DomainType::Memory, "slow", json!({}), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout { .. }), "got {err:?}");

    let err = engine
        .execute(
            DomainType::Memory,
            "large",
            oversized_payload(),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Connection(_)), "got {err:?}");
    let metrics = engine.pool_metrics(DomainType::Memory).unwrap();
    assert_eq!(metrics.evictions, 1);
    assert_eq!(metrics.idle_connections, 0);

    let data = engine
        .execute(DomainType::Memory, "small", json!({ "n": 1 }), None)
        .await
        .unwrap();
    assert_eq!(data, json!({ "n": 1 }));
    assert_eq!(launcher.launched(), 2);
    assert_action_sent!(launcher, "memory.small", 1);
}

#[tokio::test]
async fn test_caller_dropped_mid_write_retires_connection() {
    let launcher = stalls_on_slow();
    let engine = engine_with(
        &launcher,
        PoolConfig::new()
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_secs(2)),
    );

    let _ = engine
        .execute(DomainType::Memory, "slow", json!({}), Some(Duration::from_millis(50)))
        .await;

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .execute(DomainType::Memory, "large", oversized_payload(), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    writer.abort();
    assert!(writer.await.unwrap_err().is_cancelled());

    assert_eq!(engine.pool_metrics(DomainType::Memory).unwrap().evictions, 1);
    let data = engine
        .execute(DomainType::Memory, "small", json!({ "n": 2 }), None)
        .await
        .unwrap();
    assert_eq!(data, json!({ "n": 2 }));
    assert_eq!(launcher.launched(), 2);
    assert_action_sent!(launcher, "memory.small", 1);
}
