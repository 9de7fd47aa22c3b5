//! Integration tests for container creation and handles.
//!
//! Everything runs against the in-memory backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use container_backends::MockBackend;
use futures_util::future::join_all;
use testbed_core::engines::Redis;
use testbed_core::{
    options, Backend, Harness, Settings, StartupGate, TestScope, TestbedError, MOCK_BACKEND,
};
use testbed_shared_types::ExecOutput;
use tokio::time::Instant;

fn mock_harness() -> (Harness, Arc<MockBackend>) {
    let mock = Arc::new(MockBackend::new());
    let harness = Harness::with_backend(MOCK_BACKEND, mock.clone(), Settings::default()).unwrap();
    (harness, mock)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_exec_echo() {
    let (harness, _mock) = mock_harness();
    let scope = TestScope::new("TestEcho");
    let container = harness
        .new_container(&scope, "alpine:3", [options::command(["sleep", "infinity"])])
        .await
        .unwrap();

    let output = container.exec(["echo", "hi"]).await.unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.output, "hi\n");

    let failed = container.exec(["sh", "-c", "exit 3"]).await.unwrap();
    assert_eq!(failed.exit_code, 3);
    assert!(!failed.success());

    scope.finish().await;
}

#[tokio::test]
async fn test_redis_ready_on_return() {
    let (harness, mock) = mock_harness();
    mock.with_startup_logs(
        "redis",
        Duration::from_millis(300),
        vec!["Server initialized".to_string(), Redis::READY_LOG.to_string()],
    )
    .await;
    mock.on_exec(|_, argv| {
        (argv == ["redis-cli", "PING"]).then(|| ExecOutput::new(0, "PONG\n"))
    })
    .await;

    let redis = Redis::new();
    let scope = TestScope::new("TestRedis");
    let started = Instant::now();
    let container = harness
        .new_container(&scope, redis.image(), [redis.default_options()])
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(container.logs().await.unwrap().contains(Redis::READY_LOG));

    let pong = container.exec(["redis-cli", "PING"]).await.unwrap();
    assert_eq!(pong.output.trim(), "PONG");

    let url = Redis::url(&container).await.unwrap();
    assert!(url.starts_with("redis://127.0.0.1:"));
    scope.finish().await;
}

// ============================================================================
// Timing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_log_wait_timeout_is_bounded() {
    let (harness, mock) = mock_harness();
    let scope = TestScope::new("TestWaitBound");
    let timeout = Duration::from_secs(2);

    let started = Instant::now();
    let err = harness
        .new_container(
            &scope,
            "postgres:15-alpine",
            [options::wait_for_log("never printed", timeout)],
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed >= timeout);
    assert!(elapsed <= timeout + Duration::from_millis(150));
    match err {
        TestbedError::WaitTimeout { condition, .. } => assert!(condition.contains("never printed")),
        other => panic!("expected WaitTimeout, got {other:?}"),
    }
    assert_eq!(mock.container_count().await, 0);
    scope.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_timeout_caps_wait() {
    let (harness, _mock) = mock_harness();
    let scope = TestScope::new("TestStartupTimeout");
    let started = Instant::now();
    let err = harness
        .new_container(
            &scope,
            "alpine:3",
            [
                options::wait_for_exec(["false"], Duration::from_secs(60)),
                options::startup_timeout(Duration::from_secs(1)),
            ],
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_exec_timeout() {
    let (harness, _mock) = mock_harness();
    let scope = TestScope::new("TestExecTimeout");
    let container = harness.new_container(&scope, "alpine:3", Vec::new()).await.unwrap();

    let err = container
        .exec_with_timeout(["sleep", "30"], Duration::from_millis(100))
        .await
        .unwrap_err();
    match err {
        TestbedError::ExecTimeout { command, timeout } => {
            assert_eq!(command, vec!["sleep", "30"]);
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("expected ExecTimeout, got {other:?}"),
    }
    // The container is untouched by the timeout.
    assert!(container.inspect().await.unwrap().is_running());
    scope.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_gate_serializes_creation() {
    let (harness, _mock) = mock_harness();
    let gate = StartupGate::serial("flaky", Duration::from_millis(500));
    let scope = TestScope::new("TestGate");

    let started = Instant::now();
    let creations = (0..3).map(|_| {
        harness.new_container(&scope, "flaky:1", [options::startup_gate(gate.clone())])
    });
    let results = join_all(creations).await;
    assert!(results.iter().all(Result::is_ok));
    assert!(started.elapsed() >= Duration::from_millis(1500));
    assert_eq!(gate.available(), 1);
    scope.finish().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_concurrent_creates_are_distinct() {
    let (harness, mock) = mock_harness();
    let scope = TestScope::new("TestConcurrent");

    let creations = (0..8).map(|i| {
        harness.new_container(&scope, "alpine:3", [options::env("INDEX", i.to_string())])
    });
    let containers: Vec<_> = join_all(creations)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let ids: HashSet<_> = containers.iter().map(|c| c.id().clone()).collect();
    assert_eq!(ids.len(), 8);
    assert_eq!(mock.running_count().await, 8);

    scope.finish().await;
    assert_eq!(mock.container_count().await, 0);
    assert_eq!(mock.removed_count(), 8);
}

async fn wait_for_no_containers(mock: &MockBackend) -> usize {
    for _ in 0..100 {
        if mock.container_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    mock.container_count().await
}

#[tokio::test]
async fn test_dropped_scope_removes_its_containers() {
    let (harness, mock) = mock_harness();
    {
        let scope = TestScope::new("TestDroppedScope");
        harness.new_container(&scope, "alpine:3", Vec::new()).await.unwrap();
        assert_eq!(mock.container_count().await, 1);
    }
    assert_eq!(wait_for_no_containers(&mock).await, 0);
    assert_eq!(mock.removed_count(), 1);
}

#[tokio::test]
async fn test_dropped_scope_removes_streaming_containers() {
    let settings = Settings {
        verbose: true,
        ..Settings::default()
    };
    let mock = Arc::new(MockBackend::new());
    let harness = Harness::with_backend(MOCK_BACKEND, mock.clone(), settings).unwrap();
    {
        let scope = TestScope::new("TestDroppedVerbose");
        let container = harness
            .new_container(&scope, "alpine:3", [options::with_logs()])
            .await
            .unwrap();
        assert_eq!(container.streamed_lines(), Some(0));
    }
    assert_eq!(wait_for_no_containers(&mock).await, 0);
}

#[tokio::test]
async fn test_remove_then_operations_fail() {
    let (harness, mock) = mock_harness();
    let scope = TestScope::new("TestRemove");
    let container = harness.new_container(&scope, "alpine:3", Vec::new()).await.unwrap();
    let id = container.id().clone();

    container.remove().await.unwrap();
    assert!(container.is_removed());

    assert!(mock.inspect_container(&id).await.unwrap_err().is_not_found());
    assert!(mock
        .exec_in_container(&id, &["true".to_string()])
        .await
        .unwrap_err()
        .is_not_found());
    assert!(mock.remove_container(&id).await.unwrap_err().is_not_found());
    assert!(container.exec(["true"]).await.unwrap_err().is_not_found());

    // Handle-level removal stays idempotent, including from cleanup.
    container.remove().await.unwrap();
    scope.finish().await;
    assert_eq!(mock.removed_count(), 1);
}

#[tokio::test]
async fn test_stop_and_restart() {
    let (harness, _mock) = mock_harness();
    let scope = TestScope::new("TestRestart");
    let container = harness.new_container(&scope, "alpine:3", Vec::new()).await.unwrap();

    container.stop().await.unwrap();
    assert!(!container.inspect().await.unwrap().is_running());
    assert!(matches!(
        container.exec(["true"]).await.unwrap_err(),
        TestbedError::NotRunning(_)
    ));

    container.start().await.unwrap();
    container.start().await.unwrap();
    assert!(container.exec(["true"]).await.unwrap().success());
    scope.finish().await;
}

#[tokio::test]
async fn test_ports_and_endpoints() {
    let (harness, _mock) = mock_harness();
    let scope = TestScope::new("TestPorts");
    let container = harness
        .new_container(&scope, "nginx:alpine", [options::port("80"), options::port("53/udp")])
        .await
        .unwrap();

    let http = container.port("80").await.unwrap();
    assert_eq!(container.port("80/tcp").await.unwrap(), http);
    assert_eq!(container.endpoint("80").await.unwrap(), format!("127.0.0.1:{http}"));
    assert_ne!(container.port("53/udp").await.unwrap(), http);
    assert!(matches!(
        container.port("443").await.unwrap_err(),
        TestbedError::PortNotMapped(p) if p == "443/tcp"
    ));
    scope.finish().await;
}

#[tokio::test]
async fn test_optional_operations_delegate() {
    let (harness, mock) = mock_harness();
    let scope = TestScope::new("TestOptional");
    let container = harness.new_container(&scope, "alpine:3", Vec::new()).await.unwrap();

    assert!(container.internal_ip().await.unwrap().starts_with("172.17.0."));
    container.commit("snapshot:latest").await.unwrap();
    assert_eq!(
        mock.commits().await,
        vec![(container.id().clone(), "snapshot:latest".to_string())]
    );
    scope.finish().await;
}

#[tokio::test]
async fn test_auto_starting_backend_is_not_started_twice() {
    let mock = Arc::new(MockBackend::auto_starting());
    assert!(mock.auto_starts());
    let harness = Harness::with_backend(MOCK_BACKEND, mock.clone(), Settings::default()).unwrap();
    let scope = TestScope::new("TestAutoStart");
    let container = harness.new_container(&scope, "alpine:3", Vec::new()).await.unwrap();
    assert!(container.inspect().await.unwrap().is_running());
    scope.finish().await;
}

#[tokio::test]
async fn test_log_filter_drops_lines() {
    let settings = Settings {
        verbose: true,
        ..Settings::default()
    };
    let mock = Arc::new(MockBackend::new());
    let harness = Harness::with_backend(MOCK_BACKEND, mock.clone(), settings).unwrap();
    let scope = TestScope::new("TestFilter");
    let container = harness
        .new_container(
            &scope,
            "alpine:3",
            [options::log_filter(testbed_core::LogFilter::drop_matching(["noise"]))],
        )
        .await
        .unwrap();

    mock.emit_log(container.id(), "noise: ignore me").await.unwrap();
    mock.emit_log(container.id(), "signal: keep me").await.unwrap();
    for _ in 0..100 {
        if container.streamed_lines() == Some(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let logs = scope.logs();
    assert!(logs.iter().any(|l| l.ends_with("signal: keep me")));
    assert!(!logs.iter().any(|l| l.contains("noise")));
    scope.finish().await;
}
