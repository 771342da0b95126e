//! Integration tests for clusterman
//!
//! These tests drive the public API end to end: bus, monitor workers,
//! actuator, convergence waiter and the event stream over a daemon socket.

use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use clusterman::bus::{Bus, BusConfig, Filter, Kind, Labels, Msg};
use clusterman::config::Config;
use clusterman::daemon::run_daemon;
use clusterman::domain::{EntityRef, LocalExpect, MonitorState, ObjectPath};
use clusterman::ipc::DaemonClient;
use clusterman::monitor::{Actuator, ActuatorConfig, MonitorConfig, MonitorManager, MonitorStore};
use clusterman::orchestrate::{ConvergenceWaiter, Orchestration, OrchestrationConfig, OrchestrationError};
use clusterman::sse::{CodecError, DEFAULT_MAX_RECORD_SIZE};

fn entity(s: &str) -> EntityRef {
    s.parse().expect("valid entity")
}

async fn cluster(entities: &[&str]) -> MonitorManager {
    let bus = Bus::spawn(BusConfig::default());
    let manager = MonitorManager::new(bus, MonitorStore::new(), MonitorConfig::default());
    manager.declare(entity("node1")).await.expect("declare node");
    for e in entities {
        manager.declare(entity(e)).await.expect("declare entity");
    }
    manager
}

// =============================================================================
// Convergence through the library API
// =============================================================================

#[tokio::test]
async fn test_orchestration_converges_and_reports_end() {
    let targets = ["ns1/svc/web@node1", "ns1/svc/db@node1"];
    let manager = cluster(&targets).await;
    let actuator = Actuator::spawn(
        "node1",
        manager.client(),
        ActuatorConfig {
            step_delay_ms: 10,
            ..Default::default()
        },
    )
    .await
    .expect("actuator");

    let mut ends = manager.bus().subscribe("test-ends").await.expect("subscribe");
    ends.add_filter(Some(Kind::OrchestrationEnd), Labels::new()).expect("filter");
    ends.start().await.expect("start");

    let waiter = ConvergenceWaiter::new(manager.client(), OrchestrationConfig::default());
    let orch = Orchestration::new(
        LocalExpect::Stop,
        targets.iter().map(|e| entity(e)).collect(),
        Duration::from_secs(5),
        "node1",
    );
    let id = orch.id;
    let report = waiter.run(orch).await.expect("converged");
    assert_eq!(report.converged.len(), 2);

    for e in targets {
        let record = manager.store().get(&entity(e)).expect("record");
        assert_eq!(record.state, MonitorState::Stopped);
        assert_eq!(record.local_expect, None);
    }

    let delivery = tokio::time::timeout(Duration::from_secs(1), ends.recv())
        .await
        .expect("end event in time")
        .expect("end event");
    match delivery.msg.as_ref() {
        Msg::OrchestrationEnd(end) => {
            assert_eq!(end.id, id);
            assert!(end.success);
        }
        other => panic!("Expected OrchestrationEnd, got {:?}", other),
    }

    actuator.shutdown().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failing_entity_fails_orchestration_and_clears_pending() {
    let targets = ["ns1/svc/ok1@node1", "ns1/svc/ok2@node1", "ns1/svc/broken@node1"];
    let manager = cluster(&targets).await;
    let actuator = Actuator::spawn(
        "node1",
        manager.client(),
        ActuatorConfig {
            step_delay_ms: 10,
            fail_paths: vec!["ns1/svc/broken".to_string()],
            ..Default::default()
        },
    )
    .await
    .expect("actuator");

    let waiter = ConvergenceWaiter::new(manager.client(), OrchestrationConfig::default());
    let orch = Orchestration::new(
        LocalExpect::Stop,
        targets.iter().map(|e| entity(e)).collect(),
        Duration::from_secs(5),
        "node1",
    );
    let err = waiter.run(orch).await.expect_err("must fail");
    assert!(matches!(err, OrchestrationError::EntityFailed(_)), "got {:?}", err);
    assert_eq!(err.status(), 500);

    let broken = manager.store().get(&entity("ns1/svc/broken@node1")).expect("record");
    assert_eq!(broken.state, MonitorState::StopFailed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    for e in targets {
        let record = manager.store().get(&entity(e)).expect("record");
        assert_eq!(record.local_expect, None, "{} still has a pending action", e);
        assert!(!record.state.is_transitional(), "{} left in {}", e, record.state);
    }

    actuator.shutdown().await;
    manager.shutdown().await;
}

// =============================================================================
// Daemon over a Unix socket
// =============================================================================

fn daemon_config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.node_name = "node1".to_string();
    config.ipc.socket_path = temp.path().join("daemon.sock");
    config.actuator.step_delay_ms = 10;
    config
}

async fn wait_for_daemon(client: &DaemonClient) {
    for _ in 0..200 {
        if client.socket_exists() && client.ping().await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon did not come up");
}

#[tokio::test]
async fn test_event_stream_over_daemon_socket() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let config = daemon_config(&temp);
    let client = DaemonClient::with_socket_path(config.ipc.socket_path.clone());
    let daemon = tokio::spawn(async move { run_daemon(&config).await });
    wait_for_daemon(&client).await;

    let filter = Filter::new(
        Some(Kind::InstanceMonitorUpdated),
        Labels::new().with("node", "node1"),
    );
    let decoder = client
        .events(vec![filter], Some(4), None, DEFAULT_MAX_RECORD_SIZE)
        .await
        .expect("stream");

    let app = entity("ns1/svc/app1@node1");
    client.declare(&app).await.expect("declare");
    let path: ObjectPath = "ns1/svc/app1".parse().expect("path");
    let report = client
        .orchestrate(LocalExpect::Shutdown, vec![path], Some(5000))
        .await
        .expect("orchestrate");
    assert_eq!(report.converged, vec![app.clone()]);

    let mut states = Vec::new();
    for expected_id in 1..=4u64 {
        let event = tokio::time::timeout(Duration::from_secs(2), decoder.read())
            .await
            .expect("event in time")
            .expect("event");
        assert_eq!(event.id, expected_id);
        assert_eq!(event.kind, "InstanceMonitorUpdated");
        match event.to_msg().expect("bus message") {
            Msg::InstanceMonitorUpdated(m) => {
                assert_eq!(m.node, "node1");
                states.push(m.value.state);
            }
            other => panic!("Expected InstanceMonitorUpdated, got {:?}", other),
        }
    }
    assert_eq!(
        states,
        vec![
            MonitorState::Idle,
            MonitorState::Idle,
            MonitorState::ShuttingDown,
            MonitorState::Shutdown
        ]
    );
    assert_eq!(decoder.read().await, Err(CodecError::EndOfStream));

    client.shutdown().await.expect("shutdown");
    daemon.await.expect("join").expect("daemon result");
}

#[tokio::test]
async fn test_metrics_and_forget_over_daemon_socket() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let config = daemon_config(&temp);
    let client = DaemonClient::with_socket_path(config.ipc.socket_path.clone());
    let daemon = tokio::spawn(async move { run_daemon(&config).await });
    wait_for_daemon(&client).await;

    let app = entity("ns1/svc/app1@node1");
    client.declare(&app).await.expect("declare");
    let metrics = client.metrics().await.expect("metrics");
    assert!(metrics.subscribers >= 2);
    assert!(metrics.published >= 2);

    client.forget(&app).await.expect("forget");
    let records = client.list().await.expect("list");
    assert!(records.iter().all(|r| r.entity != app));

    client.shutdown().await.expect("shutdown");
    daemon.await.expect("join").expect("daemon result");
}

// =============================================================================
// Binary
// =============================================================================

#[test]
fn test_cli_help_lists_commands() {
    Command::cargo_bin("cm")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("orchestrate"))
        .stdout(predicate::str::contains("events"));
}

#[test]
fn test_cli_ping_without_daemon_fails() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp.path().join("clusterman.yml");
    let socket_path = temp.path().join("missing.sock");
    std::fs::write(
        &config_path,
        format!("node-name: node1\nipc:\n  socket-path: {}\n", socket_path.display()),
    )
    .expect("write config");

    Command::cargo_bin("cm")
        .expect("binary")
        .env("XDG_DATA_HOME", temp.path())
        .args(["--config", config_path.to_str().expect("utf-8 path"), "ping"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Daemon socket not found"));
}
