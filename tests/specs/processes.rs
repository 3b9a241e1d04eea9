// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::support::{eventually, started_server};
use dk_core::{BackoffConfig, ProcessConfig, ProcessStatus};
use dk_procs::{ProcessDefinition, SpawnOptions};
use serde_json::json;

fn crashing_worker() -> ProcessDefinition {
    let mut config = ProcessConfig::new(vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "exit 1".to_string(),
    ]);
    config.auto_restart = true;
    config.max_restarts = 3;
    config.backoff = BackoffConfig {
        initial_ms: 10,
        multiplier: 1.0,
        max_ms: 10,
    };
    config.heartbeat.timeout_ms = 600_000;
    ProcessDefinition::new("worker", config)
}

fn sleeper(name: &str) -> ProcessDefinition {
    let mut config = ProcessConfig::new(vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "sleep 30".to_string(),
    ]);
    config.heartbeat.timeout_ms = 600_000;
    ProcessDefinition::new(name, config)
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_process_restarts_with_a_fresh_id() {
    let t = started_server().await;
    let procs = t.server.procs();
    procs.register(crashing_worker());

    let first = procs.spawn("worker", SpawnOptions::default()).await.unwrap();

    let bus = t.server.bus().clone();
    eventually("first crash and restart", || {
        !bus.get_history("process.crashed", None).is_empty()
            && !bus.get_history("process.restarted", None).is_empty()
    })
    .await;

    let restarts = t.server.bus().get_history("process.restarted", None);
    assert_eq!(restarts[0].data["attempt"], json!(1));
    assert_eq!(restarts[0].data["previous"], json!(first));
    let second = restarts[0].data["id"].as_str().unwrap().to_string();
    assert_ne!(first, second);

    // The old row is retained for audit
    let old = procs.get(&first).unwrap();
    assert_eq!(old.status, ProcessStatus::Crashed);
    let fresh = procs.get(&second).unwrap();
    assert_eq!(fresh.restart_count, 1);

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_lineage_respects_the_budget() {
    let t = started_server().await;
    let procs = t.server.procs();
    procs.register(crashing_worker());

    procs.spawn("worker", SpawnOptions::default()).await.unwrap();

    let bus = t.server.bus().clone();
    eventually("restart budget to be exhausted", || {
        bus.get_history("process.crashed", None).len() == 3
    })
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // maxRestarts = M bounds the lineage: first run + at most M restarts
    let rows = procs.get_by_name("worker");
    assert!(rows.len() <= 1 + 3, "lineage {} exceeds budget", rows.len());
    assert_eq!(t.server.bus().get_history("process.restarted", None).len(), 2);

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn spawn_stop_lifecycle_through_the_server() {
    let t = started_server().await;
    let procs = t.server.procs();
    procs.register(sleeper("svc"));

    let id = procs.spawn("svc", SpawnOptions::default()).await.unwrap();
    let record = procs.get(&id).unwrap();
    assert_eq!(record.status, ProcessStatus::Running);
    assert!(record.pid.is_some());
    assert!(record.socket_path.is_some());
    assert_eq!(procs.get_running().len(), 1);

    procs.stop(&id).await.unwrap();
    let procs_handle = procs.clone();
    let check_id = id.clone();
    eventually("process row to settle stopped", move || {
        procs_handle
            .get(&check_id)
            .is_some_and(|r| r.status == ProcessStatus::Stopped)
    })
    .await;

    assert_eq!(t.server.bus().get_history("process.spawned", None).len(), 1);
    assert_eq!(t.server.bus().get_history("process.stopped", None).len(), 1);
    assert!(procs.get_running().is_empty());

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_live_children() {
    let t = started_server().await;
    let procs = t.server.procs().clone();
    procs.register(sleeper("svc"));
    let id = procs.spawn("svc", SpawnOptions::default()).await.unwrap();
    let pid = procs.get(&id).unwrap().pid.unwrap();

    t.server.shutdown().await.unwrap();

    eventually("child pid to disappear", move || {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err()
    })
    .await;
}
