// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for the end-to-end scenarios.

use dk_server::{Config, Server};
use std::time::Duration;

pub struct TestServer {
    pub server: Server,
    _dir: tempfile::TempDir,
}

/// A started server over a fresh state directory with fast loop cadences.
pub async fn started_server() -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::for_state_dir(dir.path().to_path_buf()).expect("config");
    config.jobs.poll_interval = Duration::from_millis(10);
    config.jobs.stale_check_interval = Duration::from_millis(50);
    config.procs.kill_grace = Duration::from_millis(500);
    config.procs.heartbeat_check_interval = Duration::from_millis(100);

    let server = Server::build(config).expect("server build");
    server.start().await.expect("server start");
    TestServer { server, _dir: dir }
}

/// Poll until `f` returns true or the budget runs out.
pub async fn eventually<F: Fn() -> bool>(what: &str, f: F) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
