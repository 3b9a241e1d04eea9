// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;

#[test]
fn defaults_without_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_state_dir(dir.path().to_path_buf()).unwrap();

    assert_eq!(config.bus.max_history_size, 1_000);
    assert_eq!(config.logs.retention_days, 14);
    assert_eq!(config.jobs.lease_ms, 30_000);
    assert!(config.workflows.executor.is_none());
    assert_eq!(config.resume, ResumeStrategy::Blocking);
    assert_eq!(config.lock_path, dir.path().join("server.pid"));
    assert_eq!(config.sockets_path, dir.path().join("sockets"));
}

#[test]
fn settings_file_overlays_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("server.toml"),
        r#"
max_history_size = 50
min_log_level = "debug"
log_retention_days = 3
job_max_concurrent = 9
kill_grace_ms = 750
executor_program = "/usr/local/bin/app-server"
executor_args = ["workflow-executor"]
resume = "background"
"#,
    )
    .unwrap();

    let config = Config::for_state_dir(dir.path().to_path_buf()).unwrap();
    assert_eq!(config.bus.max_history_size, 50);
    assert_eq!(config.logs.min_level, LogLevel::Debug);
    assert_eq!(config.logs.retention_days, 3);
    assert_eq!(config.jobs.max_concurrent, 9);
    assert_eq!(config.procs.kill_grace, Duration::from_millis(750));
    assert_eq!(config.workflows.kill_grace, Duration::from_millis(750));
    assert_eq!(config.resume, ResumeStrategy::Background);
    let executor = config.workflows.executor.unwrap();
    assert_eq!(executor.program, PathBuf::from("/usr/local/bin/app-server"));
    assert_eq!(executor.args, vec!["workflow-executor".to_string()]);
}

#[test]
fn unknown_settings_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("server.toml"), "no_such_knob = true\n").unwrap();

    let err = Config::for_state_dir(dir.path().to_path_buf()).unwrap_err();
    assert!(matches!(err, ConfigError::Settings(_)));
}

#[test]
#[serial]
fn state_dir_env_override_wins() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("DONKEYLABS_STATE_DIR", dir.path());
    let config = Config::load().unwrap();
    std::env::remove_var("DONKEYLABS_STATE_DIR");

    assert_eq!(config.state_dir, dir.path());
}
