// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server configuration: state-dir resolution plus a TOML settings overlay.

use dk_core::{LogLevel, ResumeStrategy};
use dk_events::EventBusConfig;
use dk_jobs::JobsConfig;
use dk_logs::LogsConfig;
use dk_procs::SupervisorConfig;
use dk_workflows::{ExecutorCommand, WorkflowsConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine state directory")]
    NoStateDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid settings file: {0}")]
    Settings(#[from] toml::de::Error),
}

/// Optional overrides read from `<state>/server.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Settings {
    max_history_size: Option<usize>,
    min_log_level: Option<LogLevel>,
    log_retention_days: Option<u32>,
    job_poll_interval_ms: Option<u64>,
    job_lease_ms: Option<u64>,
    job_max_concurrent: Option<usize>,
    kill_grace_ms: Option<u64>,
    heartbeat_check_interval_ms: Option<u64>,
    executor_ready_timeout_ms: Option<u64>,
    executor_heartbeat_timeout_ms: Option<u64>,
    executor_program: Option<PathBuf>,
    executor_args: Option<Vec<String>>,
    resume: Option<ResumeStrategy>,
    checkpoint_interval_secs: Option<u64>,
    use_tcp_sockets: Option<bool>,
}

/// Fully-resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root state directory.
    pub state_dir: PathBuf,
    /// Path to the lock/PID file.
    pub lock_path: PathBuf,
    /// Path to the server log file.
    pub log_path: PathBuf,
    /// Directory for process and executor sockets.
    pub sockets_path: PathBuf,
    pub bus: EventBusConfig,
    pub logs: LogsConfig,
    pub jobs: JobsConfig,
    pub procs: SupervisorConfig,
    pub workflows: WorkflowsConfig,
    /// Strategy applied to instances found running at startup.
    pub resume: ResumeStrategy,
    /// Cadence of snapshot + journal truncation.
    pub checkpoint_interval: Duration,
}

impl Config {
    /// Resolve from the environment: `DONKEYLABS_STATE_DIR`, then
    /// `$XDG_STATE_HOME/donkeylabs`, then `~/.local/state/donkeylabs`.
    /// `<state>/server.toml`, if present, overlays the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::for_state_dir(state_dir()?)
    }

    /// Resolve against an explicit state directory (tests use this).
    pub fn for_state_dir(state_dir: PathBuf) -> Result<Self, ConfigError> {
        let settings_path = state_dir.join("server.toml");
        let settings: Settings = if settings_path.exists() {
            toml::from_str(&std::fs::read_to_string(&settings_path)?)?
        } else {
            Settings::default()
        };
        Ok(Self::from_settings(state_dir, settings))
    }

    fn from_settings(state_dir: PathBuf, settings: Settings) -> Self {
        let sockets_path = state_dir.join("sockets");

        let mut bus = EventBusConfig::default();
        if let Some(size) = settings.max_history_size {
            bus.max_history_size = size;
        }

        let mut logs = LogsConfig::default();
        if let Some(level) = settings.min_log_level {
            logs.min_level = level;
        }
        if let Some(days) = settings.log_retention_days {
            logs.retention_days = days;
        }

        let mut jobs = JobsConfig::default();
        if let Some(ms) = settings.job_poll_interval_ms {
            jobs.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.job_lease_ms {
            jobs.lease_ms = ms;
        }
        if let Some(n) = settings.job_max_concurrent {
            jobs.max_concurrent = n;
        }

        let mut procs = SupervisorConfig::new(sockets_path.clone());
        if let Some(ms) = settings.kill_grace_ms {
            procs.kill_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.heartbeat_check_interval_ms {
            procs.heartbeat_check_interval = Duration::from_millis(ms);
        }
        if let Some(use_tcp) = settings.use_tcp_sockets {
            procs.use_tcp = use_tcp;
        }

        let mut workflows = WorkflowsConfig::new(sockets_path.clone());
        if let Some(ms) = settings.executor_ready_timeout_ms {
            workflows.ready_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.executor_heartbeat_timeout_ms {
            workflows.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.kill_grace_ms {
            workflows.kill_grace = Duration::from_millis(ms);
        }
        if let Some(program) = settings.executor_program {
            workflows.executor = Some(ExecutorCommand {
                program,
                args: settings.executor_args.unwrap_or_default(),
            });
        }

        Self {
            lock_path: state_dir.join("server.pid"),
            log_path: state_dir.join("server.log"),
            sockets_path,
            bus,
            logs,
            jobs,
            procs,
            workflows,
            resume: settings.resume.unwrap_or_default(),
            checkpoint_interval: Duration::from_secs(
                settings.checkpoint_interval_secs.unwrap_or(60),
            ),
            state_dir,
        }
    }
}

/// Resolve the state directory from the environment.
fn state_dir() -> Result<PathBuf, ConfigError> {
    // DONKEYLABS_STATE_DIR takes priority (used by tests for isolation)
    if let Ok(dir) = std::env::var("DONKEYLABS_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }

    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return Ok(PathBuf::from(xdg).join("donkeylabs"));
    }

    let home = std::env::var("HOME").map_err(|_| ConfigError::NoStateDir)?;
    Ok(PathBuf::from(home).join(".local/state/donkeylabs"))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
