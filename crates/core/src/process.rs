// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Managed process rows, configuration, and stats.

use crate::retry::BackoffConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

/// `max_restarts` value meaning "never give up".
pub const UNLIMITED_RESTARTS: i32 = -1;

/// Lifecycle status of a managed process.
///
/// `spawning → running → (stopping → stopped) | crashed`; a supervisor
/// restart after `start()` may route through `orphaned → running | dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Spawning,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Orphaned,
    Dead,
}

crate::simple_display! {
    ProcessStatus {
        Spawning => "spawning",
        Running => "running",
        Stopping => "stopping",
        Stopped => "stopped",
        Crashed => "crashed",
        Orphaned => "orphaned",
        Dead => "dead",
    }
}

impl ProcessStatus {
    /// Statuses the orphan-recovery sweep must reconcile on startup.
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Running | ProcessStatus::Spawning | ProcessStatus::Orphaned
        )
    }

    /// Whether the supervisor believes a live child backs this row.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Spawning | ProcessStatus::Running | ProcessStatus::Stopping
        )
    }
}

/// Heartbeat expectations for a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often the child is expected to send heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Silence beyond this marks the process stale; 2× forces a stop.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

/// Resource ceilings enforced from child stats messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.max_runtime_ms.is_none()
            && self.max_memory_mb.is_none()
            && self.max_cpu_percent.is_none()
    }
}

/// Serializable definition of a managed process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub auto_restart: bool,
    /// Consecutive-failure budget; [`UNLIMITED_RESTARTS`] disables the cap.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: i32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default, skip_serializing_if = "ResourceLimits::is_empty")]
    pub limits: ResourceLimits,
}

fn default_max_restarts() -> i32 {
    10
}

impl ProcessConfig {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: HashMap::new(),
            cwd: None,
            auto_restart: false,
            max_restarts: default_max_restarts(),
            backoff: BackoffConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            limits: ResourceLimits::default(),
        }
    }

    /// Whether another restart is allowed after `consecutive_failures`.
    pub fn restart_allowed(&self, consecutive_failures: u32) -> bool {
        self.auto_restart
            && (self.max_restarts == UNLIMITED_RESTARTS
                || (consecutive_failures as i64) < self.max_restarts as i64)
    }
}

/// A persisted managed-process row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    pub status: ProcessStatus,
    pub config: ProcessConfig,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_ms: Option<u64>,
    /// Total successful restarts across the row's lineage.
    #[serde(default)]
    pub restart_count: u32,
    /// Failures since the last confirmed-healthy run; gates auto-restart.
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, config: ProcessConfig, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            pid: None,
            socket_path: None,
            tcp_port: None,
            status: ProcessStatus::Spawning,
            config,
            metadata: Value::Null,
            created_at_ms: now_ms,
            started_at_ms: None,
            stopped_at_ms: None,
            last_heartbeat_ms: None,
            restart_count: 0,
            consecutive_failures: 0,
            error: None,
        }
    }

    /// Silence duration check against the heartbeat timeout.
    pub fn heartbeat_overdue(&self, now_ms: u64, factor: u64) -> bool {
        let since = self
            .last_heartbeat_ms
            .or(self.started_at_ms)
            .map(|t| now_ms.saturating_sub(t));
        since.is_some_and(|ms| ms > self.config.heartbeat.timeout_ms.saturating_mul(factor))
    }
}

/// CPU usage reported by a child stats message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub user: f64,
    #[serde(default)]
    pub system: f64,
    #[serde(default)]
    pub percent: f64,
}

/// Memory usage reported by a child stats message (bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    #[serde(default)]
    pub rss: f64,
    #[serde(default)]
    pub heap_total: f64,
    #[serde(default)]
    pub heap_used: f64,
    #[serde(default)]
    pub external: f64,
}

/// A child's self-reported resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    #[serde(default)]
    pub cpu: CpuStats,
    #[serde(default)]
    pub memory: MemoryStats,
    /// Seconds since the child started.
    #[serde(default)]
    pub uptime: f64,
}

impl ProcessStats {
    /// Which limit (if any) the stats exceed. Comparisons are strict.
    pub fn exceeded_limit(&self, limits: &ResourceLimits) -> Option<String> {
        if let Some(max_mb) = limits.max_memory_mb {
            let rss_mb = self.memory.rss / 1e6;
            if rss_mb > max_mb {
                return Some(format!("memory {rss_mb:.1}MB > {max_mb}MB"));
            }
        }
        if let Some(max_cpu) = limits.max_cpu_percent {
            if self.cpu.percent > max_cpu {
                return Some(format!("cpu {:.1}% > {max_cpu}%", self.cpu.percent));
            }
        }
        None
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
