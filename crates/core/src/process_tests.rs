// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn config() -> ProcessConfig {
    ProcessConfig::new(vec!["worker".to_string(), "--loop".to_string()])
}

#[parameterized(
    spawning = { ProcessStatus::Spawning, true },
    running = { ProcessStatus::Running, true },
    orphaned = { ProcessStatus::Orphaned, true },
    stopping = { ProcessStatus::Stopping, false },
    stopped = { ProcessStatus::Stopped, false },
    crashed = { ProcessStatus::Crashed, false },
    dead = { ProcessStatus::Dead, false },
)]
fn recovery_sweep_targets(status: ProcessStatus, expected: bool) {
    assert_eq!(status.needs_recovery(), expected);
}

#[test]
fn restart_allowed_respects_budget() {
    let mut cfg = config();
    cfg.auto_restart = true;
    cfg.max_restarts = 3;
    assert!(cfg.restart_allowed(0));
    assert!(cfg.restart_allowed(2));
    assert!(!cfg.restart_allowed(3));
}

#[test]
fn restart_allowed_requires_auto_restart() {
    let mut cfg = config();
    cfg.max_restarts = UNLIMITED_RESTARTS;
    assert!(!cfg.restart_allowed(0));
}

#[test]
fn unlimited_restarts_never_exhaust() {
    let mut cfg = config();
    cfg.auto_restart = true;
    cfg.max_restarts = UNLIMITED_RESTARTS;
    assert!(cfg.restart_allowed(u32::MAX));
}

#[test]
fn new_record_starts_in_spawning() {
    let record = ProcessRecord::new("proc_1", "worker", config(), 10);
    assert_eq!(record.status, ProcessStatus::Spawning);
    assert_eq!(record.restart_count, 0);
    assert_eq!(record.created_at_ms, 10);
    assert!(record.pid.is_none());
}

#[test]
fn heartbeat_overdue_uses_last_heartbeat_then_started_at() {
    let mut record = ProcessRecord::new("proc_1", "worker", config(), 0);
    record.config.heartbeat.timeout_ms = 1_000;

    // No heartbeat and never started: nothing to measure from
    assert!(!record.heartbeat_overdue(10_000, 1));

    record.started_at_ms = Some(0);
    assert!(record.heartbeat_overdue(1_001, 1));

    record.last_heartbeat_ms = Some(900);
    assert!(!record.heartbeat_overdue(1_001, 1));
    assert!(record.heartbeat_overdue(1_901, 1));
}

#[test]
fn heartbeat_at_exactly_timeout_is_not_overdue() {
    let mut record = ProcessRecord::new("proc_1", "worker", config(), 0);
    record.config.heartbeat.timeout_ms = 1_000;
    record.last_heartbeat_ms = Some(0);
    assert!(!record.heartbeat_overdue(1_000, 1));
    assert!(record.heartbeat_overdue(1_001, 1));
}

#[test]
fn memory_limit_is_strictly_greater() {
    let limits = ResourceLimits {
        max_memory_mb: Some(100.0),
        ..ResourceLimits::default()
    };
    let mut stats = ProcessStats::default();

    stats.memory.rss = 100.0 * 1e6;
    assert!(stats.exceeded_limit(&limits).is_none());

    stats.memory.rss = 100.0 * 1e6 + 1.0;
    assert!(stats.exceeded_limit(&limits).is_some());
}

#[test]
fn cpu_limit_is_strictly_greater() {
    let limits = ResourceLimits {
        max_cpu_percent: Some(80.0),
        ..ResourceLimits::default()
    };
    let mut stats = ProcessStats::default();

    stats.cpu.percent = 80.0;
    assert!(stats.exceeded_limit(&limits).is_none());

    stats.cpu.percent = 80.5;
    let reason = stats.exceeded_limit(&limits);
    assert!(reason.is_some_and(|r| r.contains("cpu")));
}

#[test]
fn memory_stats_wire_names_are_camel_case() {
    let stats = MemoryStats {
        rss: 1.0,
        heap_total: 2.0,
        heap_used: 3.0,
        external: 4.0,
    };
    let text = serde_json::to_string(&stats).unwrap();
    assert!(text.contains("heapTotal"));
    assert!(text.contains("heapUsed"));
}
