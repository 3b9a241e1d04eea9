// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job row and status machine.

use crate::retry::BackoffConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default retry budget when the caller does not set one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle status of a job.
///
/// `pending|scheduled → running → completed | failed`, with failed attempts
/// going back through `scheduled` while the retry budget lasts. `completed`,
/// `failed`, and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

crate::simple_display! {
    JobStatus {
        Pending => "pending",
        Scheduled => "scheduled",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Caller-supplied options for enqueue/schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub retry: BackoffConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: BackoffConfig::default(),
            trace_id: None,
        }
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub retry: BackoffConfig,
    /// Earliest time the job may run (scheduled jobs and retry delays).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at_ms: Option<u64>,
    /// Lease expiry while running; an expired lease reopens the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
}

impl Job {
    /// Create a new pending (or, with `run_at_ms`, scheduled) job row.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
        opts: JobOptions,
        run_at_ms: Option<u64>,
        now_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            payload,
            status: if run_at_ms.is_some() {
                JobStatus::Scheduled
            } else {
                JobStatus::Pending
            },
            attempts: 0,
            max_attempts: opts.max_attempts.max(1),
            retry: opts.retry,
            run_at_ms,
            lease_until_ms: None,
            last_heartbeat_ms: None,
            trace_id: opts.trace_id,
            result: None,
            error: None,
            created_at_ms: now_ms,
            started_at_ms: None,
            finished_at_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job is claimable at `now_ms`: pending, or scheduled with a
    /// due `run_at_ms`.
    pub fn is_due(&self, now_ms: u64) -> bool {
        match self.status {
            JobStatus::Pending => self.run_at_ms.is_none_or(|at| at <= now_ms),
            JobStatus::Scheduled => self.run_at_ms.is_some_and(|at| at <= now_ms),
            _ => false,
        }
    }

    /// Whether a running job's lease has lapsed without a fresh heartbeat.
    pub fn lease_expired(&self, now_ms: u64) -> bool {
        self.status == JobStatus::Running
            && self.lease_until_ms.is_some_and(|until| until < now_ms)
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
