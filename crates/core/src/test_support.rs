// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers for use across crates.
//!
//! Gated behind `#[cfg(any(test, feature = "test-support"))]`.

use crate::job::{Job, JobOptions, JobStatus};
use crate::log::{LogDraft, LogEntry, LogLevel, LogSource};
use crate::process::{ProcessConfig, ProcessRecord};
use crate::workflow::{StepResult, StepStatus, WorkflowInstance, WorkflowStatus};
use serde_json::json;

pub fn job(id: &str, name: &str) -> Job {
    Job::new(id, name, json!({}), JobOptions::default(), None, 1_000)
}

pub fn job_with_status(id: &str, name: &str, status: JobStatus) -> Job {
    let mut job = job(id, name);
    job.status = status;
    job
}

pub fn log_entry(id: &str, level: LogLevel, source: LogSource, message: &str) -> LogEntry {
    LogDraft::new(level, source, message).into_entry(id.to_string(), 1_000)
}

pub fn process_config(program: &str) -> ProcessConfig {
    ProcessConfig::new(vec![program.to_string()])
}

pub fn process_record(id: &str, name: &str) -> ProcessRecord {
    ProcessRecord::new(id, name, process_config("/bin/true"), 1_000)
}

pub fn instance(id: &str, workflow: &str) -> WorkflowInstance {
    WorkflowInstance::new(id, workflow, json!({}), 1_000)
}

pub fn running_instance(id: &str, workflow: &str, step: &str) -> WorkflowInstance {
    let mut inst = instance(id, workflow);
    inst.status = WorkflowStatus::Running;
    inst.current_step = Some(step.to_string());
    let mut result = StepResult::new(step);
    result.status = StepStatus::Running;
    result.attempts = 1;
    result.started_at_ms = Some(1_000);
    inst.step_results.insert(step.to_string(), result);
    inst
}
