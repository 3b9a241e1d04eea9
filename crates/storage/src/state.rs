// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized tables and the journaled mutation vocabulary.

use dk_core::{Job, LogEntry, LogSource, ProcessRecord, WorkflowInstance};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single journaled mutation. Replaying ops in sequence order reproduces
/// [`Tables`] exactly; row puts are last-write-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    PutJob(Job),
    PutProcess(ProcessRecord),
    PutInstance(WorkflowInstance),
    AppendLogs(Vec<LogEntry>),
    PruneLogs { source: LogSource, cutoff_ms: u64 },
}

/// The materialized row sets.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    pub jobs: HashMap<String, Job>,
    #[serde(default)]
    pub processes: HashMap<String, ProcessRecord>,
    #[serde(default)]
    pub instances: HashMap<String, WorkflowInstance>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl Tables {
    /// Apply one mutation.
    pub fn apply(&mut self, op: &Op) {
        match op {
            Op::PutJob(job) => {
                self.jobs.insert(job.id.clone(), job.clone());
            }
            Op::PutProcess(record) => {
                self.processes.insert(record.id.clone(), record.clone());
            }
            Op::PutInstance(instance) => {
                self.instances.insert(instance.id.clone(), instance.clone());
            }
            Op::AppendLogs(batch) => {
                self.logs.extend(batch.iter().cloned());
            }
            Op::PruneLogs { source, cutoff_ms } => {
                self.logs
                    .retain(|e| e.source != *source || e.timestamp_ms >= *cutoff_ms);
            }
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
