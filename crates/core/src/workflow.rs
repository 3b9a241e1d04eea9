// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow instance rows and per-step results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

crate::simple_display! {
    WorkflowStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
        TimedOut => "timed_out",
    }
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::TimedOut
        )
    }
}

/// Status of a single step within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

crate::simple_display! {
    StepStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Skipped => "skipped",
    }
}

/// Persisted record of one named step's execution within an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    /// Execution attempts for this step (monotonic within one traversal).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub poll_count: u32,
    #[serde(default)]
    pub loop_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polled_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_looped_at_ms: Option<u64>,
}

impl StepResult {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            input: Value::Null,
            output: None,
            error: None,
            started_at_ms: None,
            completed_at_ms: None,
            attempts: 0,
            poll_count: 0,
            loop_count: 0,
            loop_started_at_ms: None,
            last_polled_at_ms: None,
            last_looped_at_ms: None,
        }
    }
}

/// How `resume()` treats instances found `running` at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeStrategy {
    /// Mark each as failed without re-executing.
    Skip,
    /// Resume sequentially, propagating the first error.
    #[default]
    Blocking,
    /// Resume concurrently, swallowing per-instance errors.
    Background,
}

/// A persisted workflow instance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub step_results: HashMap<String, StepResult>,
    /// Child instance ids per parallel step name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub branch_instances: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

impl WorkflowInstance {
    pub fn new(
        id: impl Into<String>,
        workflow_name: impl Into<String>,
        input: Value,
        now_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_name: workflow_name.into(),
            status: WorkflowStatus::Pending,
            current_step: None,
            input,
            output: None,
            error: None,
            step_results: HashMap::new(),
            branch_instances: HashMap::new(),
            metadata: Map::new(),
            parent_id: None,
            branch_name: None,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completed steps out of the steps recorded so far.
    pub fn completed_step_count(&self) -> usize {
        self.step_results
            .values()
            .filter(|r| r.status == StepStatus::Completed)
            .count()
    }
}

#[cfg(test)]
#[path = "workflow_tests.rs"]
mod tests;
