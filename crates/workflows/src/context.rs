// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Step execution context and the core-services seam.
//!
//! Handlers see the same [`StepContext`] whether the instance runs inline or
//! in an executor subprocess; only the [`CoreServices`] behind it differ
//! (direct calls vs. proxy calls over the executor socket).

use crate::definition::StepError;
use dk_core::{LogDraft, LogLevel, LogSource, StepResult, WorkflowInstance};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Engine capabilities reachable from step handlers.
#[async_trait::async_trait]
pub trait CoreServices: Send + Sync {
    /// Publish an event onto the bus.
    async fn emit(&self, name: &str, data: Value);

    /// Write to the persistent logs.
    fn log(&self, level: LogLevel, source_id: &str, message: &str);

    /// Enqueue a job and await its result.
    async fn run_job(&self, name: &str, payload: Value, timeout: Duration)
        -> Result<Value, StepError>;
}

/// Direct in-process services for inline execution.
pub(crate) struct LocalServices {
    pub bus: dk_events::EventBus,
    pub logs: dk_logs::PersistentLogs,
    pub jobs: Option<dk_jobs::JobsEngine>,
}

#[async_trait::async_trait]
impl CoreServices for LocalServices {
    async fn emit(&self, name: &str, data: Value) {
        self.bus
            .emit_with_metadata(name, data, dk_core::EventMetadata::source("workflows"))
            .await;
    }

    fn log(&self, level: LogLevel, source_id: &str, message: &str) {
        self.logs
            .write(LogDraft::new(level, LogSource::Workflow, message).source_id(source_id));
    }

    async fn run_job(
        &self,
        name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or("jobs engine not wired into this workflow engine")?;
        let id = jobs.enqueue(name, payload, dk_core::JobOptions::default())?;
        let job = jobs.wait_for(&id, timeout).await?;
        match job.status {
            dk_core::JobStatus::Completed => Ok(job.result.unwrap_or(Value::Null)),
            _ => Err(job
                .error
                .unwrap_or_else(|| format!("job {id} ended as {}", job.status))
                .into()),
        }
    }
}

/// Everything a step handler can see and do.
#[derive(Clone)]
pub struct StepContext {
    /// The computed input of the current step.
    pub input: Value,
    /// The instance's original input.
    pub workflow_input: Value,
    /// Previous step's output along the traversed path.
    pub prev: Value,
    /// Snapshot of the instance row at step start.
    pub instance: WorkflowInstance,
    services: Arc<dyn CoreServices>,
    /// Metadata writes staged by the handler, applied and persisted by the
    /// runner after the call returns.
    pending_metadata: Arc<Mutex<Vec<(String, Value)>>>,
}

impl StepContext {
    pub(crate) fn new(
        input: Value,
        prev: Value,
        instance: WorkflowInstance,
        services: Arc<dyn CoreServices>,
    ) -> Self {
        Self {
            workflow_input: instance.input.clone(),
            input,
            prev,
            instance,
            services,
            pending_metadata: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Output of a prior step along the traversed path, if it completed.
    pub fn step_output(&self, name: &str) -> Option<&Value> {
        self.instance
            .step_results
            .get(name)
            .and_then(|r| r.output.as_ref())
    }

    /// Full persisted result for a prior step.
    pub fn step_result(&self, name: &str) -> Option<&StepResult> {
        self.instance.step_results.get(name)
    }

    /// Metadata value from the instance snapshot.
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.instance.metadata.get(key)
    }

    /// Stage a metadata write; the runner persists it with the step result.
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.pending_metadata.lock().push((key.into(), value));
    }

    pub(crate) fn take_metadata_writes(&self) -> Vec<(String, Value)> {
        self.pending_metadata.lock().drain(..).collect()
    }

    /// Publish a user event as `workflow.event`.
    pub async fn emit(&self, event: &str, data: Value) {
        self.services
            .emit(
                "workflow.event",
                serde_json::json!({
                    "id": self.instance.id,
                    "workflowName": self.instance.workflow_name,
                    "event": event,
                    "data": data,
                }),
            )
            .await;
    }

    /// Write an instance-scoped entry to the persistent logs.
    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        self.services.log(level, &self.instance.id, message.as_ref());
    }

    pub(crate) fn services(&self) -> Arc<dyn CoreServices> {
        Arc::clone(&self.services)
    }
}
