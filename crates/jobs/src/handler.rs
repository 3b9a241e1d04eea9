// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job handler seam and per-job context.

use dk_core::{EventMetadata, LogDraft, LogLevel, LogSource};
use dk_events::EventBus;
use dk_logs::PersistentLogs;
use serde_json::Value;

/// Error type surfaced by job handlers; captured and persisted, never
/// propagated past the engine.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A registered unit-of-work implementation.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: Value, ctx: JobContext) -> Result<Value, HandlerError>;
}

/// Capabilities handed to a running handler.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub name: String,
    /// 1-based attempt number for this execution.
    pub attempts: u32,
    pub trace_id: Option<String>,
    logs: PersistentLogs,
    bus: EventBus,
}

impl JobContext {
    pub(crate) fn new(
        job_id: String,
        name: String,
        attempts: u32,
        trace_id: Option<String>,
        logs: PersistentLogs,
        bus: EventBus,
    ) -> Self {
        Self {
            job_id,
            name,
            attempts,
            trace_id,
            logs,
            bus,
        }
    }

    /// Write a job-scoped entry to the persistent logs.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs
            .write(LogDraft::new(level, LogSource::Job, message).source_id(&self.job_id));
    }

    /// Emit a per-job user event as `job.<name>.<event>`.
    pub async fn emit(&self, event: &str, data: Value) {
        let mut metadata = EventMetadata::source("jobs");
        metadata.trace_id = self.trace_id.clone();
        self.bus
            .emit_with_metadata(&format!("job.{}.{}", self.name, event), data, metadata)
            .await;
    }
}
