// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistence/event sink behind the runner.
//!
//! The runner drives the state machine against this seam; inline execution
//! persists to the store and emits on the bus directly, while the executor
//! child streams the same transitions over its socket for the parent to
//! apply. Both paths persist the identical instance snapshots.

use dk_core::{EventMetadata, StepResult, WorkflowInstance};
use dk_events::EventBus;
use dk_storage::Store;
use serde_json::{json, Value};
use tracing::warn;

/// Where step transitions land.
#[async_trait::async_trait]
pub(crate) trait RunSink: Send + Sync {
    /// Persist the instance snapshot. Terminal rows are never overwritten.
    async fn persist(&self, instance: &WorkflowInstance);

    /// Emit a `workflow.*` event.
    async fn emit(&self, event: &str, data: Value);
}

/// Inline sink: store + bus.
pub(crate) struct InlineSink {
    pub store: Store,
    pub bus: EventBus,
}

#[async_trait::async_trait]
impl RunSink for InlineSink {
    async fn persist(&self, instance: &WorkflowInstance) {
        apply_snapshot(&self.store, instance);
    }

    async fn emit(&self, event: &str, data: Value) {
        self.bus
            .emit_with_metadata(event, data, EventMetadata::source("workflows"))
            .await;
    }
}

/// Upsert an instance snapshot, refusing to mutate terminal rows.
pub(crate) fn apply_snapshot(store: &Store, instance: &WorkflowInstance) {
    let updated = store.update_instance(&instance.id, |row| {
        if row.is_terminal() {
            return false;
        }
        *row = instance.clone();
        true
    });

    match updated {
        Ok(Some(_)) => {}
        Ok(None) => {
            // Row missing (new child instance) or terminal (late write).
            if store.instance(&instance.id).is_none() {
                if let Err(e) = store.upsert_instance(instance.clone()) {
                    warn!(instance_id = %instance.id, error = %e, "instance insert failed");
                }
            }
        }
        Err(e) => warn!(instance_id = %instance.id, error = %e, "instance persist failed"),
    }
}

/// Common payload shape for `workflow.step.*` events.
pub(crate) fn step_event_data(instance: &WorkflowInstance, result: &StepResult) -> Value {
    json!({
        "id": instance.id,
        "workflowName": instance.workflow_name,
        "step": result.step_name,
        "attempt": result.attempts,
        "status": result.status,
        "output": result.output,
        "error": result.error,
    })
}
