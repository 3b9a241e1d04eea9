// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child ↔ parent IPC message vocabulary.
//!
//! Framing is line-delimited JSON: one message per line, each carrying a
//! `type` tag. Managed-process messages additionally carry the sender's
//! `processId`. The workflow executor speaks a superset with step lifecycle
//! and proxy-call messages.

use crate::log::LogLevel;
use crate::process::ProcessStats;
use crate::workflow::WorkflowInstance;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors decoding an IPC line.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message missing required field `{0}`")]
    MissingField(&'static str),
}

/// A message from a managed child process.
///
/// Wire shape: `{"processId": "...", "type": "...", ...}`. Types other than
/// the built-ins are delivered as [`ProcessMessage::Other`] with the
/// remaining fields preserved as the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessMessage {
    Heartbeat {
        process_id: String,
    },
    Stats {
        process_id: String,
        stats: ProcessStats,
    },
    Event {
        process_id: String,
        event: String,
        data: Value,
    },
    Other {
        process_id: String,
        msg_type: String,
        payload: Map<String, Value>,
    },
}

impl ProcessMessage {
    pub fn process_id(&self) -> &str {
        match self {
            ProcessMessage::Heartbeat { process_id }
            | ProcessMessage::Stats { process_id, .. }
            | ProcessMessage::Event { process_id, .. }
            | ProcessMessage::Other { process_id, .. } => process_id,
        }
    }

    /// Decode one line of child output.
    pub fn parse(line: &str) -> Result<Self, IpcError> {
        let mut fields: Map<String, Value> = serde_json::from_str(line)?;
        let process_id = fields
            .remove("processId")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or(IpcError::MissingField("processId"))?;
        let msg_type = fields
            .remove("type")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or(IpcError::MissingField("type"))?;

        match msg_type.as_str() {
            "heartbeat" => Ok(ProcessMessage::Heartbeat { process_id }),
            "stats" => {
                let stats = fields
                    .remove("stats")
                    .ok_or(IpcError::MissingField("stats"))?;
                Ok(ProcessMessage::Stats {
                    process_id,
                    stats: serde_json::from_value(stats)?,
                })
            }
            "event" => {
                let event = fields
                    .remove("event")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or(IpcError::MissingField("event"))?;
                let data = fields.remove("data").unwrap_or(Value::Null);
                Ok(ProcessMessage::Event {
                    process_id,
                    event,
                    data,
                })
            }
            _ => Ok(ProcessMessage::Other {
                process_id,
                msg_type,
                payload: fields,
            }),
        }
    }

    /// Encode as a single JSON line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut fields = Map::new();
        fields.insert(
            "processId".to_string(),
            Value::String(self.process_id().to_string()),
        );
        match self {
            ProcessMessage::Heartbeat { .. } => {
                fields.insert("type".to_string(), Value::String("heartbeat".into()));
            }
            ProcessMessage::Stats { stats, .. } => {
                fields.insert("type".to_string(), Value::String("stats".into()));
                fields.insert("stats".to_string(), serde_json::to_value(stats)?);
            }
            ProcessMessage::Event { event, data, .. } => {
                fields.insert("type".to_string(), Value::String("event".into()));
                fields.insert("event".to_string(), Value::String(event.clone()));
                fields.insert("data".to_string(), data.clone());
            }
            ProcessMessage::Other {
                msg_type, payload, ..
            } => {
                fields.insert("type".to_string(), Value::String(msg_type.clone()));
                for (k, v) in payload {
                    fields.insert(k.clone(), v.clone());
                }
            }
        }
        serde_json::to_string(&Value::Object(fields))
    }
}

/// Target service namespace of an executor proxy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyTarget {
    Plugin,
    Core,
}

/// Messages streamed by an isolated workflow executor to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutorMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "step.started")]
    StepStarted {
        step: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    #[serde(rename = "step.completed")]
    StepCompleted {
        step: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    #[serde(rename = "step.failed")]
    StepFailed {
        step: String,
        error: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    #[serde(rename = "step.poll")]
    StepPoll {
        step: String,
        poll_count: u32,
        done: bool,
    },
    #[serde(rename = "step.loop")]
    StepLoop { step: String, loop_count: u32 },
    #[serde(rename = "progress")]
    Progress {
        percent: u8,
        completed: u32,
        total: u32,
    },
    #[serde(rename = "event")]
    Event { event: String, data: Value },
    #[serde(rename = "log")]
    Log {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    /// Full instance snapshot for parent-side persistence.
    #[serde(rename = "instance.updated")]
    InstanceUpdated { instance: WorkflowInstance },
    #[serde(rename = "completed")]
    Completed {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        output: Value,
    },
    #[serde(rename = "failed")]
    Failed { error: String },
    /// Request the parent to invoke a service the child cannot reach locally.
    #[serde(rename = "proxyCall")]
    ProxyCall {
        id: u64,
        target: ProxyTarget,
        service: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

/// Control messages from the parent to an isolated workflow executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutorControl {
    #[serde(rename = "proxyResult")]
    ProxyResult {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "cancel")]
    Cancel,
}

#[cfg(test)]
#[path = "ipc_tests.rs"]
mod tests;
