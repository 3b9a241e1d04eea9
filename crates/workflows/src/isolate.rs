// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Parent side of isolated execution.
//!
//! The engine binds a per-instance socket, spawns the executor child, and
//! then acts as the instance's persistence and event broker: every snapshot
//! the child streams is applied to the store, every lifecycle message becomes
//! a bus event, and `proxyCall` requests are dispatched against the parent's
//! services. Termination uses the same SIGTERM → grace → SIGKILL ladder as
//! the process supervisor.

use crate::definition::WorkflowDefinition;
use crate::engine::{executor_socket_path, WorkflowEngine};
use crate::sink::apply_snapshot;
use crate::{ENV_EXECUTOR_SOCKET, ENV_INSTANCE_ID, ENV_WORKFLOW_INPUT, ENV_WORKFLOW_NAME};
use dk_core::{
    EventMetadata, ExecutorControl as ExecutorReply, ExecutorMessage, LogDraft, LogSource,
    ProxyTarget, WorkflowInstance, WorkflowStatus,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run one instance in a dedicated executor subprocess.
///
/// `reload_key` is the registry key the child re-loads the definition by;
/// the engine only routes here for definitions registered with one.
pub(crate) async fn run_isolated(
    engine: &WorkflowEngine,
    definition: &Arc<WorkflowDefinition>,
    reload_key: &str,
    instance: WorkflowInstance,
    cancel: CancellationToken,
) {
    let inner = &engine.inner;
    let Some(command) = inner.config.executor.clone() else {
        // The engine refuses isolation without an executor; this is a backstop.
        fail_instance(engine, &instance.id, "no executor command configured").await;
        return;
    };

    let socket_path = executor_socket_path(&inner.config.socket_dir, &instance.id);
    if let Err(e) = std::fs::create_dir_all(&inner.config.socket_dir) {
        fail_instance(engine, &instance.id, &format!("socket dir: {e}")).await;
        return;
    }
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            fail_instance(engine, &instance.id, &format!("bind executor socket: {e}")).await;
            return;
        }
    };

    let input_json = match serde_json::to_string(&instance.input) {
        Ok(json) => json,
        Err(e) => {
            fail_instance(engine, &instance.id, &format!("serialize input: {e}")).await;
            return;
        }
    };

    let mut child = match tokio::process::Command::new(&command.program)
        .args(&command.args)
        .env(ENV_INSTANCE_ID, &instance.id)
        .env(ENV_WORKFLOW_NAME, reload_key)
        .env(ENV_WORKFLOW_INPUT, input_json)
        .env(ENV_EXECUTOR_SOCKET, &socket_path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            fail_instance(engine, &instance.id, &format!("spawn executor: {e}")).await;
            let _ = std::fs::remove_file(&socket_path);
            return;
        }
    };
    let pid = child.id();
    info!(instance_id = %instance.id, pid, "executor spawned");

    // Accept the child's connection within the ready window.
    let accepted = tokio::select! {
        accepted = listener.accept() => accepted.ok().map(|(stream, _)| stream),
        _ = tokio::time::sleep(inner.config.ready_timeout) => None,
        _ = cancel.cancelled() => None,
    };
    let Some(stream) = accepted else {
        if cancel.is_cancelled() {
            terminate_child(&mut child, pid, inner.config.kill_grace).await;
        } else {
            terminate_child(&mut child, pid, inner.config.kill_grace).await;
            fail_instance(
                engine,
                &instance.id,
                &format!(
                    "Executor not ready within {}ms",
                    inner.config.ready_timeout.as_millis()
                ),
            )
            .await;
        }
        let _ = std::fs::remove_file(&socket_path);
        return;
    };

    let outcome = supervise(engine, definition, &instance, stream, &cancel).await;

    match outcome {
        Supervision::Finished => {
            // Row settled via the child's final snapshot; let the child exit.
            let _ = tokio::time::timeout(inner.config.kill_grace, child.wait()).await;
        }
        Supervision::Cancelled => {
            terminate_child(&mut child, pid, inner.config.kill_grace).await;
        }
        Supervision::NotReady => {
            terminate_child(&mut child, pid, inner.config.kill_grace).await;
            fail_instance(
                engine,
                &instance.id,
                &format!(
                    "Executor not ready within {}ms",
                    inner.config.ready_timeout.as_millis()
                ),
            )
            .await;
        }
        Supervision::HeartbeatLost => {
            emit(engine, "workflow.watchdog.stale", json!({ "id": instance.id })).await;
            emit(engine, "workflow.watchdog.killed", json!({ "id": instance.id })).await;
            terminate_child(&mut child, pid, inner.config.kill_grace).await;
            fail_instance(engine, &instance.id, "Executor heartbeat timeout").await;
        }
        Supervision::ChildGone => {
            let code = match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => status.code(),
                _ => None,
            };
            fail_instance(
                engine,
                &instance.id,
                &format!(
                    "Subprocess crashed with exit code {}",
                    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                ),
            )
            .await;
        }
    }

    let _ = std::fs::remove_file(&socket_path);
}

enum Supervision {
    /// Child reported completed/failed; row is settled.
    Finished,
    Cancelled,
    NotReady,
    HeartbeatLost,
    /// Connection ended before a final message.
    ChildGone,
}

/// Pump the executor connection until the instance finishes or goes wrong.
async fn supervise(
    engine: &WorkflowEngine,
    definition: &Arc<WorkflowDefinition>,
    instance: &WorkflowInstance,
    stream: UnixStream,
    cancel: &CancellationToken,
) -> Supervision {
    let inner = &engine.inner;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let mut ready = false;

    loop {
        line.clear();
        // Until `ready` arrives the child only gets the ready window; the
        // longer heartbeat window applies after that.
        let idle_limit = if ready {
            inner.config.heartbeat_timeout
        } else {
            inner.config.ready_timeout
        };
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read,
            _ = tokio::time::sleep(idle_limit) => {
                return if ready {
                    Supervision::HeartbeatLost
                } else {
                    Supervision::NotReady
                };
            }
            _ = cancel.cancelled() => return Supervision::Cancelled,
        };

        match read {
            Ok(0) => return Supervision::ChildGone,
            Ok(_) => {}
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "executor read failed");
                return Supervision::ChildGone;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let message: ExecutorMessage = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "executor protocol error");
                return Supervision::ChildGone;
            }
        };

        match message {
            ExecutorMessage::Ready => {
                ready = true;
            }
            ExecutorMessage::Heartbeat => {}
            ExecutorMessage::Started => {
                emit(
                    engine,
                    "workflow.started",
                    json!({
                        "id": instance.id,
                        "workflowName": instance.workflow_name,
                        "input": instance.input,
                    }),
                )
                .await;
            }
            ExecutorMessage::InstanceUpdated { instance: snapshot } => {
                apply_snapshot(&inner.store, &snapshot);
            }
            ExecutorMessage::StepStarted { data, .. } => {
                emit(engine, "workflow.step.started", data).await;
            }
            ExecutorMessage::StepCompleted { data, .. } => {
                emit(engine, "workflow.step.completed", data).await;
            }
            ExecutorMessage::StepFailed { data, .. } => {
                emit(engine, "workflow.step.failed", data).await;
            }
            ExecutorMessage::StepPoll {
                step,
                poll_count,
                done,
            } => {
                emit(
                    engine,
                    "workflow.step.poll",
                    json!({
                        "id": instance.id,
                        "workflowName": instance.workflow_name,
                        "step": step,
                        "pollCount": poll_count,
                        "done": done,
                    }),
                )
                .await;
            }
            ExecutorMessage::StepLoop { step, loop_count } => {
                emit(
                    engine,
                    "workflow.step.loop",
                    json!({
                        "id": instance.id,
                        "workflowName": instance.workflow_name,
                        "step": step,
                        "loopCount": loop_count,
                    }),
                )
                .await;
            }
            ExecutorMessage::Progress {
                percent,
                completed,
                total,
            } => {
                emit(
                    engine,
                    "workflow.progress",
                    json!({
                        "id": instance.id,
                        "workflowName": instance.workflow_name,
                        "percent": percent,
                        "completed": completed,
                        "total": total,
                    }),
                )
                .await;
            }
            ExecutorMessage::Event { event, data } => {
                emit(engine, &event, data).await;
            }
            ExecutorMessage::Log {
                level,
                message,
                data,
            } => {
                let mut draft =
                    LogDraft::new(level, LogSource::Workflow, message).source_id(&instance.id);
                if let Value::Object(map) = data {
                    draft.data = map;
                }
                inner.logs.write(draft);
            }
            ExecutorMessage::Completed { output } => {
                emit(
                    engine,
                    "workflow.completed",
                    json!({
                        "id": instance.id,
                        "workflowName": instance.workflow_name,
                        "output": output,
                    }),
                )
                .await;
                return Supervision::Finished;
            }
            ExecutorMessage::Failed { error } => {
                emit(
                    engine,
                    "workflow.failed",
                    json!({
                        "id": instance.id,
                        "workflowName": instance.workflow_name,
                        "error": error,
                    }),
                )
                .await;
                return Supervision::Finished;
            }
            ExecutorMessage::ProxyCall {
                id,
                target,
                service,
                method,
                args,
            } => {
                let reply = dispatch_proxy(engine, definition, target, &service, &method, args).await;
                let reply = match reply {
                    Ok(result) => ExecutorReply::ProxyResult {
                        id,
                        result: Some(result),
                        error: None,
                    },
                    Err(error) => ExecutorReply::ProxyResult {
                        id,
                        result: None,
                        error: Some(error),
                    },
                };
                match serde_json::to_string(&reply) {
                    Ok(mut out) => {
                        out.push('\n');
                        if let Err(e) = write_half.write_all(out.as_bytes()).await {
                            warn!(instance_id = %instance.id, error = %e, "proxy reply failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "proxy reply serialization failed"),
                }
            }
        }

        if !ready {
            // First message must be `ready`.
            return Supervision::NotReady;
        }
    }
}

/// Execute a proxied service call against the parent's components.
async fn dispatch_proxy(
    engine: &WorkflowEngine,
    _definition: &Arc<WorkflowDefinition>,
    target: ProxyTarget,
    service: &str,
    method: &str,
    mut args: Vec<Value>,
) -> Result<Value, String> {
    let inner = &engine.inner;
    match target {
        ProxyTarget::Plugin => Err(format!("plugin service {service} is not available")),
        ProxyTarget::Core => match (service, method) {
            ("events", "emit") => {
                if args.len() < 2 {
                    return Err("events.emit expects (name, data)".to_string());
                }
                let data = args.remove(1);
                let name = args
                    .remove(0)
                    .as_str()
                    .map(str::to_string)
                    .ok_or("events.emit: name must be a string")?;
                inner
                    .bus
                    .emit_with_metadata(&name, data, EventMetadata::source("workflows"))
                    .await;
                Ok(Value::Null)
            }
            ("logs", "write") => {
                let draft = args
                    .pop()
                    .ok_or("logs.write expects a log draft")
                    .and_then(|v| {
                        serde_json::from_value::<LogDraft>(v).map_err(|_| "invalid log draft")
                    })
                    .map_err(str::to_string)?;
                inner.logs.write(draft);
                Ok(Value::Null)
            }
            ("jobs", "run") => {
                let jobs = inner.jobs.clone().ok_or("jobs engine not available")?;
                if args.len() < 2 {
                    return Err("jobs.run expects (name, payload, timeoutMs?)".to_string());
                }
                let timeout_ms = args
                    .get(2)
                    .and_then(Value::as_u64)
                    .unwrap_or(60_000);
                let payload = args.remove(1);
                let name = args
                    .remove(0)
                    .as_str()
                    .map(str::to_string)
                    .ok_or("jobs.run: name must be a string")?;
                let id = jobs
                    .enqueue(&name, payload, dk_core::JobOptions::default())
                    .map_err(|e| e.to_string())?;
                let job = jobs
                    .wait_for(&id, Duration::from_millis(timeout_ms))
                    .await
                    .map_err(|e| e.to_string())?;
                match job.status {
                    dk_core::JobStatus::Completed => Ok(job.result.unwrap_or(Value::Null)),
                    _ => Err(job.error.unwrap_or_else(|| format!("job {id} {}", job.status))),
                }
            }
            _ => Err(format!("unknown core service {service}.{method}")),
        },
    }
}

/// SIGTERM, grace window, SIGKILL, then reap.
async fn terminate_child(child: &mut tokio::process::Child, pid: Option<u32>, grace: Duration) {
    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

async fn fail_instance(engine: &WorkflowEngine, id: &str, error: &str) {
    let now_ms = (engine.inner.epoch_ms)();
    let error_owned = error.to_string();
    let updated = engine.inner.store.update_instance(id, |instance| {
        if instance.is_terminal() {
            return false;
        }
        instance.status = WorkflowStatus::Failed;
        instance.error = Some(error_owned.clone());
        instance.completed_at_ms = Some(now_ms);
        true
    });

    match updated {
        Ok(Some(instance)) => {
            emit(
                engine,
                "workflow.failed",
                json!({
                    "id": id,
                    "workflowName": instance.workflow_name,
                    "error": error,
                }),
            )
            .await;
        }
        Ok(None) => {}
        Err(e) => warn!(instance_id = %id, error = %e, "failed-instance bookkeeping failed"),
    }
}

async fn emit(engine: &WorkflowEngine, event: &str, data: Value) {
    engine
        .inner
        .bus
        .emit_with_metadata(event, data, EventMetadata::source("workflows"))
        .await;
}

#[cfg(test)]
#[path = "isolate_tests.rs"]
mod tests;
