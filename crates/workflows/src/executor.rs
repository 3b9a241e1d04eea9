// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child side of isolated execution.
//!
//! The executor process connects to the parent's socket, re-loads the
//! workflow definition through the host-provided registry, and drives the
//! ordinary runner. Its sink streams every snapshot and event back over the
//! socket; core-service calls that cannot be satisfied locally go out as
//! `proxyCall` requests.

use crate::context::CoreServices;
use crate::definition::{StepError, WorkflowDefinition};
use crate::engine::WorkflowError;
use crate::runner::Runner;
use crate::sink::RunSink;
use crate::{ENV_EXECUTOR_SOCKET, ENV_INSTANCE_ID, ENV_WORKFLOW_INPUT, ENV_WORKFLOW_NAME};
use dk_core::{
    ExecutorControl, ExecutorMessage, LogLevel, ProxyTarget, SystemClock, UuidIdGen,
    WorkflowInstance,
};
use dk_core::{Clock, IdGen};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Heartbeat cadence of the executor child.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Resolves a workflow name back to its definition inside the executor.
pub type WorkflowRegistry = Arc<dyn Fn(&str) -> Option<WorkflowDefinition> + Send + Sync>;

/// Executor launch parameters, normally read from the environment the parent
/// set up.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub instance_id: String,
    pub workflow_name: String,
    pub input: Value,
    pub socket_path: PathBuf,
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self, WorkflowError> {
        let instance_id =
            std::env::var(ENV_INSTANCE_ID).map_err(|_| WorkflowError::MissingEnv(ENV_INSTANCE_ID))?;
        let workflow_name = std::env::var(ENV_WORKFLOW_NAME)
            .map_err(|_| WorkflowError::MissingEnv(ENV_WORKFLOW_NAME))?;
        let input = match std::env::var(ENV_WORKFLOW_INPUT) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => Value::Null,
        };
        let socket_path = std::env::var(ENV_EXECUTOR_SOCKET)
            .map_err(|_| WorkflowError::MissingEnv(ENV_EXECUTOR_SOCKET))?;
        Ok(Self {
            instance_id,
            workflow_name,
            input,
            socket_path: socket_path.into(),
        })
    }
}

struct Outbound {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl Outbound {
    async fn send(&self, message: &ExecutorMessage) {
        let mut line = match serde_json::to_string(message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "executor message serialization failed");
                return;
            }
        };
        line.push('\n');
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(error = %e, "executor send failed");
        }
        let _ = writer.flush().await;
    }
}

/// Run the executor: connect, re-load the definition, drive the instance.
///
/// This is the body of the `donkeyd workflow-executor` entry point.
pub async fn run_executor<R>(config: ExecutorConfig, registry: R) -> Result<(), WorkflowError>
where
    R: Fn(&str) -> Option<WorkflowDefinition> + Send + Sync + 'static,
{
    let stream = UnixStream::connect(&config.socket_path).await?;
    let (read_half, write_half) = stream.into_split();
    let outbound = Arc::new(Outbound {
        writer: tokio::sync::Mutex::new(write_half),
    });

    outbound.send(&ExecutorMessage::Ready).await;

    let Some(definition) = registry(&config.workflow_name) else {
        outbound
            .send(&ExecutorMessage::Failed {
                error: format!("workflow {} not in executor registry", config.workflow_name),
            })
            .await;
        return Err(WorkflowError::UnknownWorkflow(config.workflow_name));
    };

    let cancel = CancellationToken::new();
    let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    // Parent → child commands.
    {
        let pending = Arc::clone(&pending);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => {
                        // Parent is gone: nothing left to execute for.
                        cancel.cancel();
                        return;
                    }
                    Ok(_) => {}
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ExecutorControl>(trimmed) {
                    Ok(ExecutorControl::ProxyResult { id, result, error }) => {
                        if let Some(tx) = pending.lock().remove(&id) {
                            let _ = tx.send(match error {
                                Some(error) => Err(error),
                                None => Ok(result.unwrap_or(Value::Null)),
                            });
                        }
                    }
                    Ok(ExecutorControl::Cancel) => cancel.cancel(),
                    Err(e) => warn!(error = %e, "unparseable parent command"),
                }
            }
        });
    }

    // Liveness heartbeats.
    {
        let outbound = Arc::clone(&outbound);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => outbound.send(&ExecutorMessage::Heartbeat).await,
                }
            }
        });
    }

    let services = Arc::new(ProxyServices {
        outbound: Arc::clone(&outbound),
        pending,
        next_call: AtomicU64::new(1),
    });
    let sink = Arc::new(StreamSink {
        outbound: Arc::clone(&outbound),
    });

    let clock = SystemClock;
    let id_gen = UuidIdGen;
    let runner = Arc::new(Runner {
        definition: Arc::new(definition),
        services,
        sink,
        cancel,
        epoch_ms: Arc::new(move || clock.epoch_ms()),
        next_id: Arc::new(move |prefix| id_gen.next(prefix)),
        resumed: Mutex::new(HashSet::new()),
    });

    let now_ms = SystemClock.epoch_ms();
    let instance = WorkflowInstance::new(
        &config.instance_id,
        &config.workflow_name,
        config.input.clone(),
        now_ms,
    );

    // The runner's sink streams started/step/completed/failed transitions;
    // nothing more to report here.
    runner.run(instance).await;
    Ok(())
}

/// Sink that streams transitions to the parent.
struct StreamSink {
    outbound: Arc<Outbound>,
}

#[async_trait::async_trait]
impl RunSink for StreamSink {
    async fn persist(&self, instance: &WorkflowInstance) {
        self.outbound
            .send(&ExecutorMessage::InstanceUpdated {
                instance: instance.clone(),
            })
            .await;
    }

    async fn emit(&self, event: &str, data: Value) {
        let message = match event {
            "workflow.started" => ExecutorMessage::Started,
            "workflow.completed" => ExecutorMessage::Completed {
                output: data.get("output").cloned().unwrap_or(Value::Null),
            },
            "workflow.failed" => ExecutorMessage::Failed {
                error: data
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            },
            "workflow.step.started" => ExecutorMessage::StepStarted {
                step: step_name(&data),
                data,
            },
            "workflow.step.completed" => ExecutorMessage::StepCompleted {
                step: step_name(&data),
                data,
            },
            "workflow.step.failed" => ExecutorMessage::StepFailed {
                step: step_name(&data),
                error: data
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                data,
            },
            "workflow.step.poll" => ExecutorMessage::StepPoll {
                step: step_name(&data),
                poll_count: data.get("pollCount").and_then(Value::as_u64).unwrap_or(0) as u32,
                done: data.get("done").and_then(Value::as_bool).unwrap_or(false),
            },
            "workflow.step.loop" => ExecutorMessage::StepLoop {
                step: step_name(&data),
                loop_count: data.get("loopCount").and_then(Value::as_u64).unwrap_or(0) as u32,
            },
            "workflow.progress" => ExecutorMessage::Progress {
                percent: data.get("percent").and_then(Value::as_u64).unwrap_or(0) as u8,
                completed: data.get("completed").and_then(Value::as_u64).unwrap_or(0) as u32,
                total: data.get("total").and_then(Value::as_u64).unwrap_or(0) as u32,
            },
            other => ExecutorMessage::Event {
                event: other.to_string(),
                data,
            },
        };
        self.outbound.send(&message).await;
    }
}

fn step_name(data: &Value) -> String {
    data.get("step")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Core services backed by parent proxy calls.
struct ProxyServices {
    outbound: Arc<Outbound>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>,
    next_call: AtomicU64,
}

impl ProxyServices {
    async fn call(
        &self,
        target: ProxyTarget,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, String> {
        let id = self.next_call.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        self.outbound
            .send(&ExecutorMessage::ProxyCall {
                id,
                target,
                service: service.to_string(),
                method: method.to_string(),
                args,
            })
            .await;
        rx.await.map_err(|_| "proxy channel closed".to_string())?
    }
}

#[async_trait::async_trait]
impl CoreServices for ProxyServices {
    async fn emit(&self, name: &str, data: Value) {
        if let Err(e) = self
            .call(
                ProxyTarget::Core,
                "events",
                "emit",
                vec![Value::String(name.to_string()), data],
            )
            .await
        {
            warn!(error = %e, "proxied emit failed");
        }
    }

    fn log(&self, level: LogLevel, source_id: &str, message: &str) {
        // Fire-and-forget: the sync signature cannot await the proxy reply.
        let outbound = Arc::clone(&self.outbound);
        let message = ExecutorMessage::Log {
            level,
            message: message.to_string(),
            data: json!({ "sourceId": source_id }),
        };
        tokio::spawn(async move { outbound.send(&message).await });
    }

    async fn run_job(
        &self,
        name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        self.call(
            ProxyTarget::Core,
            "jobs",
            "run",
            vec![
                Value::String(name.to_string()),
                payload,
                Value::from(timeout.as_millis() as u64),
            ],
        )
        .await
        .map_err(|e| -> StepError { e.into() })
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
