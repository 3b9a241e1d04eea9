// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The workflows engine: registry, instance lifecycle, resume, cancel.

use crate::context::LocalServices;
use crate::definition::WorkflowDefinition;
use crate::runner::Runner;
use crate::sink::InlineSink;
use crate::isolate;
use dk_core::{
    Clock, EventMetadata, IdGen, SystemClock, UuidIdGen, WorkflowInstance, WorkflowStatus,
};
use dk_core::{ResumeStrategy, StepStatus};
use dk_events::EventBus;
use dk_jobs::JobsEngine;
use dk_logs::PersistentLogs;
use dk_storage::{Store, StoreError};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors from workflow-engine operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("No workflow named {0}")]
    UnknownWorkflow(String),
    #[error("Workflow {0} requires isolation but no executor command is configured")]
    IsolationUnavailable(String),
    #[error("Workflow {0} has no reload locator and cannot run isolated")]
    NoReloadLocator(String),
    #[error("Instance not found: {0}")]
    NotFound(String),
    #[error("Timed out waiting for instance {0}")]
    WaitTimeout(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
}

/// Command line used to start an isolated workflow executor.
///
/// The child re-invokes this program, which must call
/// [`crate::run_executor`] with a registry able to reload the definition by
/// name. A definition without such a registry entry cannot be isolated.
#[derive(Debug, Clone)]
pub struct ExecutorCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Tuning knobs for [`WorkflowEngine`].
#[derive(Debug, Clone)]
pub struct WorkflowsConfig {
    /// Directory for executor sockets.
    pub socket_dir: PathBuf,
    /// Enables isolated execution when set.
    pub executor: Option<ExecutorCommand>,
    /// Wait for the executor's `ready` message.
    pub ready_timeout: Duration,
    /// Silence bound on a running executor.
    pub heartbeat_timeout: Duration,
    /// Wait after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
}

impl WorkflowsConfig {
    pub fn new(socket_dir: PathBuf) -> Self {
        Self {
            socket_dir,
            executor: None,
            ready_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub metadata: Map<String, Value>,
}

struct RunningHandle {
    cancel: CancellationToken,
}

#[derive(Clone)]
struct RegisteredWorkflow {
    definition: Arc<WorkflowDefinition>,
    /// Registry key the executor child can re-load this definition by.
    /// `None` means the definition is not reachable from the executor binary
    /// and is refused isolation before anything is spawned.
    reload_key: Option<String>,
}

pub(crate) struct WfInner {
    pub(crate) config: WorkflowsConfig,
    pub(crate) store: Store,
    pub(crate) bus: EventBus,
    pub(crate) logs: PersistentLogs,
    pub(crate) jobs: Option<JobsEngine>,
    definitions: Mutex<HashMap<String, RegisteredWorkflow>>,
    running: Mutex<HashMap<String, RunningHandle>>,
    pub(crate) next_id: Arc<dyn Fn(&str) -> String + Send + Sync>,
    pub(crate) epoch_ms: Arc<dyn Fn() -> u64 + Send + Sync>,
}

/// Durable step/state-machine orchestrator.
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) inner: Arc<WfInner>,
}

impl WorkflowEngine {
    pub fn new(
        store: Store,
        bus: EventBus,
        logs: PersistentLogs,
        jobs: Option<JobsEngine>,
        config: WorkflowsConfig,
    ) -> Self {
        Self::with_deps(store, bus, logs, jobs, config, SystemClock, UuidIdGen)
    }

    pub fn with_deps<C: Clock, G: IdGen>(
        store: Store,
        bus: EventBus,
        logs: PersistentLogs,
        jobs: Option<JobsEngine>,
        config: WorkflowsConfig,
        clock: C,
        id_gen: G,
    ) -> Self {
        Self {
            inner: Arc::new(WfInner {
                config,
                store,
                bus,
                logs,
                jobs,
                definitions: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                next_id: Arc::new(move |prefix| id_gen.next(prefix)),
                epoch_ms: Arc::new(move || clock.epoch_ms()),
            }),
        }
    }

    /// Register (or replace) a workflow definition.
    ///
    /// Definitions registered this way carry no reload locator, so isolated
    /// runs are refused up front; use [`Self::register_reloadable`] when the
    /// executor binary can re-load the definition by name.
    pub fn register(&self, definition: WorkflowDefinition) {
        self.insert_definition(definition, None);
    }

    /// Register a definition the executor child can re-load by its name (the
    /// registry key handed to `run_executor`). Required for isolated runs.
    pub fn register_reloadable(&self, definition: WorkflowDefinition) {
        let reload_key = Some(definition.name.clone());
        self.insert_definition(definition, reload_key);
    }

    fn insert_definition(&self, definition: WorkflowDefinition, reload_key: Option<String>) {
        self.inner.definitions.lock().insert(
            definition.name.clone(),
            RegisteredWorkflow {
                definition: Arc::new(definition),
                reload_key,
            },
        );
    }

    pub fn definition(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner
            .definitions
            .lock()
            .get(name)
            .map(|r| Arc::clone(&r.definition))
    }

    /// Start a new instance. Returns its id; execution proceeds in the
    /// background (inline task or executor subprocess).
    pub fn run(&self, name: &str, input: Value) -> Result<String, WorkflowError> {
        self.run_with(name, input, RunOptions::default())
    }

    pub fn run_with(
        &self,
        name: &str,
        input: Value,
        opts: RunOptions,
    ) -> Result<String, WorkflowError> {
        let registered = self
            .inner
            .definitions
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflow(name.to_string()))?;
        if registered.definition.isolated {
            if self.inner.config.executor.is_none() {
                return Err(WorkflowError::IsolationUnavailable(name.to_string()));
            }
            if registered.reload_key.is_none() {
                return Err(WorkflowError::NoReloadLocator(name.to_string()));
            }
        }

        let id = (self.inner.next_id)("wf");
        let now_ms = (self.inner.epoch_ms)();
        let mut instance = WorkflowInstance::new(&id, name, input, now_ms);
        instance.metadata = opts.metadata;
        self.inner.store.upsert_instance(instance.clone())?;

        self.launch(registered, instance);
        Ok(id)
    }

    /// Spawn the execution task for an instance.
    fn launch(&self, registered: RegisteredWorkflow, instance: WorkflowInstance) {
        let cancel = CancellationToken::new();
        self.inner.running.lock().insert(
            instance.id.clone(),
            RunningHandle {
                cancel: cancel.clone(),
            },
        );

        let engine = self.clone();
        let definition = registered.definition;
        let reload_key = registered
            .reload_key
            .filter(|_| definition.isolated && self.inner.config.executor.is_some());
        tokio::spawn(async move {
            let id = instance.id.clone();
            if let Some(reload_key) = reload_key {
                isolate::run_isolated(&engine, &definition, &reload_key, instance, cancel).await;
            } else {
                let runner = Arc::new(engine.make_runner(&definition, cancel));
                runner.run(instance).await;
            }
            engine.inner.running.lock().remove(&id);
        });
    }

    pub(crate) fn make_runner(
        &self,
        definition: &Arc<WorkflowDefinition>,
        cancel: CancellationToken,
    ) -> Runner {
        let inner = &self.inner;
        Runner {
            definition: Arc::clone(definition),
            services: Arc::new(LocalServices {
                bus: inner.bus.clone(),
                logs: inner.logs.clone(),
                jobs: inner.jobs.clone(),
            }),
            sink: Arc::new(InlineSink {
                store: inner.store.clone(),
                bus: inner.bus.clone(),
            }),
            cancel,
            epoch_ms: Arc::clone(&inner.epoch_ms),
            next_id: Arc::clone(&inner.next_id),
            resumed: Mutex::new(HashSet::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<WorkflowInstance> {
        self.inner.store.instance(id)
    }

    /// Block until the instance reaches a terminal state.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<WorkflowInstance, WorkflowError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.inner.store.instance(id) {
                Some(instance) if instance.is_terminal() => return Ok(instance),
                Some(_) => {}
                None => return Err(WorkflowError::NotFound(id.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WorkflowError::WaitTimeout(id.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cancel an instance: terminal row transition, timers and child process
    /// torn down, `workflow.cancelled` emitted. Late step completions from
    /// the in-flight run are ignored by the sink's terminal guard.
    pub async fn cancel(&self, id: &str) -> Result<bool, WorkflowError> {
        let now_ms = (self.inner.epoch_ms)();
        let updated = self.inner.store.update_instance(id, |instance| {
            if instance.is_terminal() {
                return false;
            }
            instance.status = WorkflowStatus::Cancelled;
            instance.completed_at_ms = Some(now_ms);
            true
        })?;

        let Some(instance) = updated else {
            return Ok(false);
        };

        if let Some(handle) = self.inner.running.lock().get(id) {
            handle.cancel.cancel();
        }
        // Child instances of in-flight parallel steps observe their parent
        // token; their rows settle as cancelled through their own runners.

        self.inner
            .bus
            .emit_with_metadata(
                "workflow.cancelled",
                json!({ "id": id, "workflowName": instance.workflow_name }),
                EventMetadata::source("workflows"),
            )
            .await;
        Ok(true)
    }

    /// Reconcile instances left `running` by a previous process.
    pub async fn resume(&self, strategy: ResumeStrategy) -> Result<(), WorkflowError> {
        // Stale executor sockets first: files no live run owns.
        let running_ids: HashSet<String> = self.inner.running.lock().keys().cloned().collect();
        cleanup_executor_sockets(&self.inner.config.socket_dir, &running_ids);

        let stranded: Vec<WorkflowInstance> = self
            .inner
            .store
            .running_instances()
            .into_iter()
            .filter(|i| !running_ids.contains(&i.id))
            .collect();

        if !stranded.is_empty() {
            info!(count = stranded.len(), ?strategy, "resuming stranded workflow instances");
        }

        for instance in stranded {
            match strategy {
                ResumeStrategy::Skip => {
                    let now_ms = (self.inner.epoch_ms)();
                    let updated = self.inner.store.update_instance(&instance.id, |row| {
                        if row.is_terminal() {
                            return false;
                        }
                        row.status = WorkflowStatus::Failed;
                        row.error = Some("Workflow resume skipped".to_string());
                        row.completed_at_ms = Some(now_ms);
                        true
                    })?;
                    if updated.is_some() {
                        self.inner
                            .bus
                            .emit_with_metadata(
                                "workflow.failed",
                                json!({
                                    "id": instance.id,
                                    "workflowName": instance.workflow_name,
                                    "error": "Workflow resume skipped",
                                }),
                                EventMetadata::source("workflows"),
                            )
                            .await;
                    }
                }
                ResumeStrategy::Blocking => self.resume_one(instance).await,
                ResumeStrategy::Background => {
                    let engine = self.clone();
                    tokio::spawn(async move { engine.resume_one(instance).await });
                }
            }
        }
        Ok(())
    }

    /// Re-drive one stranded instance, reusing completed step outputs.
    ///
    /// Resumed instances always run inline: the parent process holds the
    /// registered definitions, and only the interrupted remainder of the
    /// graph is re-executed.
    async fn resume_one(&self, instance: WorkflowInstance) {
        let Some(definition) = self.definition(&instance.workflow_name) else {
            warn!(
                instance_id = %instance.id,
                workflow = %instance.workflow_name,
                "cannot resume: definition not registered"
            );
            let now_ms = (self.inner.epoch_ms)();
            let result = self.inner.store.update_instance(&instance.id, |row| {
                if row.is_terminal() {
                    return false;
                }
                row.status = WorkflowStatus::Failed;
                row.error = Some(format!(
                    "workflow definition {} not registered at resume",
                    instance.workflow_name
                ));
                row.completed_at_ms = Some(now_ms);
                true
            });
            if let Err(e) = result {
                warn!(instance_id = %instance.id, error = %e, "resume-skip bookkeeping failed");
            }
            return;
        };

        let completed: HashSet<String> = instance
            .step_results
            .iter()
            .filter(|(_, r)| r.status == StepStatus::Completed)
            .map(|(name, _)| name.clone())
            .collect();

        let cancel = CancellationToken::new();
        self.inner.running.lock().insert(
            instance.id.clone(),
            RunningHandle {
                cancel: cancel.clone(),
            },
        );

        let runner = Arc::new(self.make_runner(&definition, cancel));
        *runner.resumed.lock() = completed;
        let id = instance.id.clone();
        runner.run(instance).await;
        self.inner.running.lock().remove(&id);
    }

    /// Number of instances this engine currently has in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.running.lock().len()
    }
}

/// Remove `wf-*.sock` files not owned by a live run.
fn cleanup_executor_sockets(socket_dir: &PathBuf, running: &HashSet<String>) {
    let Ok(entries) = std::fs::read_dir(socket_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(instance_id) = name
            .strip_prefix("wf-")
            .and_then(|rest| rest.strip_suffix(".sock"))
        else {
            continue;
        };
        if !running.contains(instance_id) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove stale executor socket");
            }
        }
    }
}

/// Socket path for one isolated instance.
pub(crate) fn executor_socket_path(socket_dir: &std::path::Path, instance_id: &str) -> PathBuf {
    socket_dir.join(format!("wf-{instance_id}.sock"))
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
