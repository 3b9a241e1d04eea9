// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The process supervisor.

use crate::definition::ProcessDefinition;
use crate::ipc::{self, BoxedWriter, PumpEnd};
use crate::socket::{self, Endpoint};
use crate::{ENV_METADATA, ENV_PROCESS_ID, ENV_SOCKET_PATH, ENV_TCP_PORT};
use dk_core::{
    delay_with_jitter, Clock, EventMetadata, IdGen, ProcessMessage, ProcessRecord, ProcessStats,
    ProcessStatus, SystemClock, UuidIdGen,
};
use dk_events::EventBus;
use dk_storage::{Store, StoreError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors from supervisor operations.
#[derive(Debug, Error)]
pub enum ProcsError {
    #[error("No process definition named {0}")]
    UnknownDefinition(String),
    #[error("Process not found: {0}")]
    NotFound(String),
    #[error("Process {0} has no live IPC connection")]
    NotConnected(String),
    #[error("Invalid process config: {0}")]
    InvalidConfig(String),
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tuning knobs for [`ProcessSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory for per-process Unix sockets.
    pub socket_dir: PathBuf,
    /// Use loopback TCP instead of Unix sockets.
    pub use_tcp: bool,
    /// Inclusive port range for TCP endpoints.
    pub tcp_port_range: (u16, u16),
    /// Wait after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
    /// Cadence of the heartbeat monitor.
    pub heartbeat_check_interval: Duration,
    /// Cadence of connect retries to a freshly-forked child.
    pub connect_retry_interval: Duration,
    /// Connect retry budget per child.
    pub connect_retry_attempts: u32,
}

impl SupervisorConfig {
    pub fn new(socket_dir: PathBuf) -> Self {
        Self {
            socket_dir,
            use_tcp: false,
            tcp_port_range: (49_400, 49_900),
            kill_grace: Duration::from_secs(5),
            heartbeat_check_interval: Duration::from_secs(10),
            connect_retry_interval: Duration::from_millis(100),
            connect_retry_attempts: 50,
        }
    }
}

/// Spawn-time options.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Opaque metadata serialized into `DONKEYLABS_METADATA`.
    pub metadata: Value,
}

struct ChildRuntime {
    pid: Option<u32>,
    endpoint: Endpoint,
    /// Set once when the child exits: `Some(exit_code)`.
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    writer: Option<Arc<tokio::sync::Mutex<BoxedWriter>>>,
    cancel: CancellationToken,
}

pub(crate) struct SupInner {
    config: SupervisorConfig,
    store: Store,
    bus: EventBus,
    definitions: Mutex<HashMap<String, ProcessDefinition>>,
    children: Mutex<HashMap<String, ChildRuntime>>,
    next_id: Box<dyn Fn(&str) -> String + Send + Sync>,
    epoch_ms: Box<dyn Fn() -> u64 + Send + Sync>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// Long-running subprocess lifecycle manager.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupInner>,
}

impl ProcessSupervisor {
    pub fn new(store: Store, bus: EventBus, config: SupervisorConfig) -> Self {
        Self::with_deps(store, bus, config, SystemClock, UuidIdGen)
    }

    pub fn with_deps<C: Clock, G: IdGen>(
        store: Store,
        bus: EventBus,
        config: SupervisorConfig,
        clock: C,
        id_gen: G,
    ) -> Self {
        Self {
            inner: Arc::new(SupInner {
                config,
                store,
                bus,
                definitions: Mutex::new(HashMap::new()),
                children: Mutex::new(HashMap::new()),
                next_id: Box::new(move |prefix| id_gen.next(prefix)),
                epoch_ms: Box::new(move || clock.epoch_ms()),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Register (or replace) a process definition.
    pub fn register(&self, definition: ProcessDefinition) {
        self.inner
            .definitions
            .lock()
            .insert(definition.name.clone(), definition);
    }

    pub fn get(&self, id: &str) -> Option<ProcessRecord> {
        self.inner.store.process(id)
    }

    pub fn get_by_name(&self, name: &str) -> Vec<ProcessRecord> {
        self.inner.store.processes_by_name(name)
    }

    pub fn get_running(&self) -> Vec<ProcessRecord> {
        self.inner.store.running_processes()
    }

    /// Spawn a new instance of a registered definition. Returns the row id.
    pub async fn spawn(&self, name: &str, opts: SpawnOptions) -> Result<String, ProcsError> {
        let definition = self
            .inner
            .definitions
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ProcsError::UnknownDefinition(name.to_string()))?;
        self.spawn_instance(&definition, opts.metadata, 0, 0).await
    }

    /// Spawn one instance: persist the row first, reserve the endpoint, then
    /// fork. `restart_count`/`consecutive_failures` seed the new row when
    /// this is a restart.
    fn spawn_instance<'a>(
        &'a self,
        definition: &'a ProcessDefinition,
        metadata: Value,
        restart_count: u32,
        consecutive_failures: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, ProcsError>> + Send + 'a>> {
        Box::pin(async move {
        let inner = &self.inner;
        if definition.config.command.is_empty() {
            return Err(ProcsError::InvalidConfig("empty command".to_string()));
        }

        let id = (inner.next_id)("proc");
        let now_ms = (inner.epoch_ms)();

        // Persist before forking so a supervisor crash leaves a recoverable
        // trace.
        let mut record = ProcessRecord::new(&id, &definition.name, definition.config.clone(), now_ms);
        record.metadata = metadata.clone();
        record.restart_count = restart_count;
        record.consecutive_failures = consecutive_failures;
        inner.store.upsert_process(record)?;

        let endpoint = if inner.config.use_tcp {
            socket::reserve_tcp(inner.config.tcp_port_range)
        } else {
            socket::reserve_unix(&inner.config.socket_dir, &id)
        };
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.mark_spawn_failed(&id, &e.to_string())?;
                return Err(ProcsError::Io(e));
            }
        };

        let mut command = tokio::process::Command::new(&definition.config.command[0]);
        command
            .args(&definition.config.command[1..])
            .envs(definition.config.env.iter())
            .env(ENV_PROCESS_ID, &id)
            .env(ENV_METADATA, serde_json::to_string(&metadata)?)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match &endpoint {
            Endpoint::Unix(path) => {
                command.env(ENV_SOCKET_PATH, path);
            }
            Endpoint::Tcp(port) => {
                command.env(ENV_TCP_PORT, port.to_string());
            }
        }
        if let Some(cwd) = &definition.config.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                socket::release(&endpoint);
                self.mark_spawn_failed(&id, &e.to_string())?;
                return Err(ProcsError::SpawnFailed(e.to_string()));
            }
        };

        let pid = child.id();
        let started_ms = (inner.epoch_ms)();
        let updated = inner.store.update_process(&id, |r| {
            r.pid = pid;
            r.socket_path = endpoint.socket_path().map(PathBuf::from);
            r.tcp_port = endpoint.tcp_port();
            r.status = ProcessStatus::Running;
            r.started_at_ms = Some(started_ms);
            true
        })?;
        let record = updated.ok_or_else(|| ProcsError::NotFound(id.clone()))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let child_cancel = CancellationToken::new();
        self.inner.children.lock().insert(
            id.clone(),
            ChildRuntime {
                pid,
                endpoint: endpoint.clone(),
                exit_rx,
                writer: None,
                cancel: child_cancel.clone(),
            },
        );

        self.emit(
            "process.spawned",
            json!({ "id": id, "name": record.name, "pid": pid, "restartCount": restart_count }),
        )
        .await;

        // Exit watcher: owns the Child handle.
        let sup = self.clone();
        let watch_id = id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(process_id = %watch_id, error = %e, "wait on child failed");
                    None
                }
            };
            let _ = exit_tx.send(Some(code));
            sup.on_exit(&watch_id, code).await;
        });

        // IPC pump.
        let sup = self.clone();
        let ipc_id = id.clone();
        let ipc_endpoint = endpoint.clone();
        let ipc_cancel = child_cancel.clone();
        tokio::spawn(async move {
            sup.ipc_task(ipc_id, ipc_endpoint, ipc_cancel).await;
        });

        // In-process runtime-limit timer.
        if let Some(max_runtime_ms) = definition.config.limits.max_runtime_ms {
            let sup = self.clone();
            let limit_id = id.clone();
            let limit_cancel = child_cancel;
            tokio::spawn(async move {
                tokio::select! {
                    _ = limit_cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(max_runtime_ms)) => {
                        sup.emit(
                            "process.watchdog.killed",
                            json!({ "id": limit_id, "reason": "maxRuntimeMs" }),
                        )
                        .await;
                        if let Err(e) = sup.stop(&limit_id).await {
                            warn!(process_id = %limit_id, error = %e, "runtime-limit stop failed");
                        }
                    }
                }
            });
        }

        info!(process_id = %id, name = %record.name, pid, "process spawned");
        Ok(id)
        })
    }

    fn mark_spawn_failed(&self, id: &str, error: &str) -> Result<(), ProcsError> {
        let error = error.to_string();
        self.inner.store.update_process(id, |r| {
            r.status = ProcessStatus::Crashed;
            r.error = Some(error.clone());
            true
        })?;
        Ok(())
    }

    /// Supervisor side of the child connection: connect with retry, store the
    /// writer for `send`, route messages until the connection ends.
    async fn ipc_task(&self, id: String, endpoint: Endpoint, cancel: CancellationToken) {
        let inner = &self.inner;
        let Some((mut reader, writer)) = ipc::connect_with_retry(
            &endpoint,
            inner.config.connect_retry_attempts,
            inner.config.connect_retry_interval,
            &cancel,
        )
        .await
        else {
            return;
        };

        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        if let Some(runtime) = inner.children.lock().get_mut(&id) {
            runtime.writer = Some(Arc::clone(&writer));
        }

        let sup = self.clone();
        let route_id = id.clone();
        let end = ipc::pump(&mut reader, &cancel, |message| {
            let sup = sup.clone();
            let route_id = route_id.clone();
            async move { sup.route_message(&route_id, message).await }
        })
        .await;

        if let PumpEnd::Protocol(error) = end {
            // Framing errors poison the channel: close and treat as a crash.
            error!(process_id = %id, error = %error, "protocol error on child channel, killing");
            if let Some(pid) = inner.children.lock().get(&id).and_then(|r| r.pid) {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        if let Some(runtime) = inner.children.lock().get_mut(&id) {
            runtime.writer = None;
        }
    }

    /// Route one child message to callbacks and the event bus.
    async fn route_message(&self, id: &str, message: ProcessMessage) {
        let inner = &self.inner;
        let Some(record) = inner.store.process(id) else {
            return;
        };
        let definition = inner.definitions.lock().get(&record.name).cloned();

        match message {
            ProcessMessage::Heartbeat { .. } => {
                let now_ms = (inner.epoch_ms)();
                let result = inner.store.update_process(id, |r| {
                    r.last_heartbeat_ms = Some(now_ms);
                    // First proof of health: the failure streak ends here.
                    r.consecutive_failures = 0;
                    true
                });
                if let Err(e) = result {
                    warn!(process_id = %id, error = %e, "heartbeat update failed");
                }
            }
            ProcessMessage::Stats { stats, .. } => {
                if let Some(cb) = definition.as_ref().and_then(|d| d.on_stats.as_ref()) {
                    cb(id, &stats);
                }
                self.emit(
                    "process.stats",
                    json!({ "id": id, "name": record.name, "stats": stats }),
                )
                .await;
                self.enforce_limits(id, &record, &stats).await;
            }
            ProcessMessage::Event { event, data, .. } => {
                if let Some(cb) = definition.as_ref().and_then(|d| d.on_message.as_ref()) {
                    cb(id, &json!({ "event": event, "data": data }));
                }
                self.emit(
                    &format!("process.{}.{}", record.name, event),
                    json!({ "id": id, "data": data }),
                )
                .await;
                self.emit(
                    "process.event",
                    json!({ "id": id, "name": record.name, "event": event, "data": data }),
                )
                .await;
            }
            ProcessMessage::Other {
                msg_type, payload, ..
            } => {
                let payload = Value::Object(payload);
                if let Some(cb) = definition.as_ref().and_then(|d| d.on_message.as_ref()) {
                    cb(id, &payload);
                }
                self.emit(
                    "process.message",
                    json!({ "id": id, "name": record.name, "type": msg_type, "payload": payload }),
                )
                .await;
            }
        }
    }

    /// Stats-driven limit enforcement. Comparisons are strict.
    async fn enforce_limits(&self, id: &str, record: &ProcessRecord, stats: &ProcessStats) {
        let Some(reason) = stats.exceeded_limit(&record.config.limits) else {
            return;
        };
        self.emit(
            "process.limits_exceeded",
            json!({ "id": id, "name": record.name, "reason": reason }),
        )
        .await;
        self.emit(
            "process.watchdog.killed",
            json!({ "id": id, "reason": reason }),
        )
        .await;
        if let Err(e) = self.stop(id).await {
            warn!(process_id = %id, error = %e, "limit-enforcement stop failed");
        }
    }

    /// Exit bookkeeping: expected stops settle to `stopped`; anything else is
    /// a crash and may auto-restart.
    async fn on_exit(&self, id: &str, exit_code: Option<i32>) {
        let inner = &self.inner;
        let runtime = inner.children.lock().remove(id);
        if let Some(runtime) = &runtime {
            runtime.cancel.cancel();
            socket::release(&runtime.endpoint);
        }

        let Some(record) = inner.store.process(id) else {
            return;
        };
        let now_ms = (inner.epoch_ms)();

        match record.status {
            ProcessStatus::Stopping => {
                let result = inner.store.update_process(id, |r| {
                    r.status = ProcessStatus::Stopped;
                    r.stopped_at_ms = Some(now_ms);
                    true
                });
                if let Err(e) = result {
                    warn!(process_id = %id, error = %e, "stop bookkeeping failed");
                }
                self.emit(
                    "process.stopped",
                    json!({ "id": id, "name": record.name, "exitCode": exit_code }),
                )
                .await;
            }
            ProcessStatus::Stopped | ProcessStatus::Dead | ProcessStatus::Crashed => {}
            _ => self.crash_path(&record, exit_code, now_ms).await,
        }
    }

    async fn crash_path(&self, record: &ProcessRecord, exit_code: Option<i32>, now_ms: u64) {
        let inner = &self.inner;
        let failures = record.consecutive_failures + 1;
        let error = format!(
            "exited unexpectedly with code {}",
            exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
        );
        let result = inner.store.update_process(&record.id, |r| {
            r.status = ProcessStatus::Crashed;
            r.consecutive_failures = failures;
            r.error = Some(error.clone());
            r.stopped_at_ms = Some(now_ms);
            true
        });
        if let Err(e) = result {
            warn!(process_id = %record.id, error = %e, "crash bookkeeping failed");
        }

        self.emit(
            "process.crashed",
            json!({
                "id": record.id,
                "name": record.name,
                "exitCode": exit_code,
                "consecutiveFailures": failures,
            }),
        )
        .await;

        let definition = inner.definitions.lock().get(&record.name).cloned();
        if let Some(cb) = definition.as_ref().and_then(|d| d.on_crash.as_ref()) {
            cb(&record.id, exit_code);
        }

        let Some(definition) = definition else {
            return;
        };
        if !definition.config.restart_allowed(failures) {
            debug!(process_id = %record.id, failures, "restart budget exhausted");
            return;
        }

        let sup = self.clone();
        let old = record.clone();
        tokio::spawn(async move {
            let delay = delay_with_jitter(&old.config.backoff, failures.saturating_sub(1));
            tokio::time::sleep(delay).await;
            sup.respawn_after_crash(&definition, &old, failures).await;
        });
    }

    async fn respawn_after_crash(
        &self,
        definition: &ProcessDefinition,
        old: &ProcessRecord,
        failures: u32,
    ) {
        match self
            .spawn_instance(
                definition,
                old.metadata.clone(),
                old.restart_count + 1,
                failures,
            )
            .await
        {
            Ok(new_id) => {
                self.emit(
                    "process.restarted",
                    json!({
                        "id": new_id,
                        "previous": old.id,
                        "name": old.name,
                        "attempt": failures,
                        "restartCount": old.restart_count + 1,
                    }),
                )
                .await;
                if let Some(cb) = definition.on_restart.as_ref() {
                    cb(&new_id, old.restart_count + 1);
                }
            }
            Err(e) => {
                error!(name = %old.name, error = %e, "auto-restart spawn failed");
            }
        }
    }

    /// Graceful stop: SIGTERM, grace window, then SIGKILL.
    pub async fn stop(&self, id: &str) -> Result<(), ProcsError> {
        let marked = self.inner.store.update_process(id, |r| {
            if !r.status.is_live() || r.status == ProcessStatus::Stopping {
                return false;
            }
            r.status = ProcessStatus::Stopping;
            true
        })?;
        if marked.is_none() {
            return Ok(());
        }
        self.terminate(id, true).await
    }

    /// Immediate SIGKILL, skipping the grace window.
    pub async fn kill(&self, id: &str) -> Result<(), ProcsError> {
        let marked = self.inner.store.update_process(id, |r| {
            if !r.status.is_live() || r.status == ProcessStatus::Stopping {
                return false;
            }
            r.status = ProcessStatus::Stopping;
            true
        })?;
        if marked.is_none() {
            return Ok(());
        }
        self.terminate(id, false).await
    }

    /// Deliver signals and wait for the exit watcher to settle the row.
    async fn terminate(&self, id: &str, graceful: bool) -> Result<(), ProcsError> {
        let (pid, mut exit_rx) = {
            let children = self.inner.children.lock();
            match children.get(id) {
                Some(runtime) => (runtime.pid, Some(runtime.exit_rx.clone())),
                None => (None, None),
            }
        };

        let Some(pid) = pid else {
            // No live child behind the row (lost during recovery): settle directly.
            let now_ms = (self.inner.epoch_ms)();
            self.inner.store.update_process(id, |r| {
                r.status = ProcessStatus::Stopped;
                r.stopped_at_ms = Some(now_ms);
                true
            })?;
            return Ok(());
        };

        let nix_pid = Pid::from_raw(pid as i32);
        if graceful {
            let _ = kill(nix_pid, Signal::SIGTERM);
            let grace = self.inner.config.kill_grace;
            let exited = match &mut exit_rx {
                Some(rx) => wait_for_exit(rx, grace).await,
                None => false,
            };
            if !exited {
                let _ = kill(nix_pid, Signal::SIGKILL);
            }
        } else {
            let _ = kill(nix_pid, Signal::SIGKILL);
        }

        if let Some(rx) = &mut exit_rx {
            // Exit watcher settles the row; bounded wait as a backstop.
            wait_for_exit(rx, Duration::from_secs(10)).await;
        }
        Ok(())
    }

    /// Terminate without marking `stopping`, so the exit watcher takes the
    /// crash path and auto-restart applies.
    async fn watchdog_stop(&self, id: &str) {
        let (pid, mut exit_rx) = {
            let children = self.inner.children.lock();
            match children.get(id) {
                Some(runtime) => (runtime.pid, Some(runtime.exit_rx.clone())),
                None => (None, None),
            }
        };
        let Some(pid) = pid else {
            return;
        };

        let nix_pid = Pid::from_raw(pid as i32);
        let _ = kill(nix_pid, Signal::SIGTERM);
        let exited = match &mut exit_rx {
            Some(rx) => wait_for_exit(rx, self.inner.config.kill_grace).await,
            None => false,
        };
        if !exited {
            let _ = kill(nix_pid, Signal::SIGKILL);
        }
    }

    /// Stop then spawn a fresh instance of the same definition.
    pub async fn restart(&self, id: &str) -> Result<String, ProcsError> {
        let record = self
            .inner
            .store
            .process(id)
            .ok_or_else(|| ProcsError::NotFound(id.to_string()))?;
        let definition = self
            .inner
            .definitions
            .lock()
            .get(&record.name)
            .cloned()
            .ok_or_else(|| ProcsError::UnknownDefinition(record.name.clone()))?;

        self.stop(id).await?;
        let new_id = self
            .spawn_instance(&definition, record.metadata.clone(), record.restart_count + 1, 0)
            .await?;
        self.emit(
            "process.restarted",
            json!({
                "id": new_id,
                "previous": id,
                "name": record.name,
                "restartCount": record.restart_count + 1,
            }),
        )
        .await;
        Ok(new_id)
    }

    /// Send a JSON message to a child over its IPC connection.
    pub async fn send(&self, id: &str, message: Value) -> Result<(), ProcsError> {
        let writer = self
            .inner
            .children
            .lock()
            .get(id)
            .and_then(|r| r.writer.clone())
            .ok_or_else(|| ProcsError::NotConnected(id.to_string()))?;

        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        let mut writer = writer.lock().await;
        tokio::io::AsyncWriteExt::write_all(&mut *writer, line.as_bytes()).await?;
        tokio::io::AsyncWriteExt::flush(&mut *writer).await?;
        Ok(())
    }

    /// Startup: clean stale sockets, reconcile persisted rows against live
    /// PIDs, and start the heartbeat monitor.
    pub async fn start(&self) -> Result<(), ProcsError> {
        let inner = &self.inner;

        let to_recover = inner.store.processes_needing_recovery();
        if !inner.config.use_tcp {
            let keep: HashSet<PathBuf> = to_recover
                .iter()
                .filter_map(|r| r.socket_path.clone())
                .collect();
            let removed = socket::cleanup_stale(&inner.config.socket_dir, &keep);
            if removed > 0 {
                info!(removed, "cleaned stale socket files");
            }
        }

        for record in to_recover {
            self.recover_one(&record).await;
        }

        let mut cancel_slot = inner.cancel.lock();
        if cancel_slot.is_none() {
            let cancel = CancellationToken::new();
            *cancel_slot = Some(cancel.clone());
            drop(cancel_slot);
            let sup = self.clone();
            tokio::spawn(async move { sup.monitor_loop(cancel).await });
        }

        Ok(())
    }

    /// Reconcile one persisted row against the world.
    async fn recover_one(&self, record: &ProcessRecord) {
        let inner = &self.inner;
        let now_ms = (inner.epoch_ms)();
        let alive = record
            .pid
            .is_some_and(|pid| kill(Pid::from_raw(pid as i32), None).is_ok());

        let endpoint = record
            .socket_path
            .clone()
            .map(Endpoint::Unix)
            .or(record.tcp_port.map(Endpoint::Tcp));

        if alive {
            if let Some(endpoint) = endpoint.clone() {
                if let Ok((mut reader, writer)) = ipc::connect(&endpoint).await {
                    // Child is alive and reachable: adopt it.
                    let result = inner.store.update_process(&record.id, |r| {
                        r.status = ProcessStatus::Running;
                        r.error = None;
                        true
                    });
                    if let Err(e) = result {
                        warn!(process_id = %record.id, error = %e, "reconnect bookkeeping failed");
                    }

                    let cancel = CancellationToken::new();
                    let (exit_tx, exit_rx) = watch::channel(None);
                    let writer = Arc::new(tokio::sync::Mutex::new(writer));
                    inner.children.lock().insert(
                        record.id.clone(),
                        ChildRuntime {
                            pid: record.pid,
                            endpoint,
                            exit_rx,
                            writer: Some(Arc::clone(&writer)),
                            cancel: cancel.clone(),
                        },
                    );

                    // Poll-based exit watcher: there is no Child handle to wait on.
                    let sup = self.clone();
                    let watch_id = record.id.clone();
                    let watch_pid = record.pid.unwrap_or_default();
                    let watch_cancel = cancel.clone();
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                _ = watch_cancel.cancelled() => return,
                                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                                    if kill(Pid::from_raw(watch_pid as i32), None).is_err() {
                                        let _ = exit_tx.send(Some(None));
                                        sup.on_exit(&watch_id, None).await;
                                        return;
                                    }
                                }
                            }
                        }
                    });

                    // Message pump on the already-open connection.
                    let sup = self.clone();
                    let pump_id = record.id.clone();
                    tokio::spawn(async move {
                        let route_sup = sup.clone();
                        let route_id = pump_id.clone();
                        let end = ipc::pump(&mut reader, &cancel, |message| {
                            let sup = route_sup.clone();
                            let id = route_id.clone();
                            async move { sup.route_message(&id, message).await }
                        })
                        .await;
                        if let PumpEnd::Protocol(error) = end {
                            error!(process_id = %pump_id, error = %error, "protocol error after reconnect");
                        }
                    });

                    self.emit(
                        "process.reconnected",
                        json!({ "id": record.id, "name": record.name, "pid": record.pid }),
                    )
                    .await;
                    info!(process_id = %record.id, "reconnected to orphaned process");
                    return;
                }
            }

            // PID is alive but unreachable.
            let result = inner.store.update_process(&record.id, |r| {
                r.status = ProcessStatus::Orphaned;
                true
            });
            if let Err(e) = result {
                warn!(process_id = %record.id, error = %e, "orphan bookkeeping failed");
            }
            warn!(process_id = %record.id, "process orphaned: pid alive but socket unreachable");

            let definition = inner.definitions.lock().get(&record.name).cloned();
            if let Some(definition) =
                definition.filter(|d| d.config.restart_allowed(record.consecutive_failures + 1))
            {
                if let Some(pid) = record.pid {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                let result = inner.store.update_process(&record.id, |r| {
                    r.status = ProcessStatus::Dead;
                    r.stopped_at_ms = Some(now_ms);
                    true
                });
                if let Err(e) = result {
                    warn!(process_id = %record.id, error = %e, "orphan kill bookkeeping failed");
                }
                if let Some(endpoint) = endpoint {
                    socket::release(&endpoint);
                }
                self.respawn_after_crash(&definition, record, record.consecutive_failures + 1)
                    .await;
            }
            return;
        }

        // PID is gone.
        let result = inner.store.update_process(&record.id, |r| {
            r.status = ProcessStatus::Dead;
            r.stopped_at_ms = Some(now_ms);
            true
        });
        if let Err(e) = result {
            warn!(process_id = %record.id, error = %e, "dead-process bookkeeping failed");
        }
        if let Some(endpoint) = endpoint {
            socket::release(&endpoint);
        }

        let definition = inner.definitions.lock().get(&record.name).cloned();
        if let Some(definition) =
            definition.filter(|d| d.config.restart_allowed(record.consecutive_failures + 1))
        {
            self.respawn_after_crash(&definition, record, record.consecutive_failures + 1)
                .await;
        }
    }

    /// Heartbeat monitor: flag silent processes, stop ones silent past 2×.
    async fn monitor_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.heartbeat_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check_heartbeats().await,
            }
        }
    }

    pub(crate) async fn check_heartbeats(&self) {
        let now_ms = (self.inner.epoch_ms)();
        for record in self.inner.store.running_processes() {
            if !record.heartbeat_overdue(now_ms, 1) {
                continue;
            }
            self.emit(
                "process.heartbeat_missed",
                json!({ "id": record.id, "name": record.name, "lastHeartbeatMs": record.last_heartbeat_ms }),
            )
            .await;
            self.emit(
                "process.watchdog.stale",
                json!({ "id": record.id, "name": record.name }),
            )
            .await;
            let definition = self.inner.definitions.lock().get(&record.name).cloned();
            if let Some(cb) = definition.as_ref().and_then(|d| d.on_unhealthy.as_ref()) {
                cb(&record.id);
            }

            if record.heartbeat_overdue(now_ms, 2) {
                warn!(process_id = %record.id, "heartbeat silent past 2x timeout, stopping");
                // Not marked `stopping`: the exit watcher takes the crash
                // path so auto-restart applies.
                self.watchdog_stop(&record.id).await;
            }
        }
    }

    /// Stop monitors and gracefully stop every live child.
    pub async fn shutdown(&self) -> Result<(), ProcsError> {
        let cancel = self.inner.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let ids: Vec<String> = self.inner.children.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(process_id = %id, error = %e, "shutdown stop failed");
            }
        }
        info!("process supervisor shut down");
        Ok(())
    }

    async fn emit(&self, event: &str, data: Value) {
        self.inner
            .bus
            .emit_with_metadata(event, data, EventMetadata::source("procs"))
            .await;
    }
}

/// Wait (bounded) for the exit watch to report the child gone.
async fn wait_for_exit(
    exit_rx: &mut watch::Receiver<Option<Option<i32>>>,
    timeout: Duration,
) -> bool {
    if exit_rx.borrow().is_some() {
        return true;
    }
    tokio::time::timeout(timeout, async {
        loop {
            if exit_rx.changed().await.is_err() {
                return;
            }
            if exit_rx.borrow().is_some() {
                return;
            }
        }
    })
    .await
    .is_ok()
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
