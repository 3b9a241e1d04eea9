// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The server aggregate: construction wiring, startup recovery, shutdown.

use crate::config::Config;
use dk_events::EventBus;
use dk_jobs::JobsEngine;
use dk_logs::{LogStore, PersistentLogs};
use dk_procs::{ProcessSupervisor, ProcsError};
use dk_storage::{Store, StoreError};
use dk_workflows::{WorkflowEngine, WorkflowError};
use fs2::FileExt;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors from server lifecycle operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to acquire lock: server already running?")]
    LockFailed(#[source] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Process supervisor error: {0}")]
    Procs(#[from] ProcsError),
    #[error("Workflow engine error: {0}")]
    Workflows(#[from] WorkflowError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One server instance: all five core components over one state directory.
pub struct Server {
    config: Config,
    // NOTE(lifetime): Held to maintain exclusive file lock; released on drop
    #[allow(dead_code)]
    lock_file: File,
    store: Store,
    bus: EventBus,
    logs: PersistentLogs,
    jobs: JobsEngine,
    procs: ProcessSupervisor,
    workflows: WorkflowEngine,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Construct all components against the configured state directory.
    ///
    /// Takes the exclusive lock first: only one server instance owns a state
    /// directory.
    pub fn build(config: Config) -> Result<Self, ServerError> {
        std::fs::create_dir_all(&config.state_dir)?;
        std::fs::create_dir_all(&config.sockets_path)?;

        // Open without truncating so a failed lock leaves the running
        // server's PID intact.
        let lock_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.lock_path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(ServerError::LockFailed)?;
        let mut lock_file = lock_file;
        lock_file.set_len(0)?;
        writeln!(lock_file, "{}", std::process::id())?;

        let store = Store::open(&config.state_dir)?;
        let bus = EventBus::new(config.bus.clone());
        let logs = PersistentLogs::new(
            Arc::new(store.clone()) as Arc<dyn LogStore>,
            bus.clone(),
            config.logs.clone(),
        );
        let jobs = JobsEngine::new(
            store.clone(),
            bus.clone(),
            logs.clone(),
            config.jobs.clone(),
        );
        let procs = ProcessSupervisor::new(store.clone(), bus.clone(), config.procs.clone());
        let workflows = WorkflowEngine::new(
            store.clone(),
            bus.clone(),
            logs.clone(),
            Some(jobs.clone()),
            config.workflows.clone(),
        );

        Ok(Self {
            config,
            lock_file,
            store,
            bus,
            logs,
            jobs,
            procs,
            workflows,
            background: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Start everything: log sink, job loops, process orphan recovery,
    /// workflow resume, and the flush/checkpoint housekeeping tasks.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.logs.start();
        // Jobs dispatch must be live before workflow resume: a blocking
        // resume can enqueue and await job-backed steps.
        self.jobs.start();
        self.procs.start().await?;
        self.workflows.resume(self.config.resume).await?;

        let mut background = self.background.lock();
        background.push(spawn_flush_task(self.store.clone(), self.cancel.clone()));
        background.push(spawn_checkpoint_task(
            self.store.clone(),
            self.config.checkpoint_interval,
            self.cancel.clone(),
        ));
        drop(background);

        info!(state_dir = %self.config.state_dir.display(), "server started");
        Ok(())
    }

    /// Graceful shutdown in reverse dependency order, ending with a final
    /// checkpoint and lock release.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        info!("shutting down server");
        self.cancel.cancel();

        self.jobs.stop().await;
        if let Err(e) = self.procs.shutdown().await {
            warn!(error = %e, "process supervisor shutdown failed");
        }
        self.logs.stop().await;
        self.bus.stop().await;

        let tasks: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        self.store.flush()?;
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.checkpoint()).await {
            Ok(Ok(result)) => info!(seq = result.seq, "final checkpoint written"),
            Ok(Err(e)) => warn!(error = %e, "final checkpoint failed"),
            Err(e) => warn!(error = %e, "final checkpoint task panicked"),
        }

        if self.config.lock_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.config.lock_path) {
                warn!(error = %e, "failed to remove lock file");
            }
        }

        info!("server stopped");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn logs(&self) -> &PersistentLogs {
        &self.logs
    }

    pub fn jobs(&self) -> &JobsEngine {
        &self.jobs
    }

    pub fn procs(&self) -> &ProcessSupervisor {
        &self.procs
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }
}

/// Group-commit flush loop (~10ms durability window).
fn spawn_flush_task(store: Store, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(10));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if store.needs_flush() {
                        if let Err(e) = store.flush() {
                            tracing::error!(error = %e, "journal flush failed");
                        }
                    }
                }
            }
        }
    })
}

/// Periodic snapshot + journal truncation, bounding recovery time.
fn spawn_checkpoint_task(
    store: Store,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let store = store.clone();
                    let result = tokio::task::spawn_blocking(move || store.checkpoint()).await;
                    match result {
                        Ok(Ok(checkpoint)) => tracing::debug!(
                            seq = checkpoint.seq,
                            size_bytes = checkpoint.size_bytes,
                            "checkpoint complete"
                        ),
                        Ok(Err(e)) => tracing::warn!(error = %e, "checkpoint failed"),
                        Err(e) => tracing::warn!(error = %e, "checkpoint task panicked"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
