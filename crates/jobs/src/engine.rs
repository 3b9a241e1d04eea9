// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The jobs engine: registry, intake, and the poll/stale loops.

use crate::handler::{HandlerError, JobContext, JobHandler};
use crate::worker;
use dk_core::{Clock, IdGen, Job, JobOptions, JobStatus, SystemClock, UuidIdGen};
use dk_events::EventBus;
use dk_logs::PersistentLogs;
use dk_storage::{Store, StoreError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Errors from jobs-engine operations.
#[derive(Debug, Error)]
pub enum JobsError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Timed out waiting for job {0}")]
    WaitTimeout(String),
}

/// Tuning knobs for [`JobsEngine`].
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Store poll cadence of the dispatch loop.
    pub poll_interval: Duration,
    /// Lease granted per claim/heartbeat.
    pub lease_ms: u64,
    /// Heartbeat cadence for running jobs.
    pub heartbeat_interval: Duration,
    /// Cadence of the stale-lease supervisor.
    pub stale_check_interval: Duration,
    /// Worker slots; no free slot means no new leases.
    pub max_concurrent: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lease_ms: 30_000,
            heartbeat_interval: Duration::from_secs(10),
            stale_check_interval: Duration::from_secs(10),
            max_concurrent: 4,
        }
    }
}

pub(crate) struct JobsInner {
    pub(crate) config: JobsConfig,
    pub(crate) store: Store,
    pub(crate) bus: EventBus,
    pub(crate) logs: PersistentLogs,
    pub(crate) handlers: Mutex<HashMap<String, Arc<dyn JobHandler>>>,
    pub(crate) next_id: Box<dyn Fn(&str) -> String + Send + Sync>,
    pub(crate) epoch_ms: Box<dyn Fn() -> u64 + Send + Sync>,
    pub(crate) slots: Arc<Semaphore>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Persisted, leased, retryable work queue.
#[derive(Clone)]
pub struct JobsEngine {
    pub(crate) inner: Arc<JobsInner>,
}

impl JobsEngine {
    pub fn new(store: Store, bus: EventBus, logs: PersistentLogs, config: JobsConfig) -> Self {
        Self::with_deps(store, bus, logs, config, SystemClock, UuidIdGen)
    }

    pub fn with_deps<C: Clock, G: IdGen>(
        store: Store,
        bus: EventBus,
        logs: PersistentLogs,
        config: JobsConfig,
        clock: C,
        id_gen: G,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            inner: Arc::new(JobsInner {
                config,
                store,
                bus,
                logs,
                handlers: Mutex::new(HashMap::new()),
                next_id: Box::new(move |prefix| id_gen.next(prefix)),
                epoch_ms: Box::new(move || clock.epoch_ms()),
                slots,
                cancel: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a handler for a job name.
    pub fn register(&self, name: &str, handler: Arc<dyn JobHandler>) {
        self.inner.handlers.lock().insert(name.to_string(), handler);
    }

    /// Register a closure-backed handler.
    pub fn register_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        struct FnHandler<F>(F);

        #[async_trait::async_trait]
        impl<F, Fut> JobHandler for FnHandler<F>
        where
            F: Fn(Value, JobContext) -> Fut + Send + Sync,
            Fut: Future<Output = Result<Value, HandlerError>> + Send,
        {
            async fn run(&self, payload: Value, ctx: JobContext) -> Result<Value, HandlerError> {
                (self.0)(payload, ctx).await
            }
        }

        self.register(name, Arc::new(FnHandler(f)));
    }

    /// Enqueue a job for immediate dispatch. Returns the job id.
    pub fn enqueue(&self, name: &str, data: Value, opts: JobOptions) -> Result<String, JobsError> {
        self.insert(name, data, opts, None)
    }

    /// Enqueue a job to run no earlier than `run_at_ms`. Returns the job id.
    pub fn schedule(
        &self,
        name: &str,
        data: Value,
        run_at_ms: u64,
        opts: JobOptions,
    ) -> Result<String, JobsError> {
        self.insert(name, data, opts, Some(run_at_ms))
    }

    fn insert(
        &self,
        name: &str,
        data: Value,
        opts: JobOptions,
        run_at_ms: Option<u64>,
    ) -> Result<String, JobsError> {
        let id = (self.inner.next_id)("job");
        let now_ms = (self.inner.epoch_ms)();
        let job = Job::new(&id, name, data, opts, run_at_ms, now_ms);
        self.inner.store.insert_job(job)?;
        debug!(job_id = %id, name, "job enqueued");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.inner.store.job(id)
    }

    /// Cancel a job. Terminal rows are untouched; running jobs lose their
    /// lease and the in-flight result is discarded at settlement.
    pub async fn cancel(&self, id: &str) -> Result<bool, JobsError> {
        let now_ms = (self.inner.epoch_ms)();
        let cancelled = self.inner.store.update_job(id, |job| {
            if job.is_terminal() {
                return false;
            }
            job.status = JobStatus::Cancelled;
            job.lease_until_ms = None;
            job.run_at_ms = None;
            job.finished_at_ms = Some(now_ms);
            true
        })?;

        match cancelled {
            Some(job) => {
                worker::emit_lifecycle(&self.inner, "job.cancelled", &job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Block until the job reaches a terminal state.
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> Result<Job, JobsError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.inner.store.job(id) {
                Some(job) if job.is_terminal() => return Ok(job),
                Some(_) => {}
                None => return Err(JobsError::NotFound(id.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(JobsError::WaitTimeout(id.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Start the dispatch loop and the stale-lease supervisor.
    pub fn start(&self) {
        let mut cancel_slot = self.inner.cancel.lock();
        if cancel_slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *cancel_slot = Some(cancel.clone());
        drop(cancel_slot);

        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(Self::poll_loop(self.clone(), cancel.clone())));
        tasks.push(tokio::spawn(Self::stale_loop(self.clone(), cancel)));
        info!("jobs engine started");
    }

    /// Stop the loops and abort in-flight work. Abandoned rows are reopened
    /// by the stale supervisor after the next start.
    pub async fn stop(&self) {
        let cancel = self.inner.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!("jobs engine stopped");
    }

    async fn poll_loop(engine: JobsEngine, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(engine.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = engine.dispatch_due(&cancel).await {
                        error!(error = %e, "job dispatch pass failed");
                    }
                }
            }
        }
    }

    /// One dispatch pass: claim due jobs while worker slots are free.
    pub(crate) async fn dispatch_due(&self, cancel: &CancellationToken) -> Result<(), JobsError> {
        let now_ms = (self.inner.epoch_ms)();
        let free = self.inner.slots.available_permits();
        if free == 0 {
            return Ok(());
        }

        for job in self.inner.store.due_jobs(now_ms, free) {
            let handler = self.inner.handlers.lock().get(&job.name).cloned();
            let Some(handler) = handler else {
                // No handler registered yet; leave the row for a later pass.
                continue;
            };

            let Ok(permit) = Arc::clone(&self.inner.slots).try_acquire_owned() else {
                break;
            };

            let claimed =
                self.inner
                    .store
                    .claim_job(&job.id, now_ms, self.inner.config.lease_ms)?;
            let Some(claimed) = claimed else {
                continue;
            };

            let engine = self.clone();
            let job_cancel = cancel.child_token();
            self.inner.tasks.lock().push(tokio::spawn(async move {
                worker::run_one(engine, claimed, handler, job_cancel).await;
                drop(permit);
            }));
        }

        Ok(())
    }

    async fn stale_loop(engine: JobsEngine, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(engine.inner.config.stale_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = engine.recover_stale().await {
                        error!(error = %e, "stale job sweep failed");
                    }
                }
            }
        }
    }

    /// Reopen (or fail) running jobs whose lease lapsed without a heartbeat.
    pub(crate) async fn recover_stale(&self) -> Result<(), JobsError> {
        let now_ms = (self.inner.epoch_ms)();
        for job in self.inner.store.jobs_with_expired_lease(now_ms) {
            worker::emit_lifecycle(&self.inner, "job.stale", &job).await;

            let exhausted = job.attempts >= job.max_attempts;
            let updated = self.inner.store.update_job(&job.id, |j| {
                if j.status != JobStatus::Running || !j.lease_expired(now_ms) {
                    return false;
                }
                if exhausted {
                    j.status = JobStatus::Failed;
                    j.error = Some("lease expired with attempts exhausted".to_string());
                    j.finished_at_ms = Some(now_ms);
                } else {
                    j.status = JobStatus::Pending;
                    j.error = Some("lease expired".to_string());
                }
                j.lease_until_ms = None;
                j.last_heartbeat_ms = None;
                true
            })?;

            if let Some(updated) = updated {
                if exhausted {
                    worker::emit_lifecycle(&self.inner, "job.watchdog.killed", &updated).await;
                    worker::emit_lifecycle(&self.inner, "job.failed", &updated).await;
                } else {
                    debug!(job_id = %updated.id, "stale job reopened for retry");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
