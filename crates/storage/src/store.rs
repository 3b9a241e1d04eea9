// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The shared store handle.
//!
//! Wraps the materialized [`Tables`] and the [`Journal`] behind one clonable
//! handle. Reads copy rows out under the lock; writes mutate and journal the
//! resulting row while still holding it, so journal order always matches
//! application order. Conditional updates return whether a row actually
//! changed; that is the single-row atomic "rows affected" primitive the engines'
//! claim/settle protocols are built on. The lock is never held across user
//! code.

use crate::journal::{Journal, JournalError};
use crate::snapshot::{Snapshot, SnapshotError};
use crate::state::{Op, Tables};
use dk_core::{
    Job, JobStatus, LogEntry, LogFilter, LogSource, ProcessRecord, ProcessStatus,
    WorkflowInstance, WorkflowStatus,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a completed checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointResult {
    pub seq: u64,
    pub size_bytes: u64,
}

/// Clonable handle over tables + journal.
#[derive(Clone)]
pub struct Store {
    tables: Arc<Mutex<Tables>>,
    journal: Arc<Mutex<Journal>>,
    snapshot_path: PathBuf,
}

impl Store {
    /// Open the store under a state directory, recovering tables from the
    /// latest snapshot plus journal replay.
    pub fn open(state_dir: &Path) -> Result<Self, StoreError> {
        let journal_path = state_dir.join("journal").join("ops.jsonl");
        let snapshot_path = state_dir.join("snapshot.bin");

        let (mut tables, snapshot_seq) = match Snapshot::load(&snapshot_path)? {
            Some(snapshot) => (snapshot.state, snapshot.seq),
            None => (Tables::default(), 0),
        };

        let mut journal = Journal::open(&journal_path)?;
        let replay = journal.entries_after(snapshot_seq)?;
        let replay_count = replay.len();
        for entry in replay {
            tables.apply(&entry.op);
        }

        if snapshot_seq > 0 || replay_count > 0 {
            info!(
                snapshot_seq,
                replayed = replay_count,
                jobs = tables.jobs.len(),
                processes = tables.processes.len(),
                instances = tables.instances.len(),
                "recovered store state"
            );
        }

        Ok(Self {
            tables: Arc::new(Mutex::new(tables)),
            journal: Arc::new(Mutex::new(journal)),
            snapshot_path,
        })
    }

    /// Apply and journal one op while holding the tables lock.
    fn commit(tables: &mut Tables, journal: &Mutex<Journal>, op: Op) -> Result<(), StoreError> {
        tables.apply(&op);
        journal.lock().append(&op)?;
        Ok(())
    }

    /// Flush the journal's group-commit buffer to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.journal.lock().flush()?;
        Ok(())
    }

    /// Whether the group-commit window has elapsed.
    pub fn needs_flush(&self) -> bool {
        self.journal.lock().needs_flush()
    }

    /// Write a durable snapshot, then truncate the journal.
    pub fn checkpoint(&self) -> Result<CheckpointResult, StoreError> {
        let (state, seq) = {
            let tables = self.tables.lock();
            let mut journal = self.journal.lock();
            journal.flush()?;
            (tables.clone(), journal.write_seq())
        };

        let size_bytes = Snapshot::new(seq, state).save(&self.snapshot_path)?;

        // Snapshot is durable (incl. directory fsync): safe to truncate.
        self.journal.lock().truncate_before(seq + 1)?;

        Ok(CheckpointResult { seq, size_bytes })
    }

    // ── jobs ────────────────────────────────────────────────────────────────

    /// Insert a new job row.
    pub fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        Self::commit(&mut tables, &self.journal, Op::PutJob(job))
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.tables.lock().jobs.get(id).cloned()
    }

    /// Jobs claimable at `now_ms`, oldest first.
    pub fn due_jobs(&self, now_ms: u64, limit: usize) -> Vec<Job> {
        let tables = self.tables.lock();
        let mut due: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.is_due(now_ms))
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.run_at_ms.unwrap_or(j.created_at_ms), j.id.clone()));
        due.truncate(limit);
        due
    }

    /// Atomically claim a due job: `pending|scheduled → running` with a fresh
    /// lease. Returns the updated row only if this caller won the claim.
    pub fn claim_job(
        &self,
        id: &str,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<Option<Job>, StoreError> {
        let mut tables = self.tables.lock();
        let Some(job) = tables.jobs.get_mut(id) else {
            return Ok(None);
        };
        if !job.is_due(now_ms) {
            return Ok(None);
        }

        job.status = JobStatus::Running;
        job.attempts += 1;
        job.run_at_ms = None;
        job.lease_until_ms = Some(now_ms + lease_ms);
        job.last_heartbeat_ms = Some(now_ms);
        if job.started_at_ms.is_none() {
            job.started_at_ms = Some(now_ms);
        }
        let updated = job.clone();
        Self::commit(&mut tables, &self.journal, Op::PutJob(updated.clone()))?;
        Ok(Some(updated))
    }

    /// Refresh a running job's heartbeat and extend its lease.
    ///
    /// Returns false if the job is no longer running (cancelled, settled, or
    /// rolled back by the stale supervisor); the worker should stop.
    pub fn heartbeat_job(&self, id: &str, now_ms: u64, lease_ms: u64) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        let Some(job) = tables.jobs.get_mut(id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.last_heartbeat_ms = Some(now_ms);
        job.lease_until_ms = Some(now_ms + lease_ms);
        let updated = job.clone();
        Self::commit(&mut tables, &self.journal, Op::PutJob(updated))?;
        Ok(true)
    }

    /// Conditionally update a job row. The closure returns true to keep the
    /// mutation (journaled and applied) or false to discard it. The updated
    /// row is returned only when the mutation was kept.
    pub fn update_job<F>(&self, id: &str, f: F) -> Result<Option<Job>, StoreError>
    where
        F: FnOnce(&mut Job) -> bool,
    {
        let mut tables = self.tables.lock();
        let Some(job) = tables.jobs.get_mut(id) else {
            return Ok(None);
        };
        let mut candidate = job.clone();
        if !f(&mut candidate) {
            return Ok(None);
        }
        *job = candidate.clone();
        Self::commit(&mut tables, &self.journal, Op::PutJob(candidate.clone()))?;
        Ok(Some(candidate))
    }

    /// Running jobs whose lease has lapsed.
    pub fn jobs_with_expired_lease(&self, now_ms: u64) -> Vec<Job> {
        self.tables
            .lock()
            .jobs
            .values()
            .filter(|j| j.lease_expired(now_ms))
            .cloned()
            .collect()
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        let tables = self.tables.lock();
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at_ms, j.id.clone()));
        jobs
    }

    // ── processes ───────────────────────────────────────────────────────────

    pub fn upsert_process(&self, record: ProcessRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        Self::commit(&mut tables, &self.journal, Op::PutProcess(record))
    }

    pub fn process(&self, id: &str) -> Option<ProcessRecord> {
        self.tables.lock().processes.get(id).cloned()
    }

    /// Conditionally update a process row (same contract as [`Self::update_job`]).
    pub fn update_process<F>(&self, id: &str, f: F) -> Result<Option<ProcessRecord>, StoreError>
    where
        F: FnOnce(&mut ProcessRecord) -> bool,
    {
        let mut tables = self.tables.lock();
        let Some(record) = tables.processes.get_mut(id) else {
            return Ok(None);
        };
        let mut candidate = record.clone();
        if !f(&mut candidate) {
            return Ok(None);
        }
        *record = candidate.clone();
        Self::commit(&mut tables, &self.journal, Op::PutProcess(candidate.clone()))?;
        Ok(Some(candidate))
    }

    /// All rows for a process name, newest first.
    pub fn processes_by_name(&self, name: &str) -> Vec<ProcessRecord> {
        let mut rows: Vec<ProcessRecord> = self
            .tables
            .lock()
            .processes
            .values()
            .filter(|p| p.name == name)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms).then(b.id.cmp(&a.id)));
        rows
    }

    pub fn running_processes(&self) -> Vec<ProcessRecord> {
        self.tables
            .lock()
            .processes
            .values()
            .filter(|p| p.status == ProcessStatus::Running)
            .cloned()
            .collect()
    }

    /// Rows the orphan-recovery sweep must reconcile.
    pub fn processes_needing_recovery(&self) -> Vec<ProcessRecord> {
        self.tables
            .lock()
            .processes
            .values()
            .filter(|p| p.status.needs_recovery())
            .cloned()
            .collect()
    }

    pub fn list_processes(&self) -> Vec<ProcessRecord> {
        let mut rows: Vec<ProcessRecord> = self.tables.lock().processes.values().cloned().collect();
        rows.sort_by_key(|p| (p.created_at_ms, p.id.clone()));
        rows
    }

    // ── workflow instances ──────────────────────────────────────────────────

    pub fn upsert_instance(&self, instance: WorkflowInstance) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        Self::commit(&mut tables, &self.journal, Op::PutInstance(instance))
    }

    pub fn instance(&self, id: &str) -> Option<WorkflowInstance> {
        self.tables.lock().instances.get(id).cloned()
    }

    /// Conditionally update an instance row (same contract as [`Self::update_job`]).
    pub fn update_instance<F>(
        &self,
        id: &str,
        f: F,
    ) -> Result<Option<WorkflowInstance>, StoreError>
    where
        F: FnOnce(&mut WorkflowInstance) -> bool,
    {
        let mut tables = self.tables.lock();
        let Some(instance) = tables.instances.get_mut(id) else {
            return Ok(None);
        };
        let mut candidate = instance.clone();
        if !f(&mut candidate) {
            return Ok(None);
        }
        *instance = candidate.clone();
        Self::commit(&mut tables, &self.journal, Op::PutInstance(candidate.clone()))?;
        Ok(Some(candidate))
    }

    pub fn running_instances(&self) -> Vec<WorkflowInstance> {
        self.tables
            .lock()
            .instances
            .values()
            .filter(|i| i.status == WorkflowStatus::Running)
            .cloned()
            .collect()
    }

    pub fn list_instances(&self, status: Option<WorkflowStatus>) -> Vec<WorkflowInstance> {
        let tables = self.tables.lock();
        let mut rows: Vec<WorkflowInstance> = tables
            .instances
            .values()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        rows.sort_by_key(|i| (i.created_at_ms, i.id.clone()));
        rows
    }

    // ── logs ────────────────────────────────────────────────────────────────

    /// Append a flushed batch of log entries, preserving buffer order.
    pub fn append_logs(&self, batch: &[LogEntry]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tables = self.tables.lock();
        Self::commit(&mut tables, &self.journal, Op::AppendLogs(batch.to_vec()))
    }

    /// Query stored entries, timestamp-descending, honoring offset/limit.
    pub fn query_logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let tables = self.tables.lock();
        let mut hits: Vec<LogEntry> = tables
            .logs
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms).then(b.id.cmp(&a.id)));
        hits
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Count of entries matching the filter (paging ignored).
    pub fn count_logs(&self, filter: &LogFilter) -> usize {
        self.tables
            .lock()
            .logs
            .iter()
            .filter(|e| filter.matches(e))
            .count()
    }

    /// Drop entries for `source` older than `cutoff_ms`. Returns the number
    /// removed.
    pub fn delete_logs_older_than(
        &self,
        cutoff_ms: u64,
        source: LogSource,
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock();
        let before = tables.logs.len();
        Self::commit(
            &mut tables,
            &self.journal,
            Op::PruneLogs { source, cutoff_ms },
        )?;
        Ok(before - tables.logs.len())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
