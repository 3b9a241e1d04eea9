// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-job execution: heartbeating, settlement, retry scheduling.

use crate::engine::{JobsEngine, JobsInner};
use crate::handler::{JobContext, JobHandler};
use dk_core::{delay_with_jitter, EventMetadata, Job, JobStatus};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Emit a job lifecycle event with the row's identity and trace id.
pub(crate) async fn emit_lifecycle(inner: &JobsInner, event: &str, job: &Job) {
    let mut metadata = EventMetadata::source("jobs");
    metadata.trace_id = job.trace_id.clone();
    let data = json!({
        "id": job.id,
        "name": job.name,
        "status": job.status,
        "attempts": job.attempts,
        "result": job.result,
        "error": job.error,
    });
    inner.bus.emit_with_metadata(event, data, metadata).await;
}

/// Run one claimed job to settlement.
pub(crate) async fn run_one(
    engine: JobsEngine,
    job: Job,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
) {
    let inner = &engine.inner;
    let ctx = JobContext::new(
        job.id.clone(),
        job.name.clone(),
        job.attempts,
        job.trace_id.clone(),
        inner.logs.clone(),
        inner.bus.clone(),
    );

    // Heartbeat refresher: extends the lease while the handler runs and
    // cancels the attempt when the row is no longer ours.
    let beat_engine = engine.clone();
    let beat_id = job.id.clone();
    let beat_cancel = cancel.clone();
    let heartbeat = tokio::spawn(async move {
        let inner = &beat_engine.inner;
        let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = beat_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now_ms = (inner.epoch_ms)();
                    let lapsed = inner
                        .store
                        .job(&beat_id)
                        .is_some_and(|j| j.lease_expired(now_ms));
                    match inner.store.heartbeat_job(&beat_id, now_ms, inner.config.lease_ms) {
                        Ok(true) => {
                            if lapsed {
                                // Lease had expired but the row was still ours
                                if let Some(job) = inner.store.job(&beat_id) {
                                    emit_lifecycle(inner, "job.reconnected", &job).await;
                                }
                            }
                        }
                        Ok(false) => {
                            // Cancelled, settled, or reclaimed by the stale sweep
                            beat_cancel.cancel();
                            break;
                        }
                        Err(e) => warn!(job_id = %beat_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        }
    });

    let outcome = tokio::select! {
        result = handler.run(job.payload.clone(), ctx) => Some(result),
        _ = cancel.cancelled() => None,
    };
    cancel.cancel();
    let _ = heartbeat.await;

    match outcome {
        Some(Ok(result)) => settle_success(inner, &job.id, result).await,
        Some(Err(e)) => settle_failure(inner, &job.id, e.to_string()).await,
        None => {
            if let Some(row) = inner.store.job(&job.id) {
                emit_lifecycle(inner, "job.lost", &row).await;
            }
        }
    }
}

/// Record a successful result. A row that is no longer running (cancelled or
/// reclaimed) discards the result; terminal states never change.
async fn settle_success(inner: &JobsInner, id: &str, result: serde_json::Value) {
    let now_ms = (inner.epoch_ms)();
    let settled = inner.store.update_job(id, |job| {
        if job.status != JobStatus::Running {
            return false;
        }
        job.status = JobStatus::Completed;
        job.result = Some(result.clone());
        job.error = None;
        job.lease_until_ms = None;
        job.finished_at_ms = Some(now_ms);
        true
    });

    match settled {
        Ok(Some(job)) => emit_lifecycle(inner, "job.completed", &job).await,
        Ok(None) => debug!(job_id = %id, "completion discarded, row no longer running"),
        Err(e) => warn!(job_id = %id, error = %e, "failed to settle job completion"),
    }
}

/// Record a handler failure: schedule a retry while the budget lasts,
/// otherwise fail the row.
async fn settle_failure(inner: &JobsInner, id: &str, error: String) {
    let now_ms = (inner.epoch_ms)();
    let mut failed_terminally = false;
    let settled = inner.store.update_job(id, |job| {
        if job.status != JobStatus::Running {
            return false;
        }
        job.error = Some(error.clone());
        job.lease_until_ms = None;
        if job.attempts < job.max_attempts {
            let delay = delay_with_jitter(&job.retry, job.attempts.saturating_sub(1));
            job.status = JobStatus::Scheduled;
            job.run_at_ms = Some(now_ms + delay.as_millis() as u64);
        } else {
            job.status = JobStatus::Failed;
            job.finished_at_ms = Some(now_ms);
            failed_terminally = true;
        }
        true
    });

    match settled {
        Ok(Some(job)) if failed_terminally => emit_lifecycle(inner, "job.failed", &job).await,
        Ok(Some(job)) => {
            debug!(
                job_id = %job.id,
                attempts = job.attempts,
                run_at_ms = job.run_at_ms,
                "job failed, retry scheduled"
            );
        }
        Ok(None) => debug!(job_id = %id, "failure discarded, row no longer running"),
        Err(e) => warn!(job_id = %id, error = %e, "failed to settle job failure"),
    }
}
