// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::support::{eventually, started_server};
use dk_core::{BackoffConfig, JobOptions, JobStatus};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn enqueue_await_result_round_trip() {
    let t = started_server().await;
    let jobs = t.server.jobs();

    jobs.register_fn("shout", |payload, _ctx| async move {
        let word = payload["word"].as_str().unwrap_or_default().to_uppercase();
        Ok(json!({ "shouted": word }))
    });

    let id = jobs
        .enqueue("shout", json!({"word": "hay"}), JobOptions::default())
        .unwrap();
    let job = jobs.wait_for(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"shouted": "HAY"})));

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn single_failure_with_two_attempts_still_completes() {
    let t = started_server().await;
    let jobs = t.server.jobs();

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    jobs.register_fn("flaky", move |_p, _c| {
        let seen = Arc::clone(&seen);
        async move {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("transient".into())
            } else {
                Ok(json!("recovered"))
            }
        }
    });

    let opts = JobOptions {
        max_attempts: 2,
        retry: BackoffConfig {
            initial_ms: 10,
            multiplier: 2.0,
            max_ms: 50,
        },
        trace_id: Some("tr_spec".to_string()),
    };
    let id = jobs.enqueue("flaky", json!({}), opts).unwrap();
    let job = jobs.wait_for(&id, Duration::from_secs(10)).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!("recovered")));
    assert_eq!(job.attempts, 2);
    assert!(job.attempts <= job.max_attempts);
    assert_eq!(job.trace_id.as_deref(), Some("tr_spec"), "trace id survives retries");

    // Exactly one terminal lifecycle event for the id
    let bus = t.server.bus();
    let terminal: usize = ["job.completed", "job.failed", "job.cancelled"]
        .iter()
        .map(|name| {
            bus.get_history(name, None)
                .iter()
                .filter(|r| r.data["id"] == json!(id))
                .count()
        })
        .sum();
    assert_eq!(terminal, 1);

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduled_job_waits_for_run_at() {
    let t = started_server().await;
    let jobs = t.server.jobs();

    jobs.register_fn("later", |_p, _c| async move { Ok(json!("ran")) });

    let now_ms = dk_core::Clock::epoch_ms(&dk_core::SystemClock);
    let id = jobs
        .schedule("later", json!({}), now_ms + 150, JobOptions::default())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(jobs.get(&id).unwrap().status, JobStatus::Scheduled);

    let job = jobs.wait_for(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.started_at_ms.unwrap() >= now_ms + 150);

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_job_stays_cancelled() {
    let t = started_server().await;
    let jobs = t.server.jobs();

    // No handler registered: the row sits pending until cancelled
    let id = jobs
        .enqueue("unhandled", json!({}), JobOptions::default())
        .unwrap();
    assert!(jobs.cancel(&id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = jobs.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.finished_at_ms.is_some());

    // Terminal: a second cancel is a no-op, status never changes
    assert!(!jobs.cancel(&id).await.unwrap());
    assert_eq!(jobs.get(&id).unwrap().status, JobStatus::Cancelled);

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_claims_are_reopened_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = dk_server::Config::for_state_dir(dir.path().to_path_buf()).unwrap();
    config.jobs.poll_interval = Duration::from_millis(10);
    config.jobs.stale_check_interval = Duration::from_millis(50);
    config.jobs.lease_ms = 100;

    // First life: a job is claimed, then the process "dies" without settling
    {
        let server = dk_server::Server::build(config.clone()).unwrap();
        let id = server
            .jobs()
            .enqueue("comeback", json!({}), JobOptions::default())
            .unwrap();
        let now_ms = dk_core::Clock::epoch_ms(&dk_core::SystemClock);
        server.store().claim_job(&id, now_ms, 100).unwrap();
        server.store().flush().unwrap();
        // No shutdown: simulate a crash by dropping with the lease open
    }

    tokio::time::sleep(Duration::from_millis(150)).await;

    let server = dk_server::Server::build(config).unwrap();
    server.start().await.unwrap();
    server
        .jobs()
        .register_fn("comeback", |_p, _c| async move { Ok(json!("second life")) });

    let store = server.store().clone();
    eventually("stale job to be reopened and completed", || {
        store
            .list_jobs(Some(JobStatus::Completed))
            .iter()
            .any(|j| j.name == "comeback")
    })
    .await;

    assert_eq!(
        server.bus().get_history("job.stale", None).len(),
        1,
        "the expired lease was detected"
    );

    server.shutdown().await.unwrap();
}
