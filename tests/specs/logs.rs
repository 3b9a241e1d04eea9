// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::support::started_server;
use dk_core::{LogDraft, LogFilter, LogLevel, LogSource};

#[tokio::test(flavor = "multi_thread")]
async fn write_flush_query_round_trip_preserves_entries() {
    let t = started_server().await;
    let logs = t.server.logs();

    logs.write(
        LogDraft::new(LogLevel::Info, LogSource::Job, "job started")
            .source_id("job_77")
            .tag("spec"),
    );
    logs.write(
        LogDraft::new(LogLevel::Error, LogSource::Job, "job exploded")
            .source_id("job_77")
            .tag("spec"),
    );
    logs.write(LogDraft::new(LogLevel::Info, LogSource::Cron, "tick"));
    logs.flush().await;

    let filter = LogFilter {
        source: Some(LogSource::Job),
        tags: vec!["spec".to_string()],
        ..LogFilter::default()
    };
    let hits = logs.query(&filter).await.unwrap();
    assert_eq!(hits.len(), 2, "every matching entry exactly once");
    assert!(hits.iter().all(|e| e.id.starts_with("log_")));
    assert!(hits.iter().all(|e| e.source_id.as_deref() == Some("job_77")));
    assert_eq!(logs.count(&filter).await.unwrap(), 2);

    // Min-level filtering is inclusive
    let errors = logs
        .query(&LogFilter {
            min_level: Some(LogLevel::Error),
            ..LogFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "job exploded");

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn flushed_entries_emit_scoped_log_events() {
    let t = started_server().await;
    let logs = t.server.logs();

    logs.write(
        LogDraft::new(LogLevel::Warn, LogSource::Workflow, "step slow").source_id("wf_9"),
    );
    logs.flush().await;

    let bus = t.server.bus();
    assert_eq!(bus.get_history("log.created", None).len(), 1);
    assert_eq!(bus.get_history("log.workflow", None).len(), 1);
    assert_eq!(bus.get_history("log.workflow.wf_9", None).len(), 1);

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn entries_below_min_level_are_dropped() {
    let t = started_server().await;
    let logs = t.server.logs();

    logs.write(LogDraft::new(LogLevel::Debug, LogSource::System, "noise"));
    logs.flush().await;

    assert_eq!(logs.count(&LogFilter::default()).await.unwrap(), 0);
    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn flushed_entries_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = dk_server::Config::for_state_dir(dir.path().to_path_buf()).unwrap();
    config.jobs.poll_interval = std::time::Duration::from_millis(10);

    {
        let server = dk_server::Server::build(config.clone()).unwrap();
        server.start().await.unwrap();
        server
            .logs()
            .write(LogDraft::new(LogLevel::Info, LogSource::System, "durable"));
        server.logs().flush().await;
        server.shutdown().await.unwrap();
    }

    let server = dk_server::Server::build(config).unwrap();
    let hits = server
        .logs()
        .query(&LogFilter::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].message, "durable");
}
