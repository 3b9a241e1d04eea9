// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn entry(level: LogLevel, source: LogSource, message: &str) -> LogEntry {
    LogDraft::new(level, source, message).into_entry("log_1_a".to_string(), 1_000)
}

#[test]
fn level_ordering_is_by_severity() {
    assert!(LogLevel::Debug < LogLevel::Info);
    assert!(LogLevel::Info < LogLevel::Warn);
    assert!(LogLevel::Warn < LogLevel::Error);
}

#[parameterized(
    debug = { LogLevel::Debug, "debug" },
    info = { LogLevel::Info, "info" },
    warn = { LogLevel::Warn, "warn" },
    error = { LogLevel::Error, "error" },
)]
fn level_serde_uses_lowercase(level: LogLevel, expected: &str) {
    assert_eq!(
        serde_json::to_string(&level).unwrap(),
        format!("\"{expected}\"")
    );
    assert_eq!(level.to_string(), expected);
}

#[test]
fn draft_stamping_preserves_fields() {
    let entry = LogDraft::new(LogLevel::Warn, LogSource::Job, "lease expired")
        .source_id("job_42")
        .tag("lease")
        .into_entry("log_99_zz".to_string(), 77);

    assert_eq!(entry.id, "log_99_zz");
    assert_eq!(entry.timestamp_ms, 77);
    assert_eq!(entry.source_id.as_deref(), Some("job_42"));
    assert!(entry.tags.contains("lease"));
}

#[test]
fn filter_on_min_level_is_inclusive() {
    let filter = LogFilter {
        min_level: Some(LogLevel::Warn),
        ..LogFilter::default()
    };
    assert!(filter.matches(&entry(LogLevel::Warn, LogSource::System, "x")));
    assert!(filter.matches(&entry(LogLevel::Error, LogSource::System, "x")));
    assert!(!filter.matches(&entry(LogLevel::Info, LogSource::System, "x")));
}

#[test]
fn filter_requires_all_tags() {
    let mut e = entry(LogLevel::Info, LogSource::Cron, "tick");
    e.tags.insert("a".to_string());
    e.tags.insert("b".to_string());

    let both = LogFilter {
        tags: vec!["a".to_string(), "b".to_string()],
        ..LogFilter::default()
    };
    let extra = LogFilter {
        tags: vec!["a".to_string(), "c".to_string()],
        ..LogFilter::default()
    };
    assert!(both.matches(&e));
    assert!(!extra.matches(&e));
}

#[test]
fn filter_search_is_case_insensitive() {
    let filter = LogFilter {
        search: Some("LEASE".to_string()),
        ..LogFilter::default()
    };
    assert!(filter.matches(&entry(LogLevel::Info, LogSource::Job, "lease expired")));
    assert!(!filter.matches(&entry(LogLevel::Info, LogSource::Job, "spawned")));
}

#[test]
fn filter_date_range_is_inclusive() {
    let filter = LogFilter {
        since_ms: Some(1_000),
        until_ms: Some(1_000),
        ..LogFilter::default()
    };
    assert!(filter.matches(&entry(LogLevel::Info, LogSource::System, "x")));
}

#[test]
fn filter_source_id_must_match_exactly() {
    let filter = LogFilter {
        source_id: Some("wf_1".to_string()),
        ..LogFilter::default()
    };
    let matching = LogDraft::new(LogLevel::Info, LogSource::Workflow, "step")
        .source_id("wf_1")
        .into_entry("log_1_b".to_string(), 5);
    let missing = entry(LogLevel::Info, LogSource::Workflow, "step");
    assert!(filter.matches(&matching));
    assert!(!filter.matches(&missing));
}
