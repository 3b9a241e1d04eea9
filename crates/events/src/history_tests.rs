// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

fn record(name: &str, n: u64) -> EventRecord {
    EventRecord::new(name, json!({ "n": n }), n)
}

#[test]
fn retains_insertion_order() {
    let history = InMemoryHistory::new(10);
    for i in 0..3 {
        history.record(record("a", i));
    }

    let all = history.query("*", 10);
    let stamps: Vec<u64> = all.iter().map(|r| r.timestamp_ms).collect();
    assert_eq!(stamps, vec![0, 1, 2]);
}

#[test]
fn trims_oldest_when_over_capacity() {
    let history = InMemoryHistory::new(3);
    for i in 0..5 {
        history.record(record("a", i));
    }

    assert_eq!(history.len(), 3);
    let stamps: Vec<u64> = history.query("*", 10).iter().map(|r| r.timestamp_ms).collect();
    assert_eq!(stamps, vec![2, 3, 4], "exactly the newest N in publish order");
}

#[test]
fn query_filters_by_exact_name() {
    let history = InMemoryHistory::new(10);
    history.record(record("job.completed", 1));
    history.record(record("job.failed", 2));
    history.record(record("job.completed", 3));

    let hits = history.query("job.completed", 10);
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|r| r.name == "job.completed"));
}

#[test]
fn query_limit_keeps_newest() {
    let history = InMemoryHistory::new(10);
    for i in 0..5 {
        history.record(record("a", i));
    }

    let hits = history.query("a", 2);
    let stamps: Vec<u64> = hits.iter().map(|r| r.timestamp_ms).collect();
    assert_eq!(stamps, vec![3, 4]);
}

#[test]
fn empty_history_is_empty() {
    let history = InMemoryHistory::new(4);
    assert!(history.is_empty());
    assert!(history.query("*", 10).is_empty());
}
