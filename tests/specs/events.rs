// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::support::started_server;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread")]
async fn history_retains_exactly_the_newest_records_in_publish_order() {
    let t = started_server().await;
    let bus = t.server.bus();

    let cap = 1_000;
    for i in 0..(cap + 50) {
        bus.emit("spec.tick", json!({ "i": i })).await;
    }

    let history = bus.get_history("spec.tick", None);
    assert_eq!(history.len(), cap);
    let first = history.first().unwrap().data["i"].as_u64().unwrap();
    let last = history.last().unwrap().data["i"].as_u64().unwrap();
    assert_eq!(first, 50);
    assert_eq!(last, (cap + 50 - 1) as u64);

    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn emit_after_stop_delivers_zero_invocations() {
    let t = started_server().await;
    let bus = t.server.bus().clone();

    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    bus.on("spec.silent", move |_| {
        let c = Arc::clone(&c);
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    bus.stop().await;
    bus.emit("spec.silent", json!(null)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn once_with_concurrent_emits_delivers_exactly_one() {
    let t = started_server().await;
    let bus = t.server.bus().clone();

    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    bus.once("spec.one-shot", move |_| {
        let c = Arc::clone(&c);
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let emits: Vec<_> = (0..16)
        .map(|_| {
            let bus = bus.clone();
            tokio::spawn(async move { bus.emit("spec.one-shot", json!(null)).await })
        })
        .collect();
    for handle in emits {
        handle.await.unwrap();
    }

    assert_eq!(count.load(Ordering::SeqCst), 1);
    t.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_events_flow_through_the_shared_bus() {
    let t = started_server().await;
    let bus = t.server.bus();

    t.server
        .jobs()
        .register_fn("spec-noop", |_p, _c| async move { Ok(json!(null)) });
    let id = t
        .server
        .jobs()
        .enqueue("spec-noop", json!({}), dk_core::JobOptions::default())
        .unwrap();
    t.server
        .jobs()
        .wait_for(&id, std::time::Duration::from_secs(5))
        .await
        .unwrap();

    let completed = bus.get_history("job.completed", None);
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].metadata.source.as_deref(),
        Some("jobs"),
        "lifecycle events carry their component source"
    );

    t.server.shutdown().await.unwrap();
}
