// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake distribution adapters for tests.
//!
//! Gated behind `#[cfg(any(test, feature = "test-support"))]`.

use crate::distribution::{DistributionAdapter, RemoteDeliver};
use dk_core::EventRecord;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Records every published event and exposes the delivery callback so tests
/// can inject "remote" events.
#[derive(Default)]
pub struct RecordingAdapter {
    pub published: Mutex<Vec<EventRecord>>,
    deliver: Mutex<Option<RemoteDeliver>>,
    stopped: AtomicBool,
    /// When set, `publish` returns an error (for failure-isolation tests).
    pub fail_publish: AtomicBool,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an event arriving from another node.
    pub async fn deliver_remote(&self, record: EventRecord) {
        let deliver = self.deliver.lock().clone();
        if let Some(deliver) = deliver {
            deliver(record).await;
        }
    }

    pub fn published_names(&self) -> Vec<String> {
        self.published.lock().iter().map(|r| r.name.clone()).collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DistributionAdapter for RecordingAdapter {
    async fn publish(&self, record: &EventRecord) -> Result<(), String> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err("transport unavailable".to_string());
        }
        self.published.lock().push(record.clone());
        Ok(())
    }

    async fn subscribe(&self, deliver: RemoteDeliver) {
        *self.deliver.lock() = Some(deliver);
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
