// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory log store for tests.
//!
//! Gated behind `#[cfg(any(test, feature = "test-support"))]`.

use crate::store::{LogStore, LogStoreError};
use dk_core::{LogEntry, LogFilter, LogSource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Vec-backed [`LogStore`] with injectable failures.
#[derive(Default)]
pub struct MemoryLogStore {
    pub entries: Mutex<Vec<LogEntry>>,
    /// When set, `write_batch` fails (for requeue tests).
    pub fail_writes: AtomicBool,
    /// When set, `delete_older_than` reports a missing table.
    pub missing_table: AtomicBool,
    pub write_batches: AtomicUsize,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.id.clone()).collect()
    }
}

#[async_trait::async_trait]
impl LogStore for MemoryLogStore {
    async fn write_batch(&self, batch: &[LogEntry]) -> Result<(), LogStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LogStoreError::Other("injected write failure".to_string()));
        }
        self.write_batches.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().extend(batch.iter().cloned());
        Ok(())
    }

    async fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, LogStoreError> {
        let entries = self.entries.lock();
        let mut hits: Vec<LogEntry> = entries.iter().filter(|e| filter.matches(e)).cloned().collect();
        hits.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms).then(b.id.cmp(&a.id)));
        Ok(hits
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn count(&self, filter: &LogFilter) -> Result<usize, LogStoreError> {
        Ok(self.entries.lock().iter().filter(|e| filter.matches(e)).count())
    }

    async fn delete_older_than(
        &self,
        cutoff_ms: u64,
        source: LogSource,
    ) -> Result<usize, LogStoreError> {
        if self.missing_table.load(Ordering::SeqCst) {
            return Err(LogStoreError::MissingTable);
        }
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.source != source || e.timestamp_ms >= cutoff_ms);
        Ok(before - entries.len())
    }
}
