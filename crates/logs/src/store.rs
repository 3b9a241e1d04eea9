// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log persistence seam.

use dk_core::{LogEntry, LogFilter, LogSource};
use thiserror::Error;

/// Errors from a log store backend.
#[derive(Debug, Error)]
pub enum LogStoreError {
    /// The backing table does not exist (swallowed by the retention sweeper).
    #[error("log table missing")]
    MissingTable,
    #[error("{0}")]
    Other(String),
}

/// Batch-oriented log persistence.
#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    /// Persist a flushed batch. All-or-nothing: on error the caller requeues
    /// the whole batch.
    async fn write_batch(&self, batch: &[LogEntry]) -> Result<(), LogStoreError>;

    /// Filtered query, timestamp-descending, honoring offset/limit.
    async fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, LogStoreError>;

    /// Count of entries matching the filter (paging ignored).
    async fn count(&self, filter: &LogFilter) -> Result<usize, LogStoreError>;

    /// Drop entries for `source` older than `cutoff_ms`; returns the number
    /// removed.
    async fn delete_older_than(
        &self,
        cutoff_ms: u64,
        source: LogSource,
    ) -> Result<usize, LogStoreError>;
}

#[async_trait::async_trait]
impl LogStore for dk_storage::Store {
    async fn write_batch(&self, batch: &[LogEntry]) -> Result<(), LogStoreError> {
        self.append_logs(batch)
            .map_err(|e| LogStoreError::Other(e.to_string()))
    }

    async fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, LogStoreError> {
        Ok(self.query_logs(filter))
    }

    async fn count(&self, filter: &LogFilter) -> Result<usize, LogStoreError> {
        Ok(self.count_logs(filter))
    }

    async fn delete_older_than(
        &self,
        cutoff_ms: u64,
        source: LogSource,
    ) -> Result<usize, LogStoreError> {
        self.delete_logs_older_than(cutoff_ms, source)
            .map_err(|e| LogStoreError::Other(e.to_string()))
    }
}
