// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The log sink.

use crate::config::{LogsConfig, MAX_BUFFER_OVERFLOW};
use crate::store::{LogStore, LogStoreError};
use dk_core::{
    random_suffix, Clock, EventMetadata, LogDraft, LogEntry, LogFilter, LogSource, SystemClock,
};
use dk_events::EventBus;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

struct SinkInner {
    config: LogsConfig,
    store: Arc<dyn LogStore>,
    bus: EventBus,
    epoch_ms: Box<dyn Fn() -> u64 + Send + Sync>,
    buffer: Mutex<VecDeque<LogEntry>>,
    /// Single-flight guard: only one flush drains at a time.
    flushing: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

/// Buffered persistent log sink.
#[derive(Clone)]
pub struct PersistentLogs {
    inner: Arc<SinkInner>,
}

impl PersistentLogs {
    pub fn new(store: Arc<dyn LogStore>, bus: EventBus, config: LogsConfig) -> Self {
        Self::with_clock(store, bus, config, SystemClock)
    }

    pub fn with_clock<C: Clock>(
        store: Arc<dyn LogStore>,
        bus: EventBus,
        config: LogsConfig,
        clock: C,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                config,
                store,
                bus,
                epoch_ms: Box::new(move || clock.epoch_ms()),
                buffer: Mutex::new(VecDeque::new()),
                flushing: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start the background flush ticker and retention sweeper.
    pub fn start(&self) {
        let flush_self = self.clone();
        let flush_interval = self.inner.config.flush_interval;
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !flush_self.inner.buffer.lock().is_empty() {
                            flush_self.flush().await;
                        }
                    }
                }
            }
        });

        let sweep_self = self.clone();
        let cleanup_interval = self.inner.config.cleanup_interval;
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the sweep runs on
            // the interval, not at startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => sweep_self.sweep_retention().await,
                }
            }
        });
    }

    /// Enqueue a log entry. Synchronous; never blocks on I/O.
    ///
    /// Dropped when the sink is stopped or the level is below the configured
    /// minimum. A full buffer kicks an async flush; a pathologically large
    /// buffer is trimmed to the newest entries with a warning.
    pub fn write(&self, draft: LogDraft) {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) || draft.level < inner.config.min_level {
            return;
        }

        let now_ms = (inner.epoch_ms)();
        let id = format!("log_{}_{}", now_ms, random_suffix(4));
        let entry = draft.into_entry(id, now_ms);

        let should_flush = {
            let mut buffer = inner.buffer.lock();
            buffer.push_back(entry);

            if buffer.len() > MAX_BUFFER_OVERFLOW {
                let dropped = buffer.len() - inner.config.max_buffer_size;
                while buffer.len() > inner.config.max_buffer_size {
                    buffer.pop_front();
                }
                warn!(dropped, "log buffer overflow, dropped oldest entries");
            }

            buffer.len() >= inner.config.max_buffer_size
        };

        if should_flush {
            let sink = self.clone();
            tokio::spawn(async move { sink.flush().await });
        }
    }

    /// Drain the buffer into the store and emit per-entry events.
    ///
    /// Single-flight: a concurrent flush returns immediately. On store
    /// failure the drained batch goes back to the front of the buffer for
    /// the next attempt.
    pub async fn flush(&self) {
        let inner = &self.inner;
        if inner.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        let batch: Vec<LogEntry> = {
            let mut buffer = inner.buffer.lock();
            buffer.drain(..).collect()
        };

        if batch.is_empty() {
            inner.flushing.store(false, Ordering::SeqCst);
            return;
        }

        match inner.store.write_batch(&batch).await {
            Ok(()) => {
                for entry in &batch {
                    self.emit_for_entry(entry).await;
                }
            }
            Err(e) => {
                warn!(error = %e, entries = batch.len(), "log flush failed, requeueing batch");
                let mut buffer = inner.buffer.lock();
                for entry in batch.into_iter().rev() {
                    buffer.push_front(entry);
                }
            }
        }

        inner.flushing.store(false, Ordering::SeqCst);
    }

    /// Emit `log.created`, `log.<source>`, and `log.<source>.<sourceId>`.
    async fn emit_for_entry(&self, entry: &LogEntry) {
        let data = match serde_json::to_value(entry) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "log entry not serializable for event emission");
                return;
            }
        };
        let metadata = EventMetadata::source("logs");

        self.inner
            .bus
            .emit_with_metadata("log.created", data.clone(), metadata.clone())
            .await;
        self.inner
            .bus
            .emit_with_metadata(
                &format!("log.{}", entry.source),
                data.clone(),
                metadata.clone(),
            )
            .await;
        if let Some(source_id) = &entry.source_id {
            self.inner
                .bus
                .emit_with_metadata(&format!("log.{}.{}", entry.source, source_id), data, metadata)
                .await;
        }
    }

    /// One retention pass over every source.
    async fn sweep_retention(&self) {
        let now_ms = (self.inner.epoch_ms)();
        for source in LogSource::all() {
            let days = self.inner.config.retention_for(source);
            let cutoff_ms = now_ms.saturating_sub(days as u64 * 24 * 60 * 60 * 1_000);
            match self.inner.store.delete_older_than(cutoff_ms, source).await {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::debug!(source = %source, removed, "retention sweep pruned entries");
                }
                Err(LogStoreError::MissingTable) => {}
                Err(e) => {
                    error!(source = %source, error = %e, "retention sweep failed");
                }
            }
        }
    }

    /// Filtered query against the store (flushed entries only).
    pub async fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, LogStoreError> {
        self.inner.store.query(filter).await
    }

    /// Count of stored entries matching the filter.
    pub async fn count(&self, filter: &LogFilter) -> Result<usize, LogStoreError> {
        self.inner.store.count(filter).await
    }

    /// Newest entries for a source, optionally scoped to one source id.
    pub async fn get_by_source(
        &self,
        source: LogSource,
        source_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>, LogStoreError> {
        let filter = LogFilter {
            source: Some(source),
            source_id: source_id.map(str::to_string),
            limit,
            ..LogFilter::default()
        };
        self.inner.store.query(&filter).await
    }

    /// Number of buffered (unflushed) entries.
    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Stop intake, cancel background loops, and flush what remains.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
        self.flush().await;
    }
}

#[cfg(test)]
#[path = "sink_tests.rs"]
mod tests;
