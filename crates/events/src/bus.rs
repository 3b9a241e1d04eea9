// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The event bus.
//!
//! Handler tables are snapshotted under a short lock and released before any
//! handler runs; handlers execute sequentially on the emitting task in
//! registration order, exact-name subscribers before pattern subscribers.

use crate::distribution::{DistributionAdapter, RemoteDeliver};
use crate::history::{HistoryAdapter, InMemoryHistory};
use dk_core::{name_matches, Clock, EventMetadata, EventRecord, SystemClock};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Error type surfaced by event handlers; failures are logged, never raised.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

type HandlerFn = Arc<dyn Fn(EventRecord) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    handler: HandlerFn,
    /// Present for `once` subscriptions; set when the single delivery fires.
    fired: Option<Arc<AtomicBool>>,
}

/// Handle for removing a specific subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    key: String,
    id: u64,
}

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Bound on the in-memory history ring.
    pub max_history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_history_size: 1_000,
        }
    }
}

struct Inner {
    config: EventBusConfig,
    epoch_ms: Box<dyn Fn() -> u64 + Send + Sync>,
    /// Exact-name subscriptions.
    handlers: Mutex<HashMap<String, Vec<HandlerEntry>>>,
    /// Subscriptions whose key contains `*`.
    patterns: Mutex<HashMap<String, Vec<HandlerEntry>>>,
    history: Box<dyn HistoryAdapter>,
    distribution: Mutex<Option<Arc<dyn DistributionAdapter>>>,
    stopped: AtomicBool,
    next_id: AtomicU64,
}

/// Typed pub/sub with bounded history and optional external distribution.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }

    pub fn with_clock<C: Clock>(config: EventBusConfig, clock: C) -> Self {
        let history = InMemoryHistory::new(config.max_history_size);
        Self {
            inner: Arc::new(Inner {
                config,
                epoch_ms: Box::new(move || clock.epoch_ms()),
                handlers: Mutex::new(HashMap::new()),
                patterns: Mutex::new(HashMap::new()),
                history: Box::new(history),
                distribution: Mutex::new(None),
                stopped: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a distribution adapter and register the remote-delivery
    /// callback. Remote events re-enter local dispatch but are never
    /// re-published to the adapter.
    pub async fn attach_distribution(&self, adapter: Arc<dyn DistributionAdapter>) {
        let weak = Arc::downgrade(&self.inner);
        let deliver: RemoteDeliver = Arc::new(move |record| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    Inner::dispatch(&inner, record, false).await;
                }
            })
        });
        adapter.subscribe(deliver).await;
        *self.inner.distribution.lock() = Some(adapter);
    }

    /// Register a handler for an exact name or `*`-pattern.
    pub fn on<F, Fut>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(EventRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(name, Arc::new(move |r| Box::pin(handler(r))), false)
    }

    /// Register a handler that auto-unsubscribes after its first delivery,
    /// even under concurrent emits.
    pub fn once<F, Fut>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(EventRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(name, Arc::new(move |r| Box::pin(handler(r))), true)
    }

    fn register(&self, name: &str, handler: HandlerFn, once: bool) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = HandlerEntry {
            id,
            handler,
            fired: once.then(|| Arc::new(AtomicBool::new(false))),
        };
        let mut table = if name.contains('*') {
            self.inner.patterns.lock()
        } else {
            self.inner.handlers.lock()
        };
        table.entry(name.to_string()).or_default().push(entry);
        Subscription {
            key: name.to_string(),
            id,
        }
    }

    /// Remove one subscription.
    pub fn off(&self, subscription: &Subscription) {
        let mut table = if subscription.key.contains('*') {
            self.inner.patterns.lock()
        } else {
            self.inner.handlers.lock()
        };
        if let Some(entries) = table.get_mut(&subscription.key) {
            entries.retain(|e| e.id != subscription.id);
            if entries.is_empty() {
                table.remove(&subscription.key);
            }
        }
    }

    /// Remove every subscription registered under a name or pattern key.
    pub fn off_all(&self, name: &str) {
        if name.contains('*') {
            self.inner.patterns.lock().remove(name);
        } else {
            self.inner.handlers.lock().remove(name);
        }
    }

    /// Publish an event with empty metadata.
    pub async fn emit(&self, name: &str, data: Value) {
        self.emit_with_metadata(name, data, EventMetadata::default())
            .await
    }

    /// Publish an event: adapter first, then exact handlers, then pattern
    /// handlers. A no-op after `stop()`.
    pub async fn emit_with_metadata(&self, name: &str, data: Value, metadata: EventMetadata) {
        let record = EventRecord::new(name, data, (self.inner.epoch_ms)()).with_metadata(metadata);
        Inner::dispatch(&self.inner, record, true).await;
    }

    /// Up to `limit` newest records for `name` (`"*"` for all).
    pub fn get_history(&self, name: &str, limit: Option<usize>) -> Vec<EventRecord> {
        let limit = limit.unwrap_or(self.inner.config.max_history_size);
        self.inner.history.query(name, limit)
    }

    /// Stop the bus: no further emission or delivery, adapter stopped,
    /// handlers dropped. History stays readable.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let adapter = self.inner.distribution.lock().take();
        if let Some(adapter) = adapter {
            adapter.stop().await;
        }
        self.inner.handlers.lock().clear();
        self.inner.patterns.lock().clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl Inner {
    async fn dispatch(inner: &Arc<Inner>, record: EventRecord, publish_remote: bool) {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        inner.history.record(record.clone());

        if publish_remote {
            let adapter = inner.distribution.lock().clone();
            if let Some(adapter) = adapter {
                if let Err(e) = adapter.publish(&record).await {
                    warn!(event = %record.name, error = %e, "distribution publish failed");
                }
            }
        }

        // Snapshot matching handlers, then release the locks before any
        // handler runs.
        let mut matched: Vec<HandlerEntry> = Vec::new();
        {
            let handlers = inner.handlers.lock();
            if let Some(entries) = handlers.get(&record.name) {
                matched.extend(entries.iter().cloned());
            }
        }
        {
            let patterns = inner.patterns.lock();
            let mut keys: Vec<&String> = patterns
                .keys()
                .filter(|k| name_matches(k, &record.name))
                .collect();
            keys.sort();
            for key in keys {
                if let Some(entries) = patterns.get(key) {
                    matched.extend(entries.iter().cloned());
                }
            }
        }

        let mut fired_once = false;
        for entry in matched {
            if let Some(flag) = &entry.fired {
                if flag.swap(true, Ordering::SeqCst) {
                    continue;
                }
                fired_once = true;
            }
            if let Err(e) = (entry.handler)(record.clone()).await {
                warn!(event = %record.name, error = %e, "event handler failed");
            }
        }

        if fired_once {
            Self::prune_fired(inner);
        }

        debug!(event = %record.name, "dispatched");
    }

    /// Drop `once` entries that have delivered.
    fn prune_fired(inner: &Arc<Inner>) {
        for table in [&inner.handlers, &inner.patterns] {
            let mut table = table.lock();
            table.retain(|_, entries| {
                entries.retain(|e| {
                    e.fired
                        .as_ref()
                        .is_none_or(|f| !f.load(Ordering::SeqCst))
                });
                !entries.is_empty()
            });
        }
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
