// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded event history.

use dk_core::EventRecord;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Retains recent events for `get_history` queries.
pub trait HistoryAdapter: Send + Sync {
    /// Record a published event.
    fn record(&self, record: EventRecord);
    /// Newest-last records matching `name` (`"*"` matches everything),
    /// at most `limit` of them.
    fn query(&self, name: &str, limit: usize) -> Vec<EventRecord>;
}

/// Default in-memory ring: insertion order, trimmed from the front when the
/// size cap is exceeded.
pub struct InMemoryHistory {
    max_size: usize,
    records: Mutex<VecDeque<EventRecord>>,
}

impl InMemoryHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl HistoryAdapter for InMemoryHistory {
    fn record(&self, record: EventRecord) {
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > self.max_size {
            records.pop_front();
        }
    }

    fn query(&self, name: &str, limit: usize) -> Vec<EventRecord> {
        let records = self.records.lock();
        let matching: Vec<&EventRecord> = records
            .iter()
            .filter(|r| name == "*" || r.name == name)
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;
