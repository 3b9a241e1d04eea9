// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event records and name-pattern matching.
//!
//! Events are named with dot-separated strings (`job.completed`,
//! `process.worker.restarted`) and carry an opaque JSON payload. Subscription
//! keys may use `*` as a segment wildcard; see [`name_matches`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Optional context attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Trace id propagated from the originating job/workflow row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Component that emitted the event (`jobs`, `procs`, `workflows`, `logs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Any further caller-supplied fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl EventMetadata {
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none() && self.source.is_none() && self.extra.is_empty()
    }

    /// Metadata carrying only a source component name.
    pub fn source(name: &str) -> Self {
        Self {
            source: Some(name.to_string()),
            ..Self::default()
        }
    }
}

/// A published event as retained in history and delivered to handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    pub data: Value,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "EventMetadata::is_empty")]
    pub metadata: EventMetadata,
}

impl EventRecord {
    pub fn new(name: impl Into<String>, data: Value, timestamp_ms: u64) -> Self {
        Self {
            name: name.into(),
            data,
            timestamp_ms,
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Match an event name against a subscription pattern.
///
/// Names and patterns are dot-separated. A `*` segment matches exactly one
/// name segment in interior positions; a trailing `*` matches one or more
/// remaining segments, so `order.*` matches both `order.created` and
/// `order.created.v2`. A bare `*` matches everything.
pub fn name_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == name;
    }

    let pat: Vec<&str> = pattern.split('.').collect();
    let segs: Vec<&str> = name.split('.').collect();

    let trailing_wildcard = pat.last() == Some(&"*");
    if trailing_wildcard {
        // Need at least one segment for the trailing `*`
        if segs.len() < pat.len() {
            return false;
        }
    } else if segs.len() != pat.len() {
        return false;
    }

    // Zip covers every pattern segment; a trailing `*` pairs with the first
    // of the remaining name segments and the rest are consumed unchecked.
    pat.iter().zip(segs.iter()).all(|(p, s)| *p == "*" || p == s)
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
