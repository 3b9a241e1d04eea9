// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistent log entry model and query filters.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Severity of a log entry. Ordering is by severity (`Debug < Error`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

crate::simple_display! {
    LogLevel {
        Debug => "debug",
        Info => "info",
        Warn => "warn",
        Error => "error",
    }
}

/// Which part of the system a log entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    System,
    Cron,
    Job,
    Workflow,
    Plugin,
    Route,
}

crate::simple_display! {
    LogSource {
        System => "system",
        Cron => "cron",
        Job => "job",
        Workflow => "workflow",
        Plugin => "plugin",
        Route => "route",
    }
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::System => "system",
            LogSource::Cron => "cron",
            LogSource::Job => "job",
            LogSource::Workflow => "workflow",
            LogSource::Plugin => "plugin",
            LogSource::Route => "route",
        }
    }

    /// All known sources, for retention sweeps.
    pub fn all() -> [LogSource; 6] {
        [
            LogSource::System,
            LogSource::Cron,
            LogSource::Job,
            LogSource::Workflow,
            LogSource::Plugin,
            LogSource::Route,
        ]
    }
}

/// A stored log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
    pub source: LogSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

/// A log entry as submitted by callers; id and timestamp are stamped by the
/// sink on write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogDraft {
    pub level: LogLevel,
    pub message: String,
    pub source: LogSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl Default for LogSource {
    fn default() -> Self {
        LogSource::System
    }
}

impl LogDraft {
    pub fn new(level: LogLevel, source: LogSource, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            source,
            ..Self::default()
        }
    }

    pub fn source_id(mut self, id: impl Into<String>) -> Self {
        self.source_id = Some(id.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Stamp into a stored entry.
    pub fn into_entry(self, id: String, timestamp_ms: u64) -> LogEntry {
        LogEntry {
            id,
            timestamp_ms,
            level: self.level,
            message: self.message,
            source: self.source,
            source_id: self.source_id,
            tags: self.tags,
            data: self.data,
            context: self.context,
        }
    }
}

/// Query filters for stored log entries.
///
/// All present filters must match; `limit`/`offset` page the result after
/// timestamp-descending ordering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<LogSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Inclusive minimum severity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_level: Option<LogLevel>,
    /// Entry must carry ALL of these tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Case-insensitive substring match on the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl LogFilter {
    /// Whether an entry satisfies every present filter (paging excluded).
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(source) = self.source {
            if entry.source != source {
                return false;
            }
        }
        if let Some(ref source_id) = self.source_id {
            if entry.source_id.as_deref() != Some(source_id.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.min_level {
            if entry.level < min {
                return false;
            }
        }
        if !self.tags.iter().all(|t| entry.tags.contains(t)) {
            return false;
        }
        if let Some(ref search) = self.search {
            if !entry
                .message
                .to_lowercase()
                .contains(&search.to_lowercase())
            {
                return false;
            }
        }
        if let Some(since) = self.since_ms {
            if entry.timestamp_ms < since {
                return false;
            }
        }
        if let Some(until) = self.until_ms {
            if entry.timestamp_ms > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
