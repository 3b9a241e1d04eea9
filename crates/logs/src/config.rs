// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log sink configuration.

use dk_core::{LogLevel, LogSource};
use std::collections::HashMap;
use std::time::Duration;

/// Hard cap on the buffer; beyond this the oldest entries are dropped.
pub const MAX_BUFFER_OVERFLOW: usize = 10_000;

/// Tuning knobs for [`crate::PersistentLogs`].
#[derive(Debug, Clone)]
pub struct LogsConfig {
    /// Entries below this level are dropped at `write`.
    pub min_level: LogLevel,
    /// Buffer size that triggers a flush.
    pub max_buffer_size: usize,
    /// Interval of the background flush ticker.
    pub flush_interval: Duration,
    /// Interval of the retention sweeper.
    pub cleanup_interval: Duration,
    /// Default retention in days.
    pub retention_days: u32,
    /// Per-source retention overrides, in days.
    pub retention_overrides: HashMap<LogSource, u32>,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            max_buffer_size: 100,
            flush_interval: Duration::from_millis(50),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            retention_days: 14,
            retention_overrides: HashMap::new(),
        }
    }
}

impl LogsConfig {
    /// Retention in days for a source, honoring overrides.
    pub fn retention_for(&self, source: LogSource) -> u32 {
        self.retention_overrides
            .get(&source)
            .copied()
            .unwrap_or(self.retention_days)
    }
}
