// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ID generation abstractions.
//!
//! Entity ids are plain strings shaped `<prefix>_<suffix>` (e.g.
//! `job_9f2c…`, `wf_31ab…`, `log_1712000000000_a4x9`). Generation goes
//! through [`IdGen`] so tests can use deterministic sequential ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for truncating identifiers to a short prefix.
pub trait ShortId {
    /// Returns a string slice truncated to at most `n` characters.
    fn short(&self, n: usize) -> &str;
}

impl ShortId for str {
    fn short(&self, n: usize) -> &str {
        if self.len() <= n {
            self
        } else {
            &self[..n]
        }
    }
}

/// Generates unique identifiers with a type prefix.
pub trait IdGen: Clone + Send + Sync + 'static {
    /// Produce a fresh id of the form `<prefix>_<suffix>`.
    fn next(&self, prefix: &str) -> String;
}

/// UUID-backed generator for production use.
#[derive(Clone, Default)]
pub struct UuidIdGen;

impl IdGen for UuidIdGen {
    fn next(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
    }
}

/// Sequential generator for deterministic tests.
#[derive(Clone)]
pub struct SequentialIdGen {
    counter: Arc<AtomicU64>,
}

impl SequentialIdGen {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl Default for SequentialIdGen {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGen for SequentialIdGen {
    fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}_{}", prefix, n)
    }
}

/// Short random alphanumeric suffix (lowercase hex), for ids that embed a
/// timestamp and only need a few bytes of entropy to avoid collisions.
pub fn random_suffix(len: usize) -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(len);
    s
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
