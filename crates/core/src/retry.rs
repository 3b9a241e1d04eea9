// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Jittered exponential backoff.
//!
//! One helper shared by job retries, workflow step retries, and process
//! restarts: `delay = clamp(initial × multiplier^failures, max) × uniform(0.5..1.5)`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff curve parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    /// Growth factor applied per failure.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay, in milliseconds.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_initial_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_ms() -> u64 {
    30_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            multiplier: default_multiplier(),
            max_ms: default_max_ms(),
        }
    }
}

impl BackoffConfig {
    /// Deterministic delay after `failures` prior failures (no jitter).
    ///
    /// `failures = 0` yields `initial_ms`; each further failure multiplies by
    /// `multiplier`, clamped to `max_ms`.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let factor = self.multiplier.max(0.0).powi(failures.min(64) as i32);
        let ms = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

/// Apply multiplicative jitter in `[0.5, 1.5)` to a base delay.
pub fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.5..1.5);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}

/// Full backoff computation: clamped exponential delay with jitter applied.
pub fn delay_with_jitter(cfg: &BackoffConfig, failures: u32) -> Duration {
    jittered(cfg.base_delay(failures))
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
