// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Registered process definitions.

use dk_core::{ProcessConfig, ProcessStats};
use serde_json::Value;
use std::sync::Arc;

/// Callback invoked with (process id, payload).
pub type MessageCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
/// Callback invoked with (process id, stats).
pub type StatsCallback = Arc<dyn Fn(&str, &ProcessStats) + Send + Sync>;
/// Callback invoked with (process id, exit code).
pub type CrashCallback = Arc<dyn Fn(&str, Option<i32>) + Send + Sync>;
/// Callback invoked with (process id).
pub type UnhealthyCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Callback invoked with (new process id, restart count).
pub type RestartCallback = Arc<dyn Fn(&str, u32) + Send + Sync>;

/// A named, spawnable process: serializable config plus optional runtime
/// callbacks. Callbacks run inline on supervisor tasks and must not block.
#[derive(Clone)]
pub struct ProcessDefinition {
    pub name: String,
    pub config: ProcessConfig,
    pub on_message: Option<MessageCallback>,
    pub on_stats: Option<StatsCallback>,
    pub on_crash: Option<CrashCallback>,
    pub on_unhealthy: Option<UnhealthyCallback>,
    pub on_restart: Option<RestartCallback>,
}

impl ProcessDefinition {
    pub fn new(name: impl Into<String>, config: ProcessConfig) -> Self {
        Self {
            name: name.into(),
            config,
            on_message: None,
            on_stats: None,
            on_crash: None,
            on_unhealthy: None,
            on_restart: None,
        }
    }

    pub fn on_message(mut self, f: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_stats(mut self, f: impl Fn(&str, &ProcessStats) + Send + Sync + 'static) -> Self {
        self.on_stats = Some(Arc::new(f));
        self
    }

    pub fn on_crash(mut self, f: impl Fn(&str, Option<i32>) + Send + Sync + 'static) -> Self {
        self.on_crash = Some(Arc::new(f));
        self
    }

    pub fn on_unhealthy(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_unhealthy = Some(Arc::new(f));
        self
    }

    pub fn on_restart(mut self, f: impl Fn(&str, u32) + Send + Sync + 'static) -> Self {
        self.on_restart = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for ProcessDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDefinition")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
