// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! dk-server: the aggregate server instance.
//!
//! A [`Server`] owns one of each core component (store, event bus,
//! persistent logs, jobs engine, process supervisor, workflows engine),
//! wired together at construction. There is no process-wide singleton; tests build
//! as many instances as they like, each rooted in its own state directory
//! behind an exclusive lock file.

mod config;
mod server;

pub use config::{Config, ConfigError};
pub use server::{Server, ServerError};
