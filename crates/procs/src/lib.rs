// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! dk-procs: long-running subprocess lifecycle manager.
//!
//! Children are persisted before they are forked, speak line-delimited JSON
//! over a per-process socket, and are watched for exit, heartbeat silence,
//! and resource-limit breaches. Unexpected exits auto-restart under a
//! jittered backoff with a consecutive-failure budget; on startup the
//! supervisor probes persisted rows and reconnects or replaces orphans.

mod child;
mod definition;
mod ipc;
mod socket;
mod supervisor;

pub use child::{ChildChannel, ChildError};
pub use definition::ProcessDefinition;
pub use socket::Endpoint;
pub use supervisor::{ProcessSupervisor, ProcsError, SpawnOptions, SupervisorConfig};

/// Environment variable naming the child's process id.
pub const ENV_PROCESS_ID: &str = "DONKEYLABS_PROCESS_ID";
/// Environment variable naming the Unix socket path (exclusive with TCP port).
pub const ENV_SOCKET_PATH: &str = "DONKEYLABS_SOCKET_PATH";
/// Environment variable naming the loopback TCP port (exclusive with socket path).
pub const ENV_TCP_PORT: &str = "DONKEYLABS_TCP_PORT";
/// Environment variable carrying the serialized metadata JSON.
pub const ENV_METADATA: &str = "DONKEYLABS_METADATA";
