// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Socket endpoint reservation and cleanup.
//!
//! Each managed process owns one endpoint: a Unix socket under the
//! configured directory, or a free loopback TCP port from a configured range
//! on platforms without UDS. Reservation and release are idempotent.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A reserved IPC endpoint for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(u16),
}

impl Endpoint {
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Endpoint::Unix(path) => Some(path),
            Endpoint::Tcp(_) => None,
        }
    }

    pub fn tcp_port(&self) -> Option<u16> {
        match self {
            Endpoint::Unix(_) => None,
            Endpoint::Tcp(port) => Some(*port),
        }
    }
}

/// Reserve a Unix socket path for a process id, clearing any stale file.
pub fn reserve_unix(socket_dir: &Path, id: &str) -> io::Result<Endpoint> {
    std::fs::create_dir_all(socket_dir)?;
    let path = socket_dir.join(format!("{id}.sock"));
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(Endpoint::Unix(path))
}

/// Reserve a free loopback TCP port from an inclusive range.
pub fn reserve_tcp(range: (u16, u16)) -> io::Result<Endpoint> {
    for port in range.0..=range.1 {
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(Endpoint::Tcp(port));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no free port in {}..={}", range.0, range.1),
    ))
}

/// Release an endpoint. Safe to call more than once.
pub fn release(endpoint: &Endpoint) {
    if let Endpoint::Unix(path) = endpoint {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove socket file");
            }
        }
    }
}

/// Remove `.sock` files in the socket directory that do not belong to a
/// currently-tracked process.
pub fn cleanup_stale(socket_dir: &Path, keep: &HashSet<PathBuf>) -> usize {
    let Ok(entries) = std::fs::read_dir(socket_dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sock") && !keep.contains(&path) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale socket"),
            }
        }
    }
    removed
}

#[cfg(test)]
#[path = "socket_tests.rs"]
mod tests;
