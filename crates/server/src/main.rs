// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! donkeylabs server daemon (donkeyd)
//!
//! Owns one state directory and runs the five core services until a signal
//! arrives. Also hosts the `workflow-executor` entry point that isolated
//! workflow instances are re-invoked through.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use dk_server::{Config, Server, ServerError};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    match std::env::args().nth(1).as_deref() {
        Some("--version") | Some("-V") | Some("-v") => {
            println!("donkeyd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | Some("-h") | Some("help") => {
            print_help();
            return Ok(());
        }
        Some("workflow-executor") => return run_workflow_executor().await,
        Some(other) => {
            eprintln!("error: unexpected argument '{other}'");
            eprintln!("Usage: donkeyd [--help | --version | workflow-executor]");
            std::process::exit(1);
        }
        None => {}
    }

    let config = Config::load()?;

    rotate_log_if_needed(&config.log_path);
    let _log_guard = setup_logging(&config)?;

    info!("starting donkeyd");
    let server = match Server::build(config) {
        Ok(server) => server,
        Err(ServerError::LockFailed(_)) => {
            eprintln!("donkeyd is already running");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "failed to build server");
            return Err(e.into());
        }
    };
    server.start().await?;

    // Signal ready for parent process (e.g. systemd, CLI waiting for startup)
    println!("READY");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    server.shutdown().await?;
    Ok(())
}

/// Child entry point for isolated workflow instances.
///
/// The stock daemon registers no workflow definitions, so this registry is
/// empty; an embedding application ships its own binary that wires
/// `run_executor` to the same registrations its server makes.
async fn run_workflow_executor() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = dk_workflows::ExecutorConfig::from_env()?;
    dk_workflows::run_executor(config, |_name: &str| None).await?;
    Ok(())
}

fn print_help() {
    println!("donkeyd {}", env!("CARGO_PKG_VERSION"));
    println!("donkeylabs server daemon - durable jobs, processes, and workflows");
    println!();
    println!("USAGE:");
    println!("    donkeyd [SUBCOMMAND]");
    println!();
    println!("SUBCOMMANDS:");
    println!("    workflow-executor    Run as an isolated-workflow executor child");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print help information");
    println!("    -v, --version    Print version information");
    println!();
    println!("State lives under $DONKEYLABS_STATE_DIR (default:");
    println!("$XDG_STATE_HOME/donkeylabs or ~/.local/state/donkeylabs).");
}

/// Maximum log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep (server.log.1, .2, .3).
const MAX_ROTATED_LOGS: u32 = 3;

/// Rotate the server log file if it exceeds [`MAX_LOG_SIZE`].
///
/// Shifts `server.log` → `server.log.1` → `server.log.2` → `server.log.3`,
/// deleting the oldest. Best-effort: rotation failures are silently ignored
/// so the daemon still starts.
fn rotate_log_if_needed(log_path: &std::path::Path) {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };

    if size < MAX_LOG_SIZE {
        return;
    }

    let log_str = log_path.display().to_string();

    for i in (1..MAX_ROTATED_LOGS).rev() {
        let from = format!("{log_str}.{i}");
        let to = format!("{log_str}.{}", i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    let _ = std::fs::rename(log_path, format!("{log_str}.1"));
}

fn setup_logging(
    config: &Config,
) -> Result<tracing_appender::non_blocking::WorkerGuard, Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    if let Some(parent) = config.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender = tracing_appender::rolling::never(
        config.log_path.parent().unwrap_or(&config.state_dir),
        config
            .log_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("server.log")),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
