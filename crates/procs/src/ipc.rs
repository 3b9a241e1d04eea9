// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor-side IPC: connect to a child's endpoint and pump its messages.

use crate::child::read_json_line;
use crate::socket::Endpoint;
use dk_core::ProcessMessage;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connect to a child endpoint once.
pub(crate) async fn connect(endpoint: &Endpoint) -> io::Result<(BoxedReader, BoxedWriter)> {
    match endpoint {
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            let (r, w) = stream.into_split();
            Ok((BufReader::new(Box::new(r) as _), Box::new(w) as _))
        }
        Endpoint::Tcp(port) => {
            let stream = TcpStream::connect(("127.0.0.1", *port)).await?;
            let (r, w) = stream.into_split();
            Ok((BufReader::new(Box::new(r) as _), Box::new(w) as _))
        }
    }
}

/// Retry `connect` until it succeeds, the attempt budget is spent, or the
/// child is cancelled. Children bind their endpoint at their own pace after
/// fork, so the first attempts routinely fail.
pub(crate) async fn connect_with_retry(
    endpoint: &Endpoint,
    attempts: u32,
    interval: Duration,
    cancel: &CancellationToken,
) -> Option<(BoxedReader, BoxedWriter)> {
    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return None;
        }
        match connect(endpoint).await {
            Ok(pair) => {
                debug!(?endpoint, attempt, "connected to child endpoint");
                return Some(pair);
            }
            Err(_) => {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }
    warn!(?endpoint, attempts, "gave up connecting to child endpoint");
    None
}

/// Outcome of pumping one child connection.
pub(crate) enum PumpEnd {
    /// Clean EOF or cancellation.
    Closed,
    /// Unparseable frame: protocol error, the connection is poisoned.
    Protocol(String),
}

/// Read child messages until EOF, cancellation, or a framing error, invoking
/// `route` for each parsed message.
pub(crate) async fn pump<F, Fut>(
    reader: &mut BoxedReader,
    cancel: &CancellationToken,
    mut route: F,
) -> PumpEnd
where
    F: FnMut(ProcessMessage) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut line = String::new();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return PumpEnd::Closed,
            next = read_json_line(reader, &mut line) => next,
        };

        match next {
            Ok(Some(frame)) => match ProcessMessage::parse(&frame) {
                Ok(message) => route(message).await,
                Err(e) => return PumpEnd::Protocol(e.to_string()),
            },
            Ok(None) => return PumpEnd::Closed,
            Err(e) => {
                warn!(error = %e, "child connection read failed");
                return PumpEnd::Closed;
            }
        }
    }
}
