// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child-side IPC channel.
//!
//! A managed child binds its endpoint (named by `DONKEYLABS_SOCKET_PATH` or
//! `DONKEYLABS_TCP_PORT`), waits for the supervisor to connect, and then
//! streams line-delimited JSON messages. Binding on the child side is what
//! lets a restarted supervisor reconnect to a still-running child.

use crate::socket::Endpoint;
use crate::{ENV_METADATA, ENV_PROCESS_ID, ENV_SOCKET_PATH, ENV_TCP_PORT};
use dk_core::{ProcessMessage, ProcessStats};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Mutex;

/// Errors from the child channel.
#[derive(Debug, Error)]
pub enum ChildError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid {0}: {1}")]
    InvalidEnv(&'static str, String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("supervisor connection closed")]
    Disconnected,
}

enum Transport {
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

/// The child half of the supervisor IPC contract.
pub struct ChildChannel {
    process_id: String,
    metadata: Value,
    reader: Mutex<Box<dyn tokio::io::AsyncBufRead + Send + Unpin>>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ChildChannel {
    /// Read the env contract, bind the endpoint, and wait for the supervisor
    /// to connect.
    pub async fn from_env() -> Result<Self, ChildError> {
        let process_id =
            std::env::var(ENV_PROCESS_ID).map_err(|_| ChildError::MissingEnv(ENV_PROCESS_ID))?;
        let metadata = match std::env::var(ENV_METADATA) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| ChildError::InvalidEnv(ENV_METADATA, e.to_string()))?,
            Err(_) => Value::Null,
        };

        let endpoint = if let Ok(path) = std::env::var(ENV_SOCKET_PATH) {
            Endpoint::Unix(path.into())
        } else if let Ok(port) = std::env::var(ENV_TCP_PORT) {
            let port = port
                .parse()
                .map_err(|_| ChildError::InvalidEnv(ENV_TCP_PORT, port.clone()))?;
            Endpoint::Tcp(port)
        } else {
            return Err(ChildError::MissingEnv(ENV_SOCKET_PATH));
        };

        Self::bind(process_id, metadata, &endpoint).await
    }

    /// Bind the endpoint and accept one supervisor connection.
    pub async fn bind(
        process_id: String,
        metadata: Value,
        endpoint: &Endpoint,
    ) -> Result<Self, ChildError> {
        let transport = match endpoint {
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                let (stream, _) = listener.accept().await?;
                Transport::Unix(stream)
            }
            Endpoint::Tcp(port) => {
                let listener = TcpListener::bind(("127.0.0.1", *port)).await?;
                let (stream, _) = listener.accept().await?;
                Transport::Tcp(stream)
            }
        };

        let (reader, writer): (
            Box<dyn tokio::io::AsyncBufRead + Send + Unpin>,
            Box<dyn AsyncWrite + Send + Unpin>,
        ) = match transport {
            Transport::Unix(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(BufReader::new(r)), Box::new(w))
            }
            Transport::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(BufReader::new(r)), Box::new(w))
            }
        };

        Ok(Self {
            process_id,
            metadata,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Metadata JSON handed down by the supervisor.
    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    /// Send a liveness heartbeat.
    pub async fn heartbeat(&self) -> Result<(), ChildError> {
        self.send(ProcessMessage::Heartbeat {
            process_id: self.process_id.clone(),
        })
        .await
    }

    /// Report resource usage.
    pub async fn stats(&self, stats: ProcessStats) -> Result<(), ChildError> {
        self.send(ProcessMessage::Stats {
            process_id: self.process_id.clone(),
            stats,
        })
        .await
    }

    /// Publish a user event.
    pub async fn event(&self, event: impl Into<String>, data: Value) -> Result<(), ChildError> {
        self.send(ProcessMessage::Event {
            process_id: self.process_id.clone(),
            event: event.into(),
            data,
        })
        .await
    }

    /// Send an arbitrary typed message.
    pub async fn message(
        &self,
        msg_type: impl Into<String>,
        payload: serde_json::Map<String, Value>,
    ) -> Result<(), ChildError> {
        self.send(ProcessMessage::Other {
            process_id: self.process_id.clone(),
            msg_type: msg_type.into(),
            payload,
        })
        .await
    }

    async fn send(&self, message: ProcessMessage) -> Result<(), ChildError> {
        let mut line = message.to_line()?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Receive the next supervisor → child message.
    pub async fn recv(&self) -> Result<Value, ChildError> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(ChildError::Disconnected);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(trimmed)?);
        }
    }
}

/// Read lines from any async reader as parsed JSON values.
pub(crate) async fn read_json_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    line: &mut String,
) -> Result<Option<String>, std::io::Error> {
    loop {
        line.clear();
        if reader.read_line(line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }
}
