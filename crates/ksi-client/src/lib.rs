//! KSI Client - Async client for the daemon's line-delimited JSON
//! socket.
//!
//! Used by chat frontends, orchestration scripts, and the integration
//! tests. One socket, one JSON object per line; every request carries a
//! generated correlation id and [`KsiClient::request`] waits for the
//! matching response. Pushed events (from `message:subscribe` or
//! broadcasts) are buffered and read with [`KsiClient::next_event`].
//!
//! # Example
//!
//! ```rust,no_run
//! use ksi_client::KsiClient;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), ksi_client::ClientError> {
//! let mut client = KsiClient::connect("/tmp/ksi/daemon.sock").await?;
//! let health = client.request("system:health", json!({})).await?;
//! assert_eq!(health["status"], "healthy");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use ksi_core::EventEnvelope;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::trace;
use uuid::Uuid;

/// Default response timeout, slightly above the daemon's correlation
/// timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(35);

/// Errors raised by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The daemon closed the connection.
    #[error("connection closed")]
    Closed,

    /// No response arrived inside the client timeout.
    #[error("timed out waiting for response")]
    Timeout,

    /// The daemon sent a line that is not valid JSON.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// A connection to the daemon socket.
pub struct KsiClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    timeout: Duration,
    pushed: VecDeque<Value>,
}

impl std::fmt::Debug for KsiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KsiClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KsiClient {
    /// Connect to the daemon socket.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the socket is not listening.
    pub async fn connect(path: impl AsRef<Path>) -> ClientResult<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer,
            timeout: DEFAULT_TIMEOUT,
            pushed: VecDeque::new(),
        })
    }

    /// Override the response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Write one raw line (for protocol-level tests).
    ///
    /// # Errors
    ///
    /// Returns an IO error if the write fails.
    pub async fn send_raw(&mut self, line: &str) -> ClientResult<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn read_line(&mut self) -> ClientResult<Value> {
        match self.lines.next_line().await? {
            Some(line) => {
                trace!(line = %line, "received");
                serde_json::from_str(&line).map_err(|e| ClientError::Protocol(e.to_string()))
            },
            None => Err(ClientError::Closed),
        }
    }

    /// Send an event and wait for its correlated response.
    ///
    /// Non-matching lines received while waiting are buffered as pushed
    /// events.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when no response arrives in
    /// time, [`ClientError::Closed`] on disconnect.
    pub async fn request(&mut self, event: &str, data: Value) -> ClientResult<Value> {
        let correlation_id = Uuid::new_v4().to_string();
        let envelope = EventEnvelope::new(event)
            .with_data(data)
            .with_correlation_id(correlation_id.clone());
        let mut line = serde_json::to_string(&envelope)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout);
            }
            let value = tokio::time::timeout(remaining, self.read_line())
                .await
                .map_err(|_| ClientError::Timeout)??;
            if value.get("correlation_id").and_then(Value::as_str)
                == Some(correlation_id.as_str())
            {
                return Ok(value);
            }
            self.pushed.push_back(value);
        }
    }

    /// Next pushed (non-response) line: from the buffer, or read from
    /// the socket.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when nothing arrives in time.
    pub async fn next_event(&mut self, timeout: Duration) -> ClientResult<Value> {
        if let Some(value) = self.pushed.pop_front() {
            return Ok(value);
        }
        tokio::time::timeout(timeout, self.read_line())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Convenience wrapper for `system:health`.
    ///
    /// # Errors
    ///
    /// Propagates [`KsiClient::request`] errors.
    pub async fn health(&mut self) -> ClientResult<Value> {
        self.request("system:health", json!({})).await
    }

    /// Convenience wrapper for `completion:async`.
    ///
    /// # Errors
    ///
    /// Propagates [`KsiClient::request`] errors.
    pub async fn completion_async(
        &mut self,
        prompt: &str,
        model: &str,
        session_id: Option<&str>,
    ) -> ClientResult<Value> {
        let mut data = json!({"prompt": prompt, "model": model});
        if let Some(session) = session_id {
            data["session_id"] = json!(session);
        }
        self.request("completion:async", data).await
    }
}
