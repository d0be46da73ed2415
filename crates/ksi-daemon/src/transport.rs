//! Unix-socket transport: line-delimited JSON framing.
//!
//! Per connection there are three tasks:
//!
//! - the **read loop** peels off lines, parses envelopes, and hands them
//!   to the request worker — it never awaits handler work (I4);
//! - the **request worker** dispatches one request at a time through the
//!   router with `expect_response`, preserving receive order;
//! - the **writer** serializes responses (and pushed events) one line
//!   each, in the order they were queued.
//!
//! Parse errors produce `INVALID_JSON` / `INVALID_EVENT` envelopes
//! without closing the connection. On disconnect, all subscriptions
//! owned by the connection are torn down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use ksi_core::{ErrorCode, ErrorEnvelope};
use ksi_events::{EmitOptions, EventRouter, handler_fn};
use ksi_plugins::{HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DaemonError, DaemonResult};

type ConnectionMap = Arc<DashMap<String, mpsc::UnboundedSender<Value>>>;

/// The Unix-socket listener and its connections.
pub struct UnixSocketTransport {
    path: PathBuf,
    router: EventRouter,
    connections: ConnectionMap,
    conn_counter: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for UnixSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixSocketTransport")
            .field("path", &self.path)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl UnixSocketTransport {
    /// Create a transport for the given socket path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, router: EventRouter) -> Self {
        Self {
            path: path.into(),
            router,
            connections: Arc::new(DashMap::new()),
            conn_counter: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// The socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Bind the socket and start accepting connections.
    ///
    /// A stale socket file is removed first.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Bind`] when the socket cannot be bound —
    /// fatal for the daemon.
    pub fn start(self: &Arc<Self>) -> DaemonResult<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            debug!(path = %self.path.display(), "removed stale socket");
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.path).map_err(|source| DaemonError::Bind {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), "listening on Unix socket");

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = transport.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => {
                            let id = transport.conn_counter.fetch_add(1, Ordering::Relaxed);
                            let conn_id = format!("conn_{id}");
                            let transport = Arc::clone(&transport);
                            tokio::spawn(async move {
                                transport.handle_connection(conn_id, stream).await;
                            });
                        },
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    },
                }
            }
            debug!("accept loop exiting");
        });
        Ok(())
    }

    /// Stop accepting, close the socket, and drop all connections.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.connections.clear();
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(error = %e, "failed to remove socket file");
            }
        }
        info!("unix socket transport stopped");
    }

    /// Push an event object to one connection.
    pub fn send_to(&self, connection_id: &str, event: Value) -> bool {
        match self.connections.get(connection_id) {
            Some(sender) => sender.send(event).is_ok(),
            None => {
                warn!(connection_id, "connection not found");
                false
            },
        }
    }

    /// Push an event object to every connection.
    pub fn broadcast(&self, event: &Value) -> usize {
        let mut delivered = 0usize;
        for entry in self.connections.iter() {
            if entry.value().send(event.clone()).is_ok() {
                delivered = delivered.saturating_add(1);
            }
        }
        delivered
    }

    async fn handle_connection(self: Arc<Self>, conn_id: String, stream: UnixStream) {
        let source = format!("unix:{conn_id}");
        let (read_half, mut write_half) = stream.into_split();

        // Writer: serializes everything sent to this connection.
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Value>();
        let writer_conn = conn_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(value) = write_rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&value) else {
                    error!(conn = %writer_conn, "response serialization failed");
                    continue;
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        self.connections.insert(conn_id.clone(), write_tx.clone());
        debug!(conn = %conn_id, "connection opened");
        let _ = self
            .router
            .emit(
                "transport:connection",
                json!({
                    "transport_type": "unix",
                    "connection_id": conn_id,
                    "action": "connect",
                }),
                EmitOptions::new().source(&*source),
            )
            .await;

        // Request worker: strict receive-order processing, one at a
        // time, off the read loop.
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Value>();
        let worker_router = self.router.clone();
        let worker_source = source.clone();
        let worker_write = write_tx.clone();
        let worker = tokio::spawn(async move {
            while let Some(envelope) = request_rx.recv().await {
                let response =
                    dispatch_request(&worker_router, &worker_source, &envelope).await;
                if worker_write.send(response).is_err() {
                    break;
                }
            }
        });

        // Read loop: parse and queue only.
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = tokio::select! {
                () = self.shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(envelope) => {
                            if request_tx.send(envelope).is_err() {
                                break;
                            }
                        },
                        Err(e) => {
                            let _ = write_tx.send(
                                ErrorEnvelope::new(ErrorCode::InvalidJson, e.to_string())
                                    .to_value(),
                            );
                        },
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(conn = %conn_id, error = %e, "connection read error");
                    break;
                },
            }
        }

        // Teardown: connection-owned subscriptions die with it.
        self.connections.remove(&conn_id);
        let removed = self.router.unsubscribe_owner(&source);
        if removed > 0 {
            debug!(conn = %conn_id, removed, "dropped connection subscriptions");
        }
        let _ = self
            .router
            .emit(
                "transport:connection",
                json!({
                    "transport_type": "unix",
                    "connection_id": conn_id,
                    "action": "disconnect",
                }),
                EmitOptions::new().source(&*source),
            )
            .await;
        worker.abort();
        writer.abort();
        debug!(conn = %conn_id, "connection closed");
    }
}

/// Dispatch one parsed request envelope and shape the response line.
async fn dispatch_request(router: &EventRouter, source: &str, envelope: &Value) -> Value {
    let correlation_id = envelope
        .get("correlation_id")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let Some(event_name) = envelope.get("event").and_then(Value::as_str) else {
        return ErrorEnvelope::new(ErrorCode::InvalidEvent, "Missing event name")
            .with_correlation_id(correlation_id)
            .to_value();
    };
    if event_name.is_empty() {
        return ErrorEnvelope::new(ErrorCode::InvalidEvent, "Missing event name")
            .with_correlation_id(correlation_id)
            .to_value();
    }
    let data = envelope
        .get("data")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let result = router
        .emit(
            event_name,
            data,
            EmitOptions::new()
                .source(source)
                .correlation_id(correlation_id.clone())
                .expect_response(),
        )
        .await;

    let mut response = result.unwrap_or_else(|| {
        ErrorEnvelope::new(ErrorCode::InternalError, "no response produced").to_value()
    });
    if let (Some(correlation_id), Some(object)) = (correlation_id, response.as_object_mut()) {
        object.insert("correlation_id".to_string(), json!(correlation_id));
    }
    response
}

/// Plugin exposing transport control events. Not reloadable: the socket
/// outlives plugin reloads.
pub struct UnixSocketPlugin {
    transport: Arc<UnixSocketTransport>,
}

impl UnixSocketPlugin {
    /// Create the plugin around a running transport.
    #[must_use]
    pub fn new(transport: Arc<UnixSocketTransport>) -> Self {
        Self { transport }
    }
}

impl KsiPlugin for UnixSocketPlugin {
    fn name(&self) -> &str {
        "unix_socket_transport"
    }

    fn summary(&self) -> &str {
        "Unix domain socket transport"
    }

    fn reloadable(&self) -> bool {
        false
    }

    fn handlers(&self) -> Vec<HandlerRegistration> {
        let transport = Arc::clone(&self.transport);
        let status_handler = handler_fn(move |_, _, _| {
            let transport = Arc::clone(&transport);
            async move {
                Ok(Some(json!({
                    "status": "connected",
                    "socket": transport.path().display().to_string(),
                    "connections": transport.connection_count(),
                })))
            }
        });

        let transport = Arc::clone(&self.transport);
        let send_handler = handler_fn(move |_, data, _| {
            let transport = Arc::clone(&transport);
            async move {
                let Some(connection_id) = data.get("connection_id").and_then(Value::as_str)
                else {
                    return Ok(Some(
                        ErrorEnvelope::new(
                            ErrorCode::Validation,
                            "missing required field: connection_id",
                        )
                        .to_value(),
                    ));
                };
                let Some(event) = data.get("event") else {
                    return Ok(Some(
                        ErrorEnvelope::new(
                            ErrorCode::Validation,
                            "missing required field: event",
                        )
                        .to_value(),
                    ));
                };
                let sent = transport.send_to(connection_id, event.clone());
                Ok(Some(json!({"status": if sent { "sent" } else { "not_found" }})))
            }
        });

        let transport = Arc::clone(&self.transport);
        let broadcast_handler = handler_fn(move |_, data, _| {
            let transport = Arc::clone(&transport);
            async move {
                let Some(event) = data.get("event") else {
                    return Ok(Some(
                        ErrorEnvelope::new(
                            ErrorCode::Validation,
                            "missing required field: event",
                        )
                        .to_value(),
                    ));
                };
                let delivered = transport.broadcast(event);
                Ok(Some(json!({"status": "broadcast", "delivered": delivered})))
            }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("transport:status").summary("Transport status"),
                status_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("transport:send")
                    .summary("Push an event to one connection")
                    .param("connection_id", Param::new(ParamType::String).required())
                    .param("event", Param::new(ParamType::Object).required()),
                send_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("transport:broadcast")
                    .summary("Push an event to all connections")
                    .param("event", Param::new(ParamType::Object).required()),
                broadcast_handler,
            ),
        ]
    }
}
