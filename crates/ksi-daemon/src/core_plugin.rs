//! Core daemon events: health and shutdown.

use std::time::Instant;

use ksi_events::{EventRouter, handler_fn};
use ksi_plugins::{HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::info;

/// Render an uptime as `1d 2h 3m 4s`.
fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{secs}s"));
    parts.join(" ")
}

/// Plugin answering `system:health` and `system:shutdown`.
pub struct CorePlugin {
    started_at: Instant,
    router: EventRouter,
    shutdown_tx: broadcast::Sender<()>,
}

impl CorePlugin {
    /// Create the plugin; uptime is measured from this call.
    #[must_use]
    pub fn new(router: EventRouter, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            started_at: Instant::now(),
            router,
            shutdown_tx,
        }
    }
}

impl KsiPlugin for CorePlugin {
    fn name(&self) -> &str {
        "core"
    }

    fn summary(&self) -> &str {
        "Daemon health and lifecycle"
    }

    fn reloadable(&self) -> bool {
        false
    }

    fn handlers(&self) -> Vec<HandlerRegistration> {
        let started_at = self.started_at;
        let router = self.router.clone();
        let health_handler = handler_fn(move |_, data, _| {
            let router = router.clone();
            async move {
                let uptime = started_at.elapsed();
                let mut response = json!({
                    "status": "healthy",
                    "uptime": uptime.as_secs_f64(),
                    "uptime_human": format_uptime(uptime.as_secs()),
                    "daemon": {
                        "type": "plugin-based",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                });
                if data
                    .get("include_stats")
                    .and_then(Value::as_bool)
                    .unwrap_or(true)
                {
                    response["stats"] = serde_json::to_value(router.stats())
                        .unwrap_or_else(|_| json!({}));
                }
                Ok(Some(response))
            }
        });

        let shutdown_tx = self.shutdown_tx.clone();
        let shutdown_handler = handler_fn(move |_, _, _| {
            let shutdown_tx = shutdown_tx.clone();
            async move {
                info!("shutdown requested over the bus");
                let _ = shutdown_tx.send(());
                Ok(Some(json!({"status": "shutting_down"})))
            }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("system:health")
                    .summary("Daemon status, uptime, and bus statistics")
                    .param(
                        "include_stats",
                        Param::new(ParamType::Boolean).default_value(json!(true)),
                    ),
                health_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("system:shutdown").summary("Gracefully stop the daemon"),
                shutdown_handler,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(4), "4s");
        assert_eq!(format_uptime(64), "1m 4s");
        assert_eq!(format_uptime(3_664), "1h 1m 4s");
        assert_eq!(format_uptime(90_061), "1d 1h 1m 1s");
    }
}
