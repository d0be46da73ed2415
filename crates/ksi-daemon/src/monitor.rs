//! Monitoring events over the bus ring history.

use chrono::DateTime;
use ksi_events::{EventRouter, handler_fn};
use ksi_plugins::{HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType};
use serde_json::{Value, json};

/// Plugin exposing `monitor:get_events` and `monitor:get_stats` —
/// the polling surface TUIs and tests use.
pub struct MonitorPlugin {
    router: EventRouter,
}

impl MonitorPlugin {
    /// Create the plugin over a router.
    #[must_use]
    pub fn new(router: EventRouter) -> Self {
        Self { router }
    }
}

impl KsiPlugin for MonitorPlugin {
    fn name(&self) -> &str {
        "monitor"
    }

    fn summary(&self) -> &str {
        "Query the bus event history and statistics"
    }

    fn handlers(&self) -> Vec<HandlerRegistration> {
        let router = self.router.clone();
        let events_handler = handler_fn(move |_, data, _| {
            let router = router.clone();
            async move {
                let patterns: Option<Vec<String>> = data
                    .get("event_patterns")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(ToString::to_string)
                            .collect()
                    });
                let limit = data
                    .get("limit")
                    .and_then(Value::as_u64)
                    .and_then(|l| usize::try_from(l).ok())
                    .unwrap_or(100);
                let since = data
                    .get("since")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&chrono::Utc));

                let mut records = router.recent(patterns.as_deref(), usize::MAX);
                if let Some(since) = since {
                    records.retain(|r| r.timestamp > since);
                }
                if records.len() > limit {
                    let skip = records.len().saturating_sub(limit);
                    records.drain(..skip);
                }
                Ok(Some(json!({"count": records.len(), "events": records})))
            }
        });

        let router = self.router.clone();
        let stats_handler = handler_fn(move |_, _, _| {
            let router = router.clone();
            async move {
                Ok(Some(
                    serde_json::to_value(router.stats()).unwrap_or_else(|_| json!({})),
                ))
            }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("monitor:get_events")
                    .summary("Query the bounded event history")
                    .param("event_patterns", Param::new(ParamType::Array))
                    .param("limit", Param::new(ParamType::Integer).default_value(json!(100)))
                    .param("since", Param::new(ParamType::String)),
                events_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("monitor:get_stats").summary("Bus statistics snapshot"),
                stats_handler,
            ),
        ]
    }
}
