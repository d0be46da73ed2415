//! Event records for history and replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record of a dispatched event, kept in the bounded ring history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event id (UUID v4).
    pub id: String,
    /// Namespaced event name.
    pub event_name: String,
    /// Source component (`"unix"`, plugin name, ...).
    pub source: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Correlation id, when the emit carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Id of the event that caused this one, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Event payload as emitted.
    pub data: Value,
    /// The first non-nil handler result, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description when dispatch or validation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Names of handlers and subscribers invoked, in call order.
    pub handlers_called: Vec<String>,
}

impl EventRecord {
    /// Create a record for a freshly emitted event.
    #[must_use]
    pub fn new(
        id: String,
        event_name: impl Into<String>,
        source: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id,
            event_name: event_name.into(),
            source: source.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            parent_id: None,
            data,
            result: None,
            error: None,
            handlers_called: Vec::new(),
        }
    }

    /// The agent this event originated from, when tagged.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.data.get("_agent_id").and_then(Value::as_str)
    }
}
