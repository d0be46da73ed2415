//! Wire envelopes.
//!
//! Requests arrive as one JSON object per line:
//!
//! ```json
//! {"event": "completion:async", "data": {"prompt": "..."}, "correlation_id": "..."}
//! ```
//!
//! Responses are either the handler's object (augmented with the
//! `correlation_id`) or an [`ErrorEnvelope`]. Exactly one response is
//! written per request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// Inbound request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Namespaced event name (`ns:action`).
    pub event: String,
    /// Event payload. Defaults to an empty object.
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Optional correlation id binding the request to its response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl EventEnvelope {
    /// Create an envelope with an empty payload.
    #[must_use]
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: empty_object(),
            correlation_id: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// The `error` body of an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Taxonomy code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Name of the failing handler, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

/// Outbound error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// The error body.
    pub error: ErrorBody,
    /// Correlation id echoed from the request, if it had one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ErrorEnvelope {
    /// Build an error envelope.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                handler: None,
            },
            correlation_id: None,
        }
    }

    /// Name the failing handler.
    #[must_use]
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.error.handler = Some(handler.into());
        self
    }

    /// Echo the request's correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    /// Serialize to a JSON value.
    ///
    /// Infallible in practice; falls back to a minimal object if the
    /// serializer ever rejects the envelope.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({"error": {"code": "INTERNAL_ERROR", "message": "serialization failed"}})
        })
    }
}

/// Check whether a response value is an error envelope.
#[must_use]
pub fn is_error_response(value: &Value) -> bool {
    value.get("error").is_some_and(Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_default_data() {
        let env: EventEnvelope = serde_json::from_str(r#"{"event":"system:health"}"#).unwrap();
        assert_eq!(env.event, "system:health");
        assert!(env.data.is_object());
        assert!(env.correlation_id.is_none());
    }

    #[test]
    fn test_error_envelope_shape() {
        let env = ErrorEnvelope::new(ErrorCode::Timeout, "Response timeout")
            .with_correlation_id(Some("abc".to_string()));
        let value = env.to_value();
        assert_eq!(value["error"]["code"], "TIMEOUT");
        assert_eq!(value["error"]["message"], "Response timeout");
        assert_eq!(value["correlation_id"], "abc");
    }

    #[test]
    fn test_handler_field_omitted_when_absent() {
        let value = ErrorEnvelope::new(ErrorCode::Validation, "bad").to_value();
        assert!(value["error"].get("handler").is_none());
        assert!(value.get("correlation_id").is_none());
    }

    #[test]
    fn test_is_error_response() {
        assert!(is_error_response(
            &ErrorEnvelope::new(ErrorCode::NotFound, "nope").to_value()
        ));
        assert!(!is_error_response(&serde_json::json!({"status": "ok"})));
        assert!(!is_error_response(&serde_json::json!({"error": "string"})));
    }
}
