//! Completion request types.

use chrono::{DateTime, Utc};
use ksi_core::{AgentId, RequestId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration attached to a request that triggers queuing of a
/// system reminder into other sessions when the response arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionConfig {
    /// Whether result injection is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Injection mode (`"next"`, `"system_reminder"`, ...).
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Sessions that receive the reminder.
    #[serde(default)]
    pub target_sessions: Vec<String>,
    /// Optional TTL in seconds for the queued reminders.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    /// Free-form metadata carried along with the reminder.
    #[serde(default)]
    pub metadata: Option<Value>,
}

fn default_mode() -> String {
    "next".to_string()
}

/// A queued completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Request id (`comp_<hex>`).
    pub request_id: RequestId,
    /// Prompt text for this turn.
    pub prompt: String,
    /// Model name passed to the provider.
    pub model: String,
    /// Session to continue; absent on the first turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Agent this request belongs to, when agent-originated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Construct id for grouped agent populations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub construct_id: Option<String>,
    /// Result-injection configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injection_config: Option<InjectionConfig>,
    /// When the request was accepted.
    pub created_at: DateTime<Utc>,
}

impl CompletionRequest {
    /// Build a request from an event payload.
    ///
    /// `request_id` is taken from the payload when present, otherwise
    /// generated; `model` falls back to `default_model`.
    ///
    /// # Errors
    ///
    /// Returns a message if `prompt` is missing or not a string.
    pub fn from_data(data: &Value, default_model: &str) -> Result<Self, String> {
        let prompt = data
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing required field: prompt".to_string())?;
        let request_id = data
            .get("request_id")
            .and_then(Value::as_str)
            .map_or_else(RequestId::generate, RequestId::from);
        let model = data
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(default_model);
        let session_id = data
            .get("session_id")
            .and_then(Value::as_str)
            .map(SessionId::from);
        let agent_id = data
            .get("agent_id")
            .and_then(Value::as_str)
            .map(AgentId::from);
        let construct_id = data
            .get("construct_id")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let injection_config = data
            .get("injection_config")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| format!("invalid injection_config: {e}"))?;

        Ok(Self {
            request_id,
            prompt: prompt.to_string(),
            model: model.to_string(),
            session_id,
            agent_id,
            construct_id,
            injection_config,
            created_at: Utc::now(),
        })
    }

    /// The conversation-queue key for this request: the session id, or a
    /// synthetic `new:<request_id>` identity until the first response
    /// mints a real one.
    #[must_use]
    pub fn queue_key(&self) -> String {
        match &self.session_id {
            Some(session) => session.0.clone(),
            None => format!("new:{}", self.request_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_data_minimal() {
        let request =
            CompletionRequest::from_data(&json!({"prompt": "hi"}), "sonnet").unwrap();
        assert_eq!(request.prompt, "hi");
        assert_eq!(request.model, "sonnet");
        assert!(request.session_id.is_none());
        assert!(request.queue_key().starts_with("new:comp_"));
    }

    #[test]
    fn test_from_data_full() {
        let request = CompletionRequest::from_data(
            &json!({
                "prompt": "hi",
                "model": "test",
                "session_id": "s1",
                "agent_id": "agent_ab",
                "request_id": "comp_fixed",
                "injection_config": {"enabled": true, "target_sessions": ["s2"]},
            }),
            "sonnet",
        )
        .unwrap();
        assert_eq!(request.model, "test");
        assert_eq!(request.queue_key(), "s1");
        assert_eq!(request.request_id.as_str(), "comp_fixed");
        let config = request.injection_config.unwrap();
        assert!(config.enabled);
        assert_eq!(config.mode, "next");
        assert_eq!(config.target_sessions, vec!["s2".to_string()]);
    }

    #[test]
    fn test_from_data_missing_prompt() {
        let err = CompletionRequest::from_data(&json!({"model": "x"}), "sonnet").unwrap_err();
        assert!(err.contains("prompt"));
    }
}
