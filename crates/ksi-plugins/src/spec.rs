//! Handler metadata.
//!
//! [`HandlerSpec`] is declared with a builder at registration time and is
//! the source of truth for `system:discover` / `system:help` output. The
//! original daemon introspected Python signatures; a typed builder keeps
//! the same discovery schema without runtime reflection.

use std::collections::BTreeMap;
use std::sync::Arc;

use ksi_events::EventHandler;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-ish parameter types surfaced by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// A JSON string.
    String,
    /// A JSON integer.
    Integer,
    /// A JSON number.
    Number,
    /// A JSON boolean.
    Boolean,
    /// A JSON object.
    Object,
    /// A JSON array.
    Array,
    /// Any JSON value.
    Any,
}

impl ParamType {
    /// The type name used in discovery output and MCP schemas.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

/// One declared handler parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    /// Parameter type.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Whether the parameter must be present.
    pub required: bool,
    /// Default applied when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Human-readable description.
    pub description: String,
}

impl Param {
    /// A new optional parameter of the given type.
    #[must_use]
    pub fn new(param_type: ParamType) -> Self {
        Self {
            param_type,
            required: false,
            default: None,
            description: String::new(),
        }
    }

    /// Mark the parameter required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the default value.
    #[must_use]
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Declared metadata for one event handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerSpec {
    /// Event name the handler answers.
    pub event: String,
    /// Handler function name shown by discovery.
    pub handler_name: String,
    /// One-line summary.
    pub summary: String,
    /// Dispatch priority; lower runs first.
    pub priority: i32,
    /// Whether the handler suspends (dispatched off the transport loop).
    pub is_async: bool,
    /// Declared parameters, keyed by name.
    pub parameters: BTreeMap<String, Param>,
    /// Events this handler may emit in turn.
    pub triggers: Vec<String>,
}

impl HandlerSpec {
    /// Create a spec for an event, deriving the handler name
    /// (`completion:async` → `handle_completion_async`).
    #[must_use]
    pub fn new(event: impl Into<String>) -> Self {
        let event = event.into();
        let handler_name = format!("handle_{}", event.replace(':', "_"));
        Self {
            event,
            handler_name,
            summary: String::new(),
            priority: 100,
            is_async: true,
            parameters: BTreeMap::new(),
            triggers: Vec::new(),
        }
    }

    /// Set the summary.
    #[must_use]
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Set the dispatch priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Declare a parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, param: Param) -> Self {
        self.parameters.insert(name.into(), param);
        self
    }

    /// Declare an event this handler may emit.
    #[must_use]
    pub fn triggers(mut self, event: impl Into<String>) -> Self {
        self.triggers.push(event.into());
        self
    }

    /// Render the MCP tool-schema shape used by the MCP bridge.
    #[must_use]
    pub fn to_mcp_tool(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (name, param) in &self.parameters {
            let mut prop = serde_json::Map::new();
            prop.insert(
                "type".to_string(),
                Value::String(param.param_type.as_str().to_string()),
            );
            if !param.description.is_empty() {
                prop.insert(
                    "description".to_string(),
                    Value::String(param.description.clone()),
                );
            }
            if let Some(default) = &param.default {
                prop.insert("default".to_string(), default.clone());
            }
            properties.insert(name.clone(), Value::Object(prop));
            if param.required {
                required.push(Value::String(name.clone()));
            }
        }
        serde_json::json!({
            "name": self.event.replace(':', "_"),
            "description": self.summary,
            "inputSchema": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        })
    }
}

/// A spec paired with its handler, as returned by
/// [`KsiPlugin::handlers`](crate::KsiPlugin::handlers).
pub struct HandlerRegistration {
    /// Declared metadata.
    pub spec: HandlerSpec,
    /// The handler itself.
    pub handler: Arc<dyn EventHandler>,
}

impl HandlerRegistration {
    /// Pair a spec with its handler.
    #[must_use]
    pub fn new(spec: HandlerSpec, handler: Arc<dyn EventHandler>) -> Self {
        Self { spec, handler }
    }
}
