//! Event payload validators.

use std::sync::Arc;

use serde_json::Value;

/// A validator registered for an event name.
///
/// Returns `Err(message)` to reject the payload; the router records the
/// failure and returns a `VALIDATION` error result to the emitter.
pub type SchemaValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Build a validator that requires the named fields to be present and
/// non-null on the payload object.
#[must_use]
pub fn require_fields(fields: &[&str]) -> SchemaValidator {
    let fields: Vec<String> = fields.iter().map(|s| (*s).to_string()).collect();
    Arc::new(move |data: &Value| {
        let Some(object) = data.as_object() else {
            return Err("payload must be an object".to_string());
        };
        for field in &fields {
            match object.get(field) {
                Some(value) if !value.is_null() => {},
                _ => return Err(format!("missing required field: {field}")),
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_fields_accepts() {
        let validator = require_fields(&["prompt"]);
        assert!(validator(&json!({"prompt": "hi", "model": "test"})).is_ok());
    }

    #[test]
    fn test_require_fields_rejects_missing() {
        let validator = require_fields(&["prompt"]);
        let err = validator(&json!({"model": "test"})).unwrap_err();
        assert!(err.contains("prompt"));
    }

    #[test]
    fn test_require_fields_rejects_null_and_non_object() {
        let validator = require_fields(&["prompt"]);
        assert!(validator(&json!({"prompt": null})).is_err());
        assert!(validator(&json!(["not", "an", "object"])).is_err());
    }
}
