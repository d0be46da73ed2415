//! Minimal name-addressed composition library.
//!
//! The full YAML composition library is an external collaborator; this
//! built-in library implements the `composition:profile` /
//! `composition:get` contract the agent service depends on — permission
//! level, allowed events, and an initial prompt template with `{{var}}`
//! substitution — and seeds a base profile so agents can spawn out of
//! the box.

use std::sync::Arc;

use dashmap::DashMap;
use ksi_core::{ErrorCode, ErrorEnvelope};
use ksi_events::handler_fn;
use ksi_plugins::{HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A named agent profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name.
    pub name: String,
    /// Permission level granted to agents spawned from this profile.
    pub permission_level: String,
    /// Event patterns the agent is allowed to emit.
    pub allowed_events: Vec<String>,
    /// Initial prompt template with `{{var}}` placeholders.
    pub prompt_template: String,
}

/// Substitute `{{var}}` placeholders from a JSON object of variables.
fn substitute(template: &str, variables: &Value) -> String {
    let mut resolved = template.to_string();
    if let Some(map) = variables.as_object() {
        for (key, value) in map {
            let placeholder = format!("{{{{{key}}}}}");
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            resolved = resolved.replace(&placeholder, &replacement);
        }
    }
    resolved
}

/// In-memory profile library.
#[derive(Debug, Default)]
pub struct CompositionLibrary {
    profiles: DashMap<String, Profile>,
}

impl CompositionLibrary {
    /// Create a library seeded with the base single-agent profile.
    #[must_use]
    pub fn with_defaults() -> Self {
        let library = Self::default();
        library.insert(Profile {
            name: "base_single_agent".to_string(),
            permission_level: "standard".to_string(),
            allowed_events: vec![
                "state:*".to_string(),
                "message:*".to_string(),
                "completion:async".to_string(),
                "agent:send_message".to_string(),
            ],
            prompt_template: "You are an autonomous agent. {{instructions}}".to_string(),
        });
        library
    }

    /// Insert or replace a profile.
    pub fn insert(&self, profile: Profile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    /// Look up a profile by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Profile> {
        self.profiles.get(name).map(|p| p.value().clone())
    }

    /// Resolve a profile with variables applied to its prompt template.
    #[must_use]
    pub fn resolve(&self, name: &str, variables: &Value) -> Option<(Profile, String)> {
        let profile = self.get(name)?;
        let resolved_prompt = substitute(&profile.prompt_template, variables);
        Some((profile, resolved_prompt))
    }
}

/// Plugin exposing `composition:*` lookups.
pub struct CompositionPlugin {
    library: Arc<CompositionLibrary>,
}

impl CompositionPlugin {
    /// Create the plugin around a library.
    #[must_use]
    pub fn new(library: Arc<CompositionLibrary>) -> Self {
        Self { library }
    }
}

impl KsiPlugin for CompositionPlugin {
    fn name(&self) -> &str {
        "composition_service"
    }

    fn summary(&self) -> &str {
        "Name-addressed agent profiles"
    }

    fn handlers(&self) -> Vec<HandlerRegistration> {
        let library = Arc::clone(&self.library);
        let profile_handler = handler_fn(move |_, data, _| {
            let library = Arc::clone(&library);
            async move {
                let Some(name) = data.get("name").and_then(Value::as_str) else {
                    return Ok(Some(
                        ErrorEnvelope::new(ErrorCode::Validation, "missing required field: name")
                            .to_value(),
                    ));
                };
                let variables = data.get("variables").cloned().unwrap_or(json!({}));
                match library.resolve(name, &variables) {
                    Some((profile, resolved_prompt)) => Ok(Some(json!({
                        "composition": profile,
                        "resolved_prompt": resolved_prompt,
                    }))),
                    None => Ok(Some(
                        ErrorEnvelope::new(
                            ErrorCode::NotFound,
                            format!("unknown composition: {name}"),
                        )
                        .to_value(),
                    )),
                }
            }
        });

        let library = Arc::clone(&self.library);
        let get_handler = handler_fn(move |_, data, _| {
            let library = Arc::clone(&library);
            async move {
                let Some(name) = data.get("name").and_then(Value::as_str) else {
                    return Ok(Some(
                        ErrorEnvelope::new(ErrorCode::Validation, "missing required field: name")
                            .to_value(),
                    ));
                };
                match library.get(name) {
                    Some(profile) => Ok(Some(json!({"composition": profile}))),
                    None => Ok(Some(
                        ErrorEnvelope::new(
                            ErrorCode::NotFound,
                            format!("unknown composition: {name}"),
                        )
                        .to_value(),
                    )),
                }
            }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("composition:profile")
                    .summary("Resolve a profile with variable substitution")
                    .param("name", Param::new(ParamType::String).required())
                    .param("variables", Param::new(ParamType::Object)),
                profile_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("composition:get")
                    .summary("Fetch a raw profile")
                    .param("name", Param::new(ParamType::String).required()),
                get_handler,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute() {
        let result = substitute(
            "You are {{name}}, count {{n}}.",
            &json!({"name": "worker", "n": 3}),
        );
        assert_eq!(result, "You are worker, count 3.");
    }

    #[test]
    fn test_resolve_default_profile() {
        let library = CompositionLibrary::with_defaults();
        let (profile, prompt) = library
            .resolve("base_single_agent", &json!({"instructions": "Count to ten."}))
            .unwrap();
        assert_eq!(profile.permission_level, "standard");
        assert!(prompt.ends_with("Count to ten."));
    }

    #[test]
    fn test_unknown_profile() {
        let library = CompositionLibrary::with_defaults();
        assert!(library.resolve("nope", &json!({})).is_none());
    }
}
