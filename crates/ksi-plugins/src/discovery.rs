//! Live API discovery.
//!
//! The machine-readable schema returned by `system:discover` is a stable
//! contract: the doc generator and the MCP bridge consume exactly this
//! shape.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use ksi_core::{ErrorCode, ErrorEnvelope, namespace_of};
use ksi_events::handler_fn;
use serde_json::{Value, json};

use crate::error::RegistryError;
use crate::plugin::KsiPlugin;
use crate::registry::PluginRegistry;
use crate::spec::{HandlerRegistration, HandlerSpec, Param, ParamType};

/// Plugin exposing the discovery and module-browsing events.
///
/// Holds a weak reference to the registry: the registry owns the plugins,
/// so a strong reference here would be a cycle.
pub struct DiscoveryPlugin {
    registry: Weak<PluginRegistry>,
}

impl DiscoveryPlugin {
    /// Create a discovery plugin for a registry.
    #[must_use]
    pub fn new(registry: &Arc<PluginRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }
}

fn gone() -> Value {
    ErrorEnvelope::new(ErrorCode::InternalError, "registry unavailable").to_value()
}

fn discover(registry: &PluginRegistry, data: &Value) -> Value {
    let detail = data
        .get("detail")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let namespace_filter = data.get("namespace").and_then(Value::as_str);

    let mut events = serde_json::Map::new();
    let mut namespaces: BTreeSet<String> = BTreeSet::new();

    for info in registry.snapshot() {
        for spec in &info.specs {
            if let Some(ns) = namespace_of(&spec.event) {
                if namespace_filter.is_some_and(|filter| filter != ns) {
                    continue;
                }
                namespaces.insert(ns.to_string());
            } else if namespace_filter.is_some() {
                continue;
            }

            let mut entry = json!({
                "module": info.name,
                "handler": spec.handler_name,
                "summary": spec.summary,
                "async": spec.is_async,
            });
            if detail {
                entry["parameters"] =
                    serde_json::to_value(&spec.parameters).unwrap_or_else(|_| json!({}));
                entry["triggers"] = json!(spec.triggers);
            }
            events.insert(spec.event.clone(), entry);
        }
    }

    json!({
        "total": events.len(),
        "namespaces": namespaces.into_iter().collect::<Vec<_>>(),
        "events": events,
    })
}

fn help(registry: &PluginRegistry, data: &Value) -> Value {
    let Some(event) = data.get("event").and_then(Value::as_str) else {
        return ErrorEnvelope::new(ErrorCode::Validation, "missing 'event' parameter")
            .to_value();
    };
    let Some((module, spec)) = registry.find_spec(event) else {
        return ErrorEnvelope::new(ErrorCode::NotFound, format!("unknown event: {event}"))
            .to_value();
    };

    let format_style = data
        .get("format_style")
        .and_then(Value::as_str)
        .unwrap_or("human");
    if format_style == "mcp" {
        return spec.to_mcp_tool();
    }

    // Example invocation built from declared defaults.
    let mut example_data = serde_json::Map::new();
    for (name, param) in &spec.parameters {
        if let Some(default) = &param.default {
            example_data.insert(name.clone(), default.clone());
        } else if param.required {
            example_data.insert(name.clone(), json!(format!("<{}>", param.param_type.as_str())));
        }
    }

    json!({
        "event": spec.event,
        "module": module,
        "summary": spec.summary,
        "parameters": serde_json::to_value(&spec.parameters).unwrap_or_else(|_| json!({})),
        "triggers": spec.triggers,
        "examples": [{"event": spec.event, "data": example_data}],
    })
}

fn module_list(registry: &PluginRegistry) -> Value {
    let modules: Vec<Value> = registry
        .snapshot()
        .iter()
        .map(|info| {
            json!({
                "name": info.name,
                "version": info.version,
                "summary": info.summary,
                "reloadable": info.reloadable,
                "event_count": info.specs.len(),
            })
        })
        .collect();
    json!({"modules": modules})
}

fn module_list_events(registry: &PluginRegistry, data: &Value) -> Value {
    let Some(module_name) = data.get("module_name").and_then(Value::as_str) else {
        return ErrorEnvelope::new(ErrorCode::Validation, "missing 'module_name' parameter")
            .to_value();
    };
    let Some(info) = registry
        .snapshot()
        .into_iter()
        .find(|info| info.name == module_name)
    else {
        return ErrorEnvelope::new(
            ErrorCode::NotFound,
            format!("unknown module: {module_name}"),
        )
        .to_value();
    };
    let mut events: Vec<String> = info.specs.iter().map(|s| s.event.clone()).collect();
    events.sort();
    json!({"module": module_name, "events": events})
}

fn reload_error(e: &RegistryError) -> Value {
    let code = match e {
        RegistryError::NotFound(_) => ErrorCode::NotFound,
        _ => ErrorCode::InternalError,
    };
    ErrorEnvelope::new(code, e.to_string()).to_value()
}

impl KsiPlugin for DiscoveryPlugin {
    fn name(&self) -> &str {
        "discovery"
    }

    fn summary(&self) -> &str {
        "Live API discovery and module browsing"
    }

    fn handlers(&self) -> Vec<HandlerRegistration> {
        let registry = self.registry.clone();
        let discover_handler = handler_fn(move |_, data, _| {
            let registry = registry.clone();
            async move {
                Ok(Some(match registry.upgrade() {
                    Some(r) => discover(&r, &data),
                    None => gone(),
                }))
            }
        });

        let registry = self.registry.clone();
        let help_handler = handler_fn(move |_, data, _| {
            let registry = registry.clone();
            async move {
                Ok(Some(match registry.upgrade() {
                    Some(r) => help(&r, &data),
                    None => gone(),
                }))
            }
        });

        let registry = self.registry.clone();
        let module_list_handler = handler_fn(move |_, _, _| {
            let registry = registry.clone();
            async move {
                Ok(Some(match registry.upgrade() {
                    Some(r) => module_list(&r),
                    None => gone(),
                }))
            }
        });

        let registry = self.registry.clone();
        let module_events_handler = handler_fn(move |_, data, _| {
            let registry = registry.clone();
            async move {
                Ok(Some(match registry.upgrade() {
                    Some(r) => module_list_events(&r, &data),
                    None => gone(),
                }))
            }
        });

        let registry = self.registry.clone();
        let reload_handler = handler_fn(move |_, data, _| {
            let registry = registry.clone();
            async move {
                let Some(r) = registry.upgrade() else {
                    return Ok(Some(gone()));
                };
                let Some(plugin_name) = data.get("plugin_name").and_then(Value::as_str) else {
                    return Ok(Some(
                        ErrorEnvelope::new(
                            ErrorCode::Validation,
                            "missing 'plugin_name' parameter",
                        )
                        .to_value(),
                    ));
                };
                let force = data.get("force").and_then(Value::as_bool).unwrap_or(false);
                match r.reload(plugin_name, force).await {
                    Ok(()) => Ok(Some(json!({"status": "reloaded", "plugin": plugin_name}))),
                    Err(e) => Ok(Some(reload_error(&e))),
                }
            }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("system:discover")
                    .summary("Discover all events exposed by loaded plugins")
                    .param(
                        "detail",
                        Param::new(ParamType::Boolean)
                            .default_value(json!(false))
                            .description("Include parameters and triggers"),
                    )
                    .param(
                        "namespace",
                        Param::new(ParamType::String)
                            .description("Restrict to one namespace"),
                    ),
                discover_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("system:help")
                    .summary("Describe one event, optionally as an MCP tool schema")
                    .param(
                        "event",
                        Param::new(ParamType::String)
                            .required()
                            .description("Event name to describe"),
                    )
                    .param(
                        "format_style",
                        Param::new(ParamType::String)
                            .default_value(json!("human"))
                            .description("\"human\" or \"mcp\""),
                    ),
                help_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("module:list").summary("List loaded plugin modules"),
                module_list_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("module:list_events")
                    .summary("List events contributed by one module")
                    .param(
                        "module_name",
                        Param::new(ParamType::String)
                            .required()
                            .description("Module to inspect"),
                    ),
                module_events_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("plugin:reload")
                    .summary("Remove and re-import a plugin")
                    .param(
                        "plugin_name",
                        Param::new(ParamType::String)
                            .required()
                            .description("Plugin to reload"),
                    )
                    .param(
                        "force",
                        Param::new(ParamType::Boolean)
                            .default_value(json!(false))
                            .description("Reload even if the plugin declines"),
                    ),
                reload_handler,
            ),
        ]
    }
}
