//! Topic pub/sub over the bus.
//!
//! `message:publish` re-emits the payload as `message:<topic>`;
//! `message:subscribe` registers a bus subscription owned by the calling
//! connection whose handler pushes matching events back down that
//! connection via `transport:send`. Connection teardown removes the
//! subscription automatically (subscriptions are owned by their source).

use ksi_core::{ErrorCode, ErrorEnvelope};
use ksi_events::{EmitOptions, handler_fn};
use ksi_plugins::{HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType};
use serde_json::{Value, json};

/// Plugin exposing `message:*` events.
#[derive(Debug, Default)]
pub struct MessagePlugin;

impl MessagePlugin {
    /// Create the plugin.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn missing(field: &str) -> Value {
    ErrorEnvelope::new(ErrorCode::Validation, format!("missing required field: {field}"))
        .to_value()
}

impl KsiPlugin for MessagePlugin {
    fn name(&self) -> &str {
        "message_bus"
    }

    fn summary(&self) -> &str {
        "Inter-agent topic pub/sub"
    }

    fn handlers(&self) -> Vec<HandlerRegistration> {
        let publish_handler = handler_fn(|_, data, ctx| async move {
            let Some(topic) = data.get("topic").and_then(Value::as_str) else {
                return Ok(Some(missing("topic")));
            };
            let payload = data.get("payload").cloned().unwrap_or(json!({}));
            let event_name = format!("message:{topic}");
            let _ = ctx
                .emitter
                .emit(
                    &event_name,
                    payload,
                    EmitOptions::new().source(ctx.source.clone()),
                )
                .await;
            Ok(Some(json!({"status": "published", "topic": topic})))
        });

        let subscribe_handler = handler_fn(|_, data, ctx| async move {
            let patterns: Vec<String> = data
                .get("patterns")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if patterns.is_empty() {
                return Ok(Some(missing("patterns")));
            }

            let router = match ctx.emitter.router() {
                Ok(router) => router,
                Err(e) => {
                    return Ok(Some(
                        ErrorEnvelope::new(ErrorCode::InternalError, e.to_string()).to_value(),
                    ));
                },
            };

            // Forward matches back down the subscribing connection.
            let connection_id = ctx
                .source
                .strip_prefix("unix:")
                .map(ToString::to_string);
            let forwarder = handler_fn(move |event, data, forward_ctx| {
                let connection_id = connection_id.clone();
                async move {
                    if let Some(connection_id) = connection_id {
                        let _ = forward_ctx
                            .emitter
                            .emit(
                                "transport:send",
                                json!({
                                    "connection_id": connection_id,
                                    "event": {"event": event, "data": data},
                                }),
                                EmitOptions::new().source("message_bus"),
                            )
                            .await;
                    }
                    Ok(None)
                }
            });

            match router.subscribe(ctx.source.clone(), &patterns, forwarder, None) {
                Ok(id) => Ok(Some(json!({
                    "status": "subscribed",
                    "subscription_id": id,
                    "patterns": patterns,
                }))),
                Err(e) => Ok(Some(
                    ErrorEnvelope::new(ErrorCode::Validation, e.to_string()).to_value(),
                )),
            }
        });

        let unsubscribe_handler = handler_fn(|_, data, ctx| async move {
            let Some(id) = data.get("subscription_id").and_then(Value::as_str) else {
                return Ok(Some(missing("subscription_id")));
            };
            let router = match ctx.emitter.router() {
                Ok(router) => router,
                Err(e) => {
                    return Ok(Some(
                        ErrorEnvelope::new(ErrorCode::InternalError, e.to_string()).to_value(),
                    ));
                },
            };
            let removed = router.unsubscribe(&ksi_core::SubscriptionId::from(id));
            Ok(Some(json!({"subscription_id": id, "removed": removed})))
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("message:publish")
                    .summary("Publish a payload to a topic")
                    .param("topic", Param::new(ParamType::String).required())
                    .param("payload", Param::new(ParamType::Any)),
                publish_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("message:subscribe")
                    .summary("Subscribe the calling connection to event patterns")
                    .param("patterns", Param::new(ParamType::Array).required()),
                subscribe_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("message:unsubscribe")
                    .summary("Remove a bus subscription")
                    .param("subscription_id", Param::new(ParamType::String).required()),
                unsubscribe_handler,
            ),
        ]
    }
}
