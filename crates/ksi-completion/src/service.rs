//! The completion service: per-conversation workers and the
//! `completion:*` event surface.
//!
//! # Serialization
//!
//! `completion:async` enqueues and returns immediately. Each queue has at
//! most one worker; the worker dequeues one request at a time, invokes
//! the provider, emits `completion:result`, rekeys the queue to the new
//! session id, and loops until the queue drains (invariant: in-flight
//! completions per session ≤ 1).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ksi_core::{ErrorCode, ErrorEnvelope, RequestId};
use ksi_events::{EmitOptions, EventEmitter, handler_fn, require_fields};
use ksi_plugins::{
    HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType, PluginContext, RegistryResult,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CompletionError, CompletionResult};
use crate::extraction::{extract_events, feedback_message};
use crate::injection::{InjectionPlugin, InjectionRouter};
use crate::provider::{CompletionProvider, ProviderRequest};
use crate::queue::ConversationQueues;
use crate::response_log::ResponseLogger;
use crate::types::CompletionRequest;

const SOURCE: &str = "completion_service";

struct ActiveRequest {
    session_key: String,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Coordinates completion requests across conversation queues.
pub struct CompletionService {
    emitter: EventEmitter,
    provider: Arc<dyn CompletionProvider>,
    queues: ConversationQueues,
    injections: Arc<InjectionRouter>,
    response_log: Arc<ResponseLogger>,
    active: DashMap<String, ActiveRequest>,
    default_model: String,
}

impl std::fmt::Debug for CompletionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionService")
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl CompletionService {
    /// Create the service.
    #[must_use]
    pub fn new(
        emitter: EventEmitter,
        provider: Arc<dyn CompletionProvider>,
        injections: Arc<InjectionRouter>,
        response_log: Arc<ResponseLogger>,
        default_model: impl Into<String>,
        queue_gc_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            emitter,
            provider,
            queues: ConversationQueues::new(queue_gc_ttl),
            injections,
            response_log,
            active: DashMap::new(),
            default_model: default_model.into(),
        })
    }

    /// Accept a request: enqueue it and start a worker if the queue was
    /// idle. Returns the immediate acknowledgment payload.
    pub fn accept(self: &Arc<Self>, request: CompletionRequest) -> Value {
        let key = request.queue_key();
        let request_id = request.request_id.clone();
        let start_worker = self.queues.enqueue(&key, request);
        debug!(%request_id, queue = %key, start_worker, "completion queued");
        if start_worker {
            let service = Arc::clone(self);
            tokio::spawn(service.run_queue(key));
        }
        json!({"request_id": request_id, "status": "queued"})
    }

    /// Cancel a request by id. Pending requests are dropped; an active
    /// request's worker is signalled and its result discarded.
    pub fn cancel(&self, request_id: &str) -> Value {
        if let Some((_, active)) = self.active.remove(request_id) {
            active.cancel.cancel();
            info!(request_id, "active completion cancelled");
            return json!({"request_id": request_id, "status": "cancelled"});
        }
        if self.queues.cancel_pending(request_id) {
            info!(request_id, "pending completion cancelled");
            return json!({"request_id": request_id, "status": "cancelled"});
        }
        json!({"request_id": request_id, "status": "not_found"})
    }

    /// Service status snapshot; opportunistically GCs idle queues.
    #[must_use]
    pub fn status(&self) -> Value {
        self.queues.gc_idle();
        let active_requests: Vec<Value> = self
            .active
            .iter()
            .map(|entry| {
                json!({
                    "request_id": entry.key(),
                    "session": entry.value().session_key,
                    "started_at": entry.value().started_at.to_rfc3339(),
                })
            })
            .collect();
        let queues: serde_json::Map<String, Value> = self
            .queues
            .depths()
            .into_iter()
            .map(|(key, depth)| (key, json!(depth)))
            .collect();
        json!({
            "provider": self.provider.name(),
            "active_count": active_requests.len(),
            "active_requests": active_requests,
            "queues": queues,
        })
    }

    /// Number of requests currently at a provider.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    async fn run_queue(self: Arc<Self>, key: String) {
        let mut key = key;
        loop {
            let Some(request) = self.queues.next(&key) else {
                break;
            };
            let request_id = request.request_id.clone();
            let agent_id = request.agent_id.clone().map(|a| a.0);
            let token = CancellationToken::new();
            self.active.insert(
                request_id.0.clone(),
                ActiveRequest {
                    session_key: key.clone(),
                    cancel: token.clone(),
                    started_at: Utc::now(),
                },
            );

            let processed = tokio::select! {
                () = token.cancelled() => None,
                result = self.process_one(&request) => Some(result),
            };
            self.active.remove(request_id.as_str());

            match processed {
                None => {
                    self.emit_error(
                        &request_id,
                        agent_id.as_deref(),
                        ErrorCode::Cancelled,
                        "request cancelled",
                        None,
                    )
                    .await;
                },
                Some(Ok(new_session)) => {
                    if new_session != key {
                        if !self.queues.rekey(&key, &new_session) {
                            // Another worker owns the merged queue now.
                            break;
                        }
                        key = new_session;
                    }
                },
                Some(Err(e)) => {
                    warn!(request_id = %request_id, error = %e, "completion failed");
                    let (code, stderr) = match &e {
                        CompletionError::Provider { stderr, .. } => {
                            (ErrorCode::ProviderError, stderr.clone())
                        },
                        CompletionError::ExecutableNotFound(_) => {
                            (ErrorCode::ProviderError, None)
                        },
                        _ => (ErrorCode::InternalError, None),
                    };
                    self.emit_error(&request_id, agent_id.as_deref(), code, &e.to_string(), stderr)
                        .await;
                },
            }
        }
        self.queues.gc_idle();
    }

    /// Process one dequeued request. Returns the queue key to continue
    /// under (the fresh session id).
    async fn process_one(&self, request: &CompletionRequest) -> CompletionResult<String> {
        // Flush pending injections into the outgoing prompt.
        let mut prompt = request.prompt.clone();
        if let Some(session) = &request.session_id {
            let pending = self.injections.pop_pending(session.as_str()).await?;
            if !pending.is_empty() {
                debug!(session = %session, count = pending.len(), "prepending injections");
                prompt = format!("{}{prompt}", InjectionRouter::format_reminder(&pending));
            }
        }

        let _ = self
            .emitter
            .emit(
                "completion:progress",
                json!({
                    "request_id": request.request_id,
                    "status": "started",
                    "provider": self.provider.name(),
                }),
                EmitOptions::new().source(SOURCE),
            )
            .await;

        let provider_request = ProviderRequest {
            prompt,
            model: request.model.clone(),
            session_id: request.session_id.clone(),
            allowed_tools: Vec::new(),
        };
        let response = self.provider.complete(&provider_request).await?;
        let new_session = response.session_id.0.clone();

        // One JSON line per turn, named after the *new* session id.
        let request_value = serde_json::to_value(request)?;
        let response_value = response.to_wire();
        if let Err(e) = self
            .response_log
            .append(&new_session, &request_value, &response_value)
            .await
        {
            warn!(session = %new_session, error = %e, "failed to write response log");
        }

        let mut result_data = json!({
            "request_id": request.request_id,
            "result": response_value,
        });
        if let Some(agent) = &request.agent_id {
            result_data["agent_id"] = json!(agent);
        }
        let _ = self
            .emitter
            .emit("completion:result", result_data, EmitOptions::new().source(SOURCE))
            .await;

        if let Some(agent) = &request.agent_id {
            self.extract_embedded_events(agent.as_str(), &new_session, &response.result)
                .await?;
        }

        if let Some(config) = &request.injection_config {
            if config.enabled {
                let payload = json!({
                    "request_id": request.request_id,
                    "injection_config": config,
                    "result_summary": truncate(&response.result, 500),
                });
                let _ = self
                    .emitter
                    .emit(
                        "injection:process_result",
                        payload,
                        EmitOptions::new().source(SOURCE),
                    )
                    .await;
            }
        }

        Ok(new_session)
    }

    /// Re-emit well-formed embedded events tagged with the agent, and
    /// queue exactly one feedback injection when malformed candidates
    /// were present.
    async fn extract_embedded_events(
        &self,
        agent_id: &str,
        session_id: &str,
        text: &str,
    ) -> CompletionResult<()> {
        let outcome = extract_events(text);
        for (event_name, data) in outcome.events {
            let data = match data {
                Value::Object(mut map) => {
                    map.insert("_agent_id".to_string(), json!(agent_id));
                    Value::Object(map)
                },
                other => json!({"value": other, "_agent_id": agent_id}),
            };
            debug!(agent_id, event = %event_name, "re-emitting extracted event");
            let _ = self
                .emitter
                .emit(
                    &event_name,
                    data,
                    EmitOptions::new().source(format!("agent:{agent_id}")),
                )
                .await;
        }

        if !outcome.malformed.is_empty() {
            let message = feedback_message(&outcome.malformed);
            self.injections
                .inject(
                    session_id,
                    "next",
                    &message,
                    Some(json!({"agent_id": agent_id})),
                    true,
                    None,
                )
                .await?;
            info!(
                agent_id,
                count = outcome.malformed.len(),
                "queued malformed-JSON feedback"
            );
        }
        Ok(())
    }

    async fn emit_error(
        &self,
        request_id: &RequestId,
        agent_id: Option<&str>,
        code: ErrorCode,
        message: &str,
        stderr: Option<String>,
    ) {
        let mut error = ErrorEnvelope::new(code, message).to_value();
        if let Some(stderr) = stderr {
            error["error"]["stderr"] = json!(stderr);
        }
        let mut data = json!({"request_id": request_id});
        data["error"] = error["error"].clone();
        if let Some(agent) = agent_id {
            data["agent_id"] = json!(agent);
        }
        let _ = self
            .emitter
            .emit("completion:error", data, EmitOptions::new().source(SOURCE))
            .await;
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Plugin exposing `completion:*` events.
pub struct CompletionPlugin {
    service: Arc<CompletionService>,
}

impl CompletionPlugin {
    /// Create the plugin around a service.
    #[must_use]
    pub fn new(service: Arc<CompletionService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl KsiPlugin for CompletionPlugin {
    fn name(&self) -> &str {
        "completion_service"
    }

    fn summary(&self) -> &str {
        "Serialize LLM completions per conversation"
    }

    fn handlers(&self) -> Vec<HandlerRegistration> {
        let service = Arc::clone(&self.service);
        let async_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                match CompletionRequest::from_data(&data, &service.default_model) {
                    Ok(request) => Ok(Some(service.accept(request))),
                    Err(message) => Ok(Some(
                        ErrorEnvelope::new(ErrorCode::Validation, message).to_value(),
                    )),
                }
            }
        });

        let service = Arc::clone(&self.service);
        let cancel_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let Some(request_id) = data.get("request_id").and_then(Value::as_str) else {
                    return Ok(Some(
                        ErrorEnvelope::new(
                            ErrorCode::Validation,
                            "missing required field: request_id",
                        )
                        .to_value(),
                    ));
                };
                Ok(Some(service.cancel(request_id)))
            }
        });

        let service = Arc::clone(&self.service);
        let status_handler = handler_fn(move |_, _, _| {
            let service = Arc::clone(&service);
            async move { Ok(Some(service.status())) }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("completion:async")
                    .summary("Queue an LLM completion; returns immediately")
                    .param("prompt", Param::new(ParamType::String).required())
                    .param("model", Param::new(ParamType::String))
                    .param("session_id", Param::new(ParamType::String))
                    .param("agent_id", Param::new(ParamType::String))
                    .param("request_id", Param::new(ParamType::String))
                    .param("injection_config", Param::new(ParamType::Object))
                    .triggers("completion:result")
                    .triggers("completion:error")
                    .triggers("completion:progress"),
                async_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("completion:cancel")
                    .summary("Cancel a queued or active completion")
                    .param("request_id", Param::new(ParamType::String).required()),
                cancel_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("completion:status")
                    .summary("Active requests and queue depths"),
                status_handler,
            ),
        ]
    }

    async fn on_startup(&self, ctx: &PluginContext) -> RegistryResult<()> {
        if let Ok(router) = ctx.emitter.router() {
            router.register_schema("completion:async", require_fields(&["prompt"]));
        }
        Ok(())
    }
}
