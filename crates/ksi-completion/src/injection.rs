//! Injection router: persist and deliver next-turn prompt additions.
//!
//! Injections live in async-state queues keyed `injection:<session_id>`,
//! so they survive restarts. On each `completion:async` for a session,
//! pending injections are popped (respecting TTL) and prepended to the
//! outgoing prompt as a system reminder.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ksi_core::{ErrorCode, ErrorEnvelope};
use ksi_events::handler_fn;
use ksi_plugins::{HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType};
use ksi_state::AsyncStateStore;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::CompletionResult;

const QUEUE_PREFIX: &str = "injection:";

/// Persists injections and formats them into prompts.
pub struct InjectionRouter {
    store: Arc<AsyncStateStore>,
}

impl std::fmt::Debug for InjectionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionRouter").finish_non_exhaustive()
    }
}

impl InjectionRouter {
    /// Create a router over the persistent store.
    #[must_use]
    pub fn new(store: Arc<AsyncStateStore>) -> Self {
        Self { store }
    }

    fn queue_name(session_id: &str) -> String {
        format!("{QUEUE_PREFIX}{session_id}")
    }

    /// Queue an injection for a session.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn inject(
        &self,
        session_id: &str,
        mode: &str,
        content: &str,
        metadata: Option<Value>,
        is_feedback: bool,
        ttl: Option<Duration>,
    ) -> CompletionResult<()> {
        let injection = json!({
            "mode": mode,
            "content": content,
            "metadata": metadata,
            "is_feedback": is_feedback,
            "queued_at": Utc::now().to_rfc3339(),
        });
        self.store
            .push(&Self::queue_name(session_id), &injection, ttl)
            .await?;
        debug!(session_id, mode, is_feedback, "injection queued");
        Ok(())
    }

    /// Pop every pending injection for a session (consumed on the next
    /// completion).
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn pop_pending(&self, session_id: &str) -> CompletionResult<Vec<Value>> {
        let queue = Self::queue_name(session_id);
        let mut pending = Vec::new();
        while let Some(injection) = self.store.pop(&queue).await? {
            pending.push(injection);
        }
        Ok(pending)
    }

    /// Peek the pending injections for a session without consuming.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn list(&self, session_id: &str) -> CompletionResult<Vec<Value>> {
        Ok(self.store.get_queue(&Self::queue_name(session_id)).await?)
    }

    /// Drop every pending injection for a session.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn clear(&self, session_id: &str) -> CompletionResult<usize> {
        Ok(self.store.clear(&Self::queue_name(session_id)).await?)
    }

    /// Sessions with pending injections and their depths.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn status(&self) -> CompletionResult<Vec<(String, usize)>> {
        let queues = self.store.queues_with_prefix(QUEUE_PREFIX).await?;
        Ok(queues
            .into_iter()
            .map(|(queue, depth)| {
                let session = queue
                    .strip_prefix(QUEUE_PREFIX)
                    .unwrap_or(queue.as_str())
                    .to_string();
                (session, depth)
            })
            .collect())
    }

    /// Render pending injections as a system-reminder block to prepend
    /// to the outgoing prompt.
    #[must_use]
    pub fn format_reminder(injections: &[Value]) -> String {
        let mut reminder = String::new();
        for injection in injections {
            let content = injection
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            reminder.push_str("<system_reminder>\n");
            reminder.push_str(content);
            reminder.push_str("\n</system_reminder>\n\n");
        }
        reminder
    }
}

/// Plugin exposing `injection:*` events.
pub struct InjectionPlugin {
    router: Arc<InjectionRouter>,
}

impl InjectionPlugin {
    /// Create the plugin around a router.
    #[must_use]
    pub fn new(router: Arc<InjectionRouter>) -> Self {
        Self { router }
    }
}

fn missing(field: &str) -> Value {
    ErrorEnvelope::new(ErrorCode::Validation, format!("missing required field: {field}"))
        .to_value()
}

fn internal(e: &crate::CompletionError) -> Value {
    ErrorEnvelope::new(ErrorCode::InternalError, e.to_string()).to_value()
}

/// Target sessions from either `target_sessions` or a single
/// `session_id`.
fn target_sessions(data: &Value) -> Vec<String> {
    if let Some(targets) = data.get("target_sessions").and_then(Value::as_array) {
        return targets
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect();
    }
    data.get("session_id")
        .and_then(Value::as_str)
        .map(|s| vec![s.to_string()])
        .unwrap_or_default()
}

impl KsiPlugin for InjectionPlugin {
    fn name(&self) -> &str {
        "injection_router"
    }

    fn summary(&self) -> &str {
        "Queue next-turn prompt additions per session"
    }

    #[allow(clippy::too_many_lines)]
    fn handlers(&self) -> Vec<HandlerRegistration> {
        let router = Arc::clone(&self.router);
        let inject_handler = handler_fn(move |_, data, _| {
            let router = Arc::clone(&router);
            async move {
                let targets = target_sessions(&data);
                if targets.is_empty() {
                    return Ok(Some(missing("target_sessions")));
                }
                let Some(content) = data.get("content").and_then(Value::as_str) else {
                    return Ok(Some(missing("content")));
                };
                let mode = data
                    .get("mode")
                    .and_then(Value::as_str)
                    .unwrap_or("next");
                let is_feedback = data
                    .get("is_feedback")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let metadata = data.get("metadata").cloned();
                let ttl = data
                    .get("ttl_seconds")
                    .and_then(Value::as_u64)
                    .map(Duration::from_secs);

                for session in &targets {
                    if let Err(e) = router
                        .inject(session, mode, content, metadata.clone(), is_feedback, ttl)
                        .await
                    {
                        return Ok(Some(internal(&e)));
                    }
                }
                Ok(Some(json!({
                    "status": "queued",
                    "mode": mode,
                    "target_sessions": targets,
                })))
            }
        });

        let router = Arc::clone(&self.router);
        let list_handler = handler_fn(move |_, data, _| {
            let router = Arc::clone(&router);
            async move {
                let Some(session_id) = data.get("session_id").and_then(Value::as_str) else {
                    return Ok(Some(missing("session_id")));
                };
                match router.list(session_id).await {
                    Ok(injections) => Ok(Some(json!({
                        "session_id": session_id,
                        "count": injections.len(),
                        "injections": injections,
                    }))),
                    Err(e) => Ok(Some(internal(&e))),
                }
            }
        });

        let router = Arc::clone(&self.router);
        let clear_handler = handler_fn(move |_, data, _| {
            let router = Arc::clone(&router);
            async move {
                let Some(session_id) = data.get("session_id").and_then(Value::as_str) else {
                    return Ok(Some(missing("session_id")));
                };
                match router.clear(session_id).await {
                    Ok(cleared) => Ok(Some(json!({
                        "session_id": session_id,
                        "cleared": cleared,
                    }))),
                    Err(e) => Ok(Some(internal(&e))),
                }
            }
        });

        let router = Arc::clone(&self.router);
        let status_handler = handler_fn(move |_, _, _| {
            let router = Arc::clone(&router);
            async move {
                match router.status().await {
                    Ok(sessions) => {
                        let map: serde_json::Map<String, Value> = sessions
                            .into_iter()
                            .map(|(session, depth)| (session, json!(depth)))
                            .collect();
                        Ok(Some(json!({"pending": map})))
                    },
                    Err(e) => Ok(Some(internal(&e))),
                }
            }
        });

        let router = Arc::clone(&self.router);
        let process_result_handler = handler_fn(move |_, data, _| {
            let router = Arc::clone(&router);
            async move {
                let Some(config) = data.get("injection_config") else {
                    return Ok(Some(missing("injection_config")));
                };
                let enabled = config
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !enabled {
                    return Ok(Some(json!({"status": "skipped", "reason": "disabled"})));
                }
                let targets: Vec<String> = config
                    .get("target_sessions")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if targets.is_empty() {
                    return Ok(Some(missing("injection_config.target_sessions")));
                }
                let mode = config
                    .get("mode")
                    .and_then(Value::as_str)
                    .unwrap_or("system_reminder");
                let ttl = config
                    .get("ttl_seconds")
                    .and_then(Value::as_u64)
                    .map(Duration::from_secs);
                let summary = data
                    .get("result_summary")
                    .and_then(Value::as_str)
                    .unwrap_or("A completion this session requested has finished.");
                let metadata = json!({
                    "request_id": data.get("request_id"),
                    "metadata": config.get("metadata"),
                });

                for session in &targets {
                    if let Err(e) = router
                        .inject(session, mode, summary, Some(metadata.clone()), false, ttl)
                        .await
                    {
                        return Ok(Some(internal(&e)));
                    }
                }
                Ok(Some(json!({
                    "status": "queued",
                    "mode": mode,
                    "target_sessions": targets,
                })))
            }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("injection:inject")
                    .summary("Queue content for a session's next turn")
                    .param("session_id", Param::new(ParamType::String))
                    .param("target_sessions", Param::new(ParamType::Array))
                    .param("content", Param::new(ParamType::String).required())
                    .param("mode", Param::new(ParamType::String).default_value(json!("next")))
                    .param("ttl_seconds", Param::new(ParamType::Integer))
                    .param("metadata", Param::new(ParamType::Object)),
                inject_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("injection:list")
                    .summary("Peek a session's pending injections")
                    .param("session_id", Param::new(ParamType::String).required()),
                list_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("injection:clear")
                    .summary("Drop a session's pending injections")
                    .param("session_id", Param::new(ParamType::String).required()),
                clear_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("injection:status")
                    .summary("Sessions with pending injections"),
                status_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("injection:process_result")
                    .summary("Queue a completion result into target sessions")
                    .param("injection_config", Param::new(ParamType::Object).required())
                    .param("request_id", Param::new(ParamType::String))
                    .param("result_summary", Param::new(ParamType::String)),
                process_result_handler,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> InjectionRouter {
        InjectionRouter::new(Arc::new(AsyncStateStore::open_in_memory().expect("memory db")))
    }

    #[tokio::test]
    async fn test_inject_and_pop_pending() {
        let router = router();
        router
            .inject("s1", "next", "remember this", None, false, None)
            .await
            .unwrap();
        router
            .inject("s1", "next", "and this", None, true, None)
            .await
            .unwrap();

        let pending = router.pop_pending("s1").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0]["content"], "remember this");
        assert_eq!(pending[1]["is_feedback"], true);
        // Consumed.
        assert!(router.pop_pending("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_isolated() {
        let router = router();
        router
            .inject("s1", "next", "for s1", None, false, None)
            .await
            .unwrap();
        assert!(router.pop_pending("s2").await.unwrap().is_empty());
        assert_eq!(router.list("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_strips_prefix() {
        let router = router();
        router
            .inject("s1", "next", "x", None, false, None)
            .await
            .unwrap();
        let status = router.status().await.unwrap();
        assert_eq!(status, vec![("s1".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_expired_injection_not_delivered() {
        let router = router();
        router
            .inject("s1", "next", "stale", None, false, Some(Duration::from_secs(0)))
            .await
            .unwrap();
        assert!(router.pop_pending("s1").await.unwrap().is_empty());
    }

    #[test]
    fn test_format_reminder() {
        let reminder = InjectionRouter::format_reminder(&[
            json!({"content": "first"}),
            json!({"content": "second"}),
        ]);
        assert!(reminder.contains("<system_reminder>\nfirst\n</system_reminder>"));
        assert!(reminder.contains("second"));
    }
}
