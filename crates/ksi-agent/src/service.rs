//! Agent lifecycle and messaging.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use ksi_core::{AgentId, ErrorCode, ErrorEnvelope, SessionId, is_error_response};
use ksi_events::{
    AgentHierarchy, AncestorObserver, EmitOptions, EventEmitter, handler_fn,
};
use ksi_plugins::{HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{AgentRecord, AgentStatus};

const SOURCE: &str = "agent_service";
/// Bounded per-observer inbox of hierarchical observations.
const MAX_OBSERVATIONS: usize = 100;

/// Owns the agent registry and sandbox directories.
pub struct AgentService {
    emitter: EventEmitter,
    agents: DashMap<String, AgentRecord>,
    observations: DashMap<String, VecDeque<Value>>,
    sandbox_root: PathBuf,
    default_model: String,
}

impl std::fmt::Debug for AgentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentService")
            .field("agents", &self.agents.len())
            .finish_non_exhaustive()
    }
}

impl AgentService {
    /// Create the service.
    #[must_use]
    pub fn new(
        emitter: EventEmitter,
        sandbox_root: impl Into<PathBuf>,
        default_model: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            emitter,
            agents: DashMap::new(),
            observations: DashMap::new(),
            sandbox_root: sandbox_root.into(),
            default_model: default_model.into(),
        })
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Spawn an agent from a composition profile.
    ///
    /// The profile is resolved through `composition:profile` on the bus;
    /// the sandbox directory is created under a fresh UUID that stays
    /// stable for the agent's lifetime.
    pub async fn spawn(&self, data: &Value) -> Value {
        let profile_name = data
            .get("profile")
            .and_then(Value::as_str)
            .unwrap_or("base_single_agent");
        let variables = data.get("variables").cloned().unwrap_or(json!({}));

        let resolution = match self
            .emitter
            .emit(
                "composition:profile",
                json!({"name": profile_name, "variables": variables}),
                EmitOptions::new().source(SOURCE).expect_response(),
            )
            .await
        {
            Ok(Some(value)) => value,
            Ok(None) => {
                return ErrorEnvelope::new(
                    ErrorCode::NotFound,
                    format!("no composition service answered for {profile_name}"),
                )
                .to_value();
            },
            Err(e) => {
                return ErrorEnvelope::new(ErrorCode::InternalError, e.to_string()).to_value();
            },
        };
        if is_error_response(&resolution) {
            return resolution;
        }

        let agent_id = AgentId::generate();
        let sandbox_uuid = Uuid::new_v4();
        let sandbox_dir = self.sandbox_root.join(sandbox_uuid.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&sandbox_dir).await {
            let err = crate::AgentError::Sandbox(e);
            return ErrorEnvelope::new(ErrorCode::InternalError, err.to_string()).to_value();
        }

        let record = AgentRecord {
            agent_id: agent_id.clone(),
            profile: profile_name.to_string(),
            status: AgentStatus::Active,
            sandbox_uuid,
            session_id: None,
            originator_id: data
                .get("originator_id")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            parent_id: data
                .get("parent_id")
                .and_then(Value::as_str)
                .map(AgentId::from),
            subscription_level: data
                .get("subscription_level")
                .and_then(Value::as_i64)
                .unwrap_or(1),
            created_at: Utc::now(),
        };
        self.agents.insert(agent_id.0.clone(), record);
        info!(agent_id = %agent_id, profile = profile_name, %sandbox_uuid, "agent spawned");

        // Kick off the first turn: explicit prompt beats the template.
        let prompt = data
            .get("initial_prompt")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| {
                resolution
                    .get("resolved_prompt")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            });
        if let Some(prompt) = prompt {
            if !prompt.trim().is_empty() {
                let model = data
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or(&self.default_model);
                let _ = self
                    .emitter
                    .emit(
                        "completion:async",
                        json!({"prompt": prompt, "model": model, "agent_id": agent_id}),
                        EmitOptions::new().source(SOURCE),
                    )
                    .await;
            }
        }

        json!({
            "agent_id": agent_id,
            "status": "created",
            "sandbox_uuid": sandbox_uuid,
            "profile": profile_name,
            "composition": resolution.get("composition"),
        })
    }

    /// Terminate an agent and, transitively, its children and
    /// constructs. Idempotent: unknown agents yield a well-formed
    /// `not_found` result.
    pub async fn terminate(&self, agent_id: &str) -> Value {
        if !self.agents.contains_key(agent_id) {
            return json!({"agent_id": agent_id, "status": "not_found"});
        }

        let mut terminated: Vec<String> = Vec::new();
        let mut stack = vec![agent_id.to_string()];
        while let Some(current) = stack.pop() {
            if self.agents.remove(&current).is_none() {
                continue;
            }
            terminated.push(current.clone());
            self.observations.remove(&current);

            let dependents: Vec<String> = self
                .agents
                .iter()
                .filter(|entry| {
                    entry.parent_id.as_ref().is_some_and(|p| p.as_str() == current)
                        || entry.originator_id.as_deref() == Some(current.as_str())
                })
                .map(|entry| entry.agent_id.0.clone())
                .collect();
            stack.extend(dependents);
        }

        info!(agent_id, count = terminated.len(), "agents terminated");
        for id in &terminated {
            let _ = self
                .emitter
                .emit(
                    "agent:terminated",
                    json!({"agent_id": id}),
                    EmitOptions::new().source(SOURCE),
                )
                .await;
        }
        json!({"agent_id": agent_id, "status": "terminated", "terminated": terminated})
    }

    /// Terminate every agent (daemon shutdown).
    pub async fn terminate_all(&self) -> usize {
        let ids: Vec<String> = self.agents.iter().map(|e| e.agent_id.0.clone()).collect();
        let count = ids.len();
        for id in ids {
            self.terminate(&id).await;
        }
        count
    }

    /// Deliver a message to an agent: queued as an injection when the
    /// agent has a session, otherwise as a fresh completion turn.
    pub async fn send_message(&self, agent_id: &str, message: &Value, from: Option<&str>) -> Value {
        let Some(record) = self.agents.get(agent_id).map(|e| e.value().clone()) else {
            return ErrorEnvelope::new(
                ErrorCode::NotFound,
                format!("agent not found: {agent_id}"),
            )
            .to_value();
        };

        let content = match message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        if let Some(session) = &record.session_id {
            let _ = self
                .emitter
                .emit(
                    "injection:inject",
                    json!({
                        "session_id": session,
                        "content": content,
                        "mode": "next",
                        "metadata": {"from": from, "to": agent_id},
                    }),
                    EmitOptions::new().source(SOURCE),
                )
                .await;
            json!({"agent_id": agent_id, "status": "queued", "via": "injection"})
        } else {
            let _ = self
                .emitter
                .emit(
                    "completion:async",
                    json!({
                        "prompt": content,
                        "model": self.default_model,
                        "agent_id": agent_id,
                    }),
                    EmitOptions::new().source(SOURCE),
                )
                .await;
            json!({"agent_id": agent_id, "status": "queued", "via": "completion"})
        }
    }

    /// All live agents.
    #[must_use]
    pub fn list(&self) -> Value {
        let mut agents: Vec<AgentRecord> =
            self.agents.iter().map(|e| e.value().clone()).collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        json!({"count": agents.len(), "agents": agents})
    }

    /// One agent's record plus its recent hierarchical observations.
    #[must_use]
    pub fn info(&self, agent_id: &str) -> Value {
        let Some(record) = self.agents.get(agent_id).map(|e| e.value().clone()) else {
            return ErrorEnvelope::new(
                ErrorCode::NotFound,
                format!("agent not found: {agent_id}"),
            )
            .to_value();
        };
        let observations: Vec<Value> = self
            .observations
            .get(agent_id)
            .map(|inbox| inbox.iter().rev().take(10).cloned().collect())
            .unwrap_or_default();
        json!({"agent": record, "recent_observations": observations})
    }

    /// Constructs owned by an originator (or all constructs).
    #[must_use]
    pub fn list_constructs(&self, originator_id: Option<&str>) -> Value {
        let constructs: Vec<AgentRecord> = self
            .agents
            .iter()
            .filter(|e| match originator_id {
                Some(owner) => e.originator_id.as_deref() == Some(owner),
                None => e.originator_id.is_some(),
            })
            .map(|e| e.value().clone())
            .collect();
        json!({"count": constructs.len(), "constructs": constructs})
    }

    /// Re-resolve an agent's composition to a new profile.
    pub async fn update_composition(&self, agent_id: &str, profile: &str) -> Value {
        if !self.agents.contains_key(agent_id) {
            return ErrorEnvelope::new(
                ErrorCode::NotFound,
                format!("agent not found: {agent_id}"),
            )
            .to_value();
        }
        let resolution = match self
            .emitter
            .emit(
                "composition:profile",
                json!({"name": profile, "variables": {}}),
                EmitOptions::new().source(SOURCE).expect_response(),
            )
            .await
        {
            Ok(Some(value)) => value,
            _ => {
                return ErrorEnvelope::new(
                    ErrorCode::NotFound,
                    format!("composition lookup failed for {profile}"),
                )
                .to_value();
            },
        };
        if is_error_response(&resolution) {
            return resolution;
        }
        if let Some(mut record) = self.agents.get_mut(agent_id) {
            record.profile = profile.to_string();
        }
        info!(agent_id, profile, "agent composition updated");
        json!({"agent_id": agent_id, "status": "updated", "profile": profile})
    }

    /// Track the latest session id from an agent's completion.
    fn record_session(&self, agent_id: &str, session_id: &str) {
        if let Some(mut record) = self.agents.get_mut(agent_id) {
            record.session_id = Some(SessionId::from(session_id));
            debug!(agent_id, session_id, "agent session updated");
        }
    }

    /// Store a hierarchical observation in the observer's inbox.
    fn record_observation(&self, observer: &str, payload: Value) {
        let mut inbox = self.observations.entry(observer.to_string()).or_default();
        inbox.push_back(payload);
        while inbox.len() > MAX_OBSERVATIONS {
            inbox.pop_front();
        }
    }

    /// Observations currently held for an observer (oldest first).
    #[must_use]
    pub fn observations_for(&self, observer: &str) -> Vec<Value> {
        self.observations
            .get(observer)
            .map(|inbox| inbox.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl AgentHierarchy for AgentService {
    fn ancestors(&self, agent_id: &str) -> Vec<AncestorObserver> {
        let mut ancestors = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(agent_id.to_string());

        let mut current = self
            .agents
            .get(agent_id)
            .and_then(|record| record.parent_id.clone());
        let mut depth: u32 = 1;

        while let Some(parent) = current {
            if !visited.insert(parent.0.clone()) {
                warn!(agent_id, "cycle detected in agent parent chain");
                break;
            }
            let Some(record) = self.agents.get(parent.as_str()).map(|e| e.value().clone())
            else {
                break;
            };
            ancestors.push(AncestorObserver {
                agent_id: parent.0.clone(),
                subscription_level: record.subscription_level,
                depth,
            });
            current = record.parent_id;
            depth = depth.saturating_add(1);
        }
        ancestors
    }
}

/// Plugin exposing `agent:*` events.
pub struct AgentPlugin {
    service: Arc<AgentService>,
}

impl AgentPlugin {
    /// Create the plugin around a service.
    #[must_use]
    pub fn new(service: Arc<AgentService>) -> Self {
        Self { service }
    }
}

fn missing(field: &str) -> Value {
    ErrorEnvelope::new(ErrorCode::Validation, format!("missing required field: {field}"))
        .to_value()
}

impl KsiPlugin for AgentPlugin {
    fn name(&self) -> &str {
        "agent_service"
    }

    fn summary(&self) -> &str {
        "Spawn, terminate, and message agents"
    }

    #[allow(clippy::too_many_lines)]
    fn handlers(&self) -> Vec<HandlerRegistration> {
        let service = Arc::clone(&self.service);
        let spawn_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move { Ok(Some(service.spawn(&data).await)) }
        });

        let service = Arc::clone(&self.service);
        let terminate_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let Some(agent_id) = data.get("agent_id").and_then(Value::as_str) else {
                    return Ok(Some(missing("agent_id")));
                };
                Ok(Some(service.terminate(agent_id).await))
            }
        });

        let service = Arc::clone(&self.service);
        let send_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let Some(agent_id) = data.get("agent_id").and_then(Value::as_str) else {
                    return Ok(Some(missing("agent_id")));
                };
                let Some(message) = data.get("message") else {
                    return Ok(Some(missing("message")));
                };
                let from = data.get("from").and_then(Value::as_str);
                Ok(Some(service.send_message(agent_id, message, from).await))
            }
        });

        let service = Arc::clone(&self.service);
        let list_handler = handler_fn(move |_, _, _| {
            let service = Arc::clone(&service);
            async move { Ok(Some(service.list())) }
        });

        let service = Arc::clone(&self.service);
        let info_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let Some(agent_id) = data.get("agent_id").and_then(Value::as_str) else {
                    return Ok(Some(missing("agent_id")));
                };
                Ok(Some(service.info(agent_id)))
            }
        });

        let service = Arc::clone(&self.service);
        let update_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let Some(agent_id) = data.get("agent_id").and_then(Value::as_str) else {
                    return Ok(Some(missing("agent_id")));
                };
                let Some(profile) = data.get("profile").and_then(Value::as_str) else {
                    return Ok(Some(missing("profile")));
                };
                Ok(Some(service.update_composition(agent_id, profile).await))
            }
        });

        let service = Arc::clone(&self.service);
        let constructs_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let originator = data.get("originator_id").and_then(Value::as_str);
                Ok(Some(service.list_constructs(originator)))
            }
        });

        // Passive handlers: track sessions from completion results and
        // collect hierarchical observations. Both return None so they
        // never claim the event.
        let service = Arc::clone(&self.service);
        let result_tracker = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                if let (Some(agent_id), Some(session_id)) = (
                    data.get("agent_id").and_then(Value::as_str),
                    data.pointer("/result/response/session_id").and_then(Value::as_str),
                ) {
                    service.record_session(agent_id, session_id);
                }
                Ok(None)
            }
        });

        let service = Arc::clone(&self.service);
        let observation_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                if let Some(observer) = data.get("observer").and_then(Value::as_str) {
                    service.record_observation(observer, data.clone());
                }
                Ok(None)
            }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("agent:spawn")
                    .summary("Spawn an agent from a composition profile")
                    .param(
                        "profile",
                        Param::new(ParamType::String).default_value(json!("base_single_agent")),
                    )
                    .param("initial_prompt", Param::new(ParamType::String))
                    .param("variables", Param::new(ParamType::Object))
                    .param("parent_id", Param::new(ParamType::String))
                    .param("originator_id", Param::new(ParamType::String))
                    .param(
                        "subscription_level",
                        Param::new(ParamType::Integer).default_value(json!(1)),
                    )
                    .triggers("completion:async")
                    .triggers("agent:terminated"),
                spawn_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("agent:terminate")
                    .summary("Terminate an agent and its descendants (idempotent)")
                    .param("agent_id", Param::new(ParamType::String).required()),
                terminate_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("agent:send_message")
                    .summary("Deliver a message to an agent's conversation")
                    .param("agent_id", Param::new(ParamType::String).required())
                    .param("message", Param::new(ParamType::Any).required())
                    .param("from", Param::new(ParamType::String)),
                send_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("agent:list").summary("List live agents"),
                list_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("agent:info")
                    .summary("One agent's record and recent observations")
                    .param("agent_id", Param::new(ParamType::String).required()),
                info_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("agent:update_composition")
                    .summary("Switch an agent to another profile")
                    .param("agent_id", Param::new(ParamType::String).required())
                    .param("profile", Param::new(ParamType::String).required()),
                update_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("agent:list_constructs")
                    .summary("List constructs, optionally by originator")
                    .param("originator_id", Param::new(ParamType::String)),
                constructs_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("completion:result")
                    .summary("Track agent session ids from completions")
                    .priority(10),
                result_tracker,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("agent:observation")
                    .summary("Collect hierarchical observations for ancestors"),
                observation_handler,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::{CompositionLibrary, CompositionPlugin};
    use ksi_events::EventRouter;
    use ksi_plugins::PluginRegistry;
    use std::time::Duration;

    struct Harness {
        router: EventRouter,
        service: Arc<AgentService>,
        _sandbox: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let router = EventRouter::new(1000);
        let registry = PluginRegistry::new(router.clone());
        let sandbox = tempfile::tempdir().unwrap();
        let service = AgentService::new(router.emitter(), sandbox.path(), "test");
        registry
            .load(Arc::new(CompositionPlugin::new(Arc::new(
                CompositionLibrary::with_defaults(),
            ))))
            .await
            .unwrap();
        registry
            .load(Arc::new(AgentPlugin::new(Arc::clone(&service))))
            .await
            .unwrap();
        router.set_hierarchy(Arc::clone(&service) as Arc<dyn AgentHierarchy>);
        Harness {
            router,
            service,
            _sandbox: sandbox,
        }
    }

    async fn spawn(h: &Harness, data: Value) -> Value {
        h.router
            .emit("agent:spawn", data, EmitOptions::new())
            .await
            .expect("spawn result")
    }

    #[tokio::test]
    async fn test_spawn_creates_sandbox_and_emits_completion() {
        let h = harness().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        h.router
            .subscribe(
                "completion_watcher",
                &["completion:async".to_string()],
                handler_fn(move |_, data, _| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(data);
                        Ok(None)
                    }
                }),
                None,
            )
            .unwrap();

        let result = spawn(
            &h,
            json!({"initial_prompt": "Count to three.", "profile": "base_single_agent"}),
        )
        .await;
        assert_eq!(result["status"], "created");
        let agent_id = result["agent_id"].as_str().unwrap().to_string();
        assert!(agent_id.starts_with("agent_"));

        let sandbox_uuid = result["sandbox_uuid"].as_str().unwrap();
        assert!(h._sandbox.path().join(sandbox_uuid).is_dir());

        let completion = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion["prompt"], "Count to three.");
        assert_eq!(completion["agent_id"], agent_id);
    }

    #[tokio::test]
    async fn test_spawn_unknown_profile() {
        let h = harness().await;
        let result = spawn(&h, json!({"profile": "no_such_profile"})).await;
        assert_eq!(result["error"]["code"], "NOT_FOUND");
        assert_eq!(h.service.agent_count(), 0);
    }

    #[tokio::test]
    async fn test_sandbox_uuid_stable_across_turns() {
        let h = harness().await;
        let result = spawn(&h, json!({})).await;
        let agent_id = result["agent_id"].as_str().unwrap().to_string();
        let uuid_at_spawn = result["sandbox_uuid"].as_str().unwrap().to_string();

        // Simulate two completed turns; the sandbox key must not move.
        h.router
            .emit(
                "completion:result",
                json!({"agent_id": agent_id, "result": {"response": {"session_id": "s1", "result": "a"}}}),
                EmitOptions::new(),
            )
            .await;
        h.router
            .emit(
                "completion:result",
                json!({"agent_id": agent_id, "result": {"response": {"session_id": "s2", "result": "b"}}}),
                EmitOptions::new(),
            )
            .await;

        let info = h.service.info(&agent_id);
        assert_eq!(info["agent"]["sandbox_uuid"], uuid_at_spawn);
        assert_eq!(info["agent"]["session_id"], "s2");
    }

    #[tokio::test]
    async fn test_terminate_idempotent() {
        // Unknown or already-terminated agents return a well-formed
        // result without error.
        let h = harness().await;
        let result = h.service.terminate("agent_ghost").await;
        assert_eq!(result["status"], "not_found");
        assert!(result.get("error").is_none());

        let spawned = spawn(&h, json!({})).await;
        let agent_id = spawned["agent_id"].as_str().unwrap().to_string();
        let first = h.service.terminate(&agent_id).await;
        assert_eq!(first["status"], "terminated");
        let second = h.service.terminate(&agent_id).await;
        assert_eq!(second["status"], "not_found");
    }

    #[tokio::test]
    async fn test_terminate_cascades_to_descendants_and_constructs() {
        let h = harness().await;
        let parent = spawn(&h, json!({})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();
        let child = spawn(&h, json!({"parent_id": parent})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();
        let grandchild = spawn(&h, json!({"parent_id": child})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();
        let construct = spawn(&h, json!({"originator_id": parent})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();
        let unrelated = spawn(&h, json!({})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();

        let result = h.service.terminate(&parent).await;
        let terminated: Vec<&str> = result["terminated"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(terminated.contains(&parent.as_str()));
        assert!(terminated.contains(&child.as_str()));
        assert!(terminated.contains(&grandchild.as_str()));
        assert!(terminated.contains(&construct.as_str()));
        assert!(!terminated.contains(&unrelated.as_str()));
        assert_eq!(h.service.agent_count(), 1);
    }

    #[tokio::test]
    async fn test_hierarchical_observation_levels() {
        // With chain child <- parent (level 1) <- grandparent
        // (level 1), a child event reaches the parent only.
        let h = harness().await;
        let grandparent = spawn(&h, json!({"subscription_level": 1})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();
        let parent = spawn(&h, json!({"parent_id": grandparent, "subscription_level": 1}))
            .await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();
        let child = spawn(&h, json!({"parent_id": parent})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();

        h.router
            .emit(
                "worker:progress",
                json!({"_agent_id": child, "step": 1}),
                EmitOptions::new(),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let parent_seen = h.service.observations_for(&parent);
        assert_eq!(parent_seen.len(), 1);
        assert_eq!(parent_seen[0]["source_agent"], child);
        assert_eq!(parent_seen[0]["event"], "worker:progress");
        assert!(h.service.observations_for(&grandparent).is_empty());
    }

    #[tokio::test]
    async fn test_grandparent_observes_with_level_two() {
        let h = harness().await;
        let grandparent = spawn(&h, json!({"subscription_level": 2})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();
        let parent = spawn(&h, json!({"parent_id": grandparent, "subscription_level": 0}))
            .await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();
        let child = spawn(&h, json!({"parent_id": parent})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();

        h.router
            .emit(
                "worker:done",
                json!({"_agent_id": child}),
                EmitOptions::new(),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.service.observations_for(&parent).is_empty());
        assert_eq!(h.service.observations_for(&grandparent).len(), 1);
    }

    #[tokio::test]
    async fn test_send_message_routes_by_session_presence() {
        let h = harness().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        h.router
            .subscribe(
                "delivery_watcher",
                &["completion:async".to_string(), "injection:inject".to_string()],
                handler_fn(move |event, data, _| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((event, data));
                        Ok(None)
                    }
                }),
                None,
            )
            .unwrap();

        let agent_id = spawn(&h, json!({})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();

        // No session yet: delivered as a completion.
        let result = h
            .service
            .send_message(&agent_id, &json!("hello there"), Some("tester"))
            .await;
        assert_eq!(result["via"], "completion");
        let (event, data) = rx.recv().await.unwrap();
        assert_eq!(event, "completion:async");
        assert_eq!(data["prompt"], "hello there");

        // After a turn, messages go through the injection router.
        h.router
            .emit(
                "completion:result",
                json!({"agent_id": agent_id, "result": {"response": {"session_id": "s9", "result": ""}}}),
                EmitOptions::new(),
            )
            .await;
        let result = h
            .service
            .send_message(&agent_id, &json!("follow-up"), None)
            .await;
        assert_eq!(result["via"], "injection");
        let (event, data) = rx.recv().await.unwrap();
        assert_eq!(event, "injection:inject");
        assert_eq!(data["session_id"], "s9");
        assert_eq!(data["content"], "follow-up");
    }

    #[tokio::test]
    async fn test_list_and_constructs() {
        let h = harness().await;
        let owner = spawn(&h, json!({})).await["agent_id"]
            .as_str()
            .unwrap()
            .to_string();
        spawn(&h, json!({"originator_id": owner})).await;
        spawn(&h, json!({"originator_id": owner})).await;

        let listed = h
            .router
            .emit("agent:list", json!({}), EmitOptions::new())
            .await
            .unwrap();
        assert_eq!(listed["count"], 3);

        let constructs = h
            .router
            .emit(
                "agent:list_constructs",
                json!({"originator_id": owner}),
                EmitOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(constructs["count"], 2);
    }
}
