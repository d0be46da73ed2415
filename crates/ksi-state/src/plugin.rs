//! Event surface for the state stores.

use std::sync::Arc;

use ksi_core::{ErrorCode, ErrorEnvelope};
use ksi_events::handler_fn;
use ksi_plugins::{HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType};
use serde_json::{Value, json};

use crate::async_state::AsyncStateStore;
use crate::error::StateError;
use crate::graph::{GraphStore, TraversalDirection};
use crate::kv::{DEFAULT_NAMESPACE, KvStore};

/// Plugin exposing `state:*` and `async_state:*` events.
pub struct StatePlugin {
    kv: Arc<KvStore>,
    graph: Arc<GraphStore>,
    async_state: Arc<AsyncStateStore>,
}

impl StatePlugin {
    /// Create the plugin around a persistent async-state store.
    #[must_use]
    pub fn new(async_state: Arc<AsyncStateStore>) -> Self {
        Self {
            kv: Arc::new(KvStore::new()),
            graph: Arc::new(GraphStore::new()),
            async_state,
        }
    }

    /// The in-memory KV store.
    #[must_use]
    pub fn kv(&self) -> Arc<KvStore> {
        Arc::clone(&self.kv)
    }

    /// The entity graph.
    #[must_use]
    pub fn graph(&self) -> Arc<GraphStore> {
        Arc::clone(&self.graph)
    }

    /// The persistent async-state store.
    #[must_use]
    pub fn async_state(&self) -> Arc<AsyncStateStore> {
        Arc::clone(&self.async_state)
    }
}

fn missing(field: &str) -> Value {
    ErrorEnvelope::new(ErrorCode::Validation, format!("missing required field: {field}"))
        .to_value()
}

fn state_error(e: &StateError) -> Value {
    let code = match e {
        StateError::EntityNotFound(_) => ErrorCode::NotFound,
        _ => ErrorCode::InternalError,
    };
    ErrorEnvelope::new(code, e.to_string()).to_value()
}

fn namespace_of(data: &Value) -> String {
    data.get("namespace")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_NAMESPACE)
        .to_string()
}

impl KsiPlugin for StatePlugin {
    fn name(&self) -> &str {
        "state_service"
    }

    fn summary(&self) -> &str {
        "Key-value, graph, and persistent queue state"
    }

    #[allow(clippy::too_many_lines)]
    fn handlers(&self) -> Vec<HandlerRegistration> {
        let kv = Arc::clone(&self.kv);
        let set_handler = handler_fn(move |_, data, _| {
            let kv = Arc::clone(&kv);
            async move {
                let namespace = namespace_of(&data);
                let Some(key) = data.get("key").and_then(Value::as_str) else {
                    return Ok(Some(missing("key")));
                };
                let Some(value) = data.get("value") else {
                    return Ok(Some(missing("value")));
                };
                kv.set(&namespace, key, value.clone());
                Ok(Some(json!({"status": "set", "namespace": namespace, "key": key})))
            }
        });

        let kv = Arc::clone(&self.kv);
        let get_handler = handler_fn(move |_, data, _| {
            let kv = Arc::clone(&kv);
            async move {
                let namespace = namespace_of(&data);
                let Some(key) = data.get("key").and_then(Value::as_str) else {
                    return Ok(Some(missing("key")));
                };
                let value = kv.get(&namespace, key);
                Ok(Some(json!({
                    "namespace": namespace,
                    "key": key,
                    "found": value.is_some(),
                    "value": value,
                })))
            }
        });

        let kv = Arc::clone(&self.kv);
        let delete_handler = handler_fn(move |_, data, _| {
            let kv = Arc::clone(&kv);
            async move {
                let namespace = namespace_of(&data);
                let Some(key) = data.get("key").and_then(Value::as_str) else {
                    return Ok(Some(missing("key")));
                };
                let deleted = kv.delete(&namespace, key);
                Ok(Some(json!({"namespace": namespace, "key": key, "deleted": deleted})))
            }
        });

        let kv = Arc::clone(&self.kv);
        let list_handler = handler_fn(move |_, data, _| {
            let kv = Arc::clone(&kv);
            async move {
                let namespace = namespace_of(&data);
                Ok(Some(json!({
                    "namespace": namespace,
                    "keys": kv.keys(&namespace),
                })))
            }
        });

        let graph = Arc::clone(&self.graph);
        let entity_create = handler_fn(move |_, data, _| {
            let graph = Arc::clone(&graph);
            async move {
                let Some(entity_type) = data.get("entity_type").and_then(Value::as_str) else {
                    return Ok(Some(missing("entity_type")));
                };
                let id = data
                    .get("id")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                let properties = data.get("properties").cloned().unwrap_or(json!({}));
                let entity = graph.create_entity(id, entity_type, properties);
                Ok(Some(json!({"status": "created", "entity": entity})))
            }
        });

        let graph = Arc::clone(&self.graph);
        let entity_query = handler_fn(move |_, data, _| {
            let graph = Arc::clone(&graph);
            async move {
                let entity_type = data.get("entity_type").and_then(Value::as_str);
                let entities = graph.query_entities(entity_type);
                Ok(Some(json!({"count": entities.len(), "entities": entities})))
            }
        });

        let graph = Arc::clone(&self.graph);
        let rel_create = handler_fn(move |_, data, _| {
            let graph = Arc::clone(&graph);
            async move {
                let Some(from) = data.get("from").and_then(Value::as_str) else {
                    return Ok(Some(missing("from")));
                };
                let Some(to) = data.get("to").and_then(Value::as_str) else {
                    return Ok(Some(missing("to")));
                };
                let Some(relation_type) = data.get("relation_type").and_then(Value::as_str)
                else {
                    return Ok(Some(missing("relation_type")));
                };
                let properties = data.get("properties").cloned().unwrap_or(json!({}));
                match graph.create_relationship(from, to, relation_type, properties) {
                    Ok(relationship) => {
                        Ok(Some(json!({"status": "created", "relationship": relationship})))
                    },
                    Err(e) => Ok(Some(state_error(&e))),
                }
            }
        });

        let graph = Arc::clone(&self.graph);
        let rel_query = handler_fn(move |_, data, _| {
            let graph = Arc::clone(&graph);
            async move {
                let relationships = graph.query_relationships(
                    data.get("from").and_then(Value::as_str),
                    data.get("to").and_then(Value::as_str),
                    data.get("relation_type").and_then(Value::as_str),
                );
                Ok(Some(json!({
                    "count": relationships.len(),
                    "relationships": relationships,
                })))
            }
        });

        let graph = Arc::clone(&self.graph);
        let traverse = handler_fn(move |_, data, _| {
            let graph = Arc::clone(&graph);
            async move {
                let Some(start) = data.get("start").and_then(Value::as_str) else {
                    return Ok(Some(missing("start")));
                };
                let direction = data
                    .get("direction")
                    .cloned()
                    .map(serde_json::from_value::<TraversalDirection>)
                    .transpose()
                    .unwrap_or_default()
                    .unwrap_or_default();
                let depth = data
                    .get("depth")
                    .and_then(Value::as_u64)
                    .and_then(|d| usize::try_from(d).ok())
                    .unwrap_or(1);
                let relation_types: Option<Vec<String>> = data
                    .get("relation_types")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(ToString::to_string)
                            .collect()
                    });
                match graph.traverse(start, direction, depth, relation_types.as_deref()) {
                    Ok((nodes, edges)) => Ok(Some(json!({
                        "start": start,
                        "nodes": nodes,
                        "edges": edges,
                    }))),
                    Err(e) => Ok(Some(state_error(&e))),
                }
            }
        });

        let store = Arc::clone(&self.async_state);
        let push_handler = handler_fn(move |_, data, _| {
            let store = Arc::clone(&store);
            async move {
                let Some(queue) = data.get("queue").and_then(Value::as_str) else {
                    return Ok(Some(missing("queue")));
                };
                let Some(value) = data.get("value") else {
                    return Ok(Some(missing("value")));
                };
                let ttl = data
                    .get("ttl_seconds")
                    .and_then(Value::as_u64)
                    .map(std::time::Duration::from_secs);
                match store.push(queue, value, ttl).await {
                    Ok(_) => {
                        let length = store.queue_length(queue).await.unwrap_or(0);
                        Ok(Some(json!({"status": "pushed", "queue": queue, "length": length})))
                    },
                    Err(e) => Ok(Some(state_error(&e))),
                }
            }
        });

        let store = Arc::clone(&self.async_state);
        let pop_handler = handler_fn(move |_, data, _| {
            let store = Arc::clone(&store);
            async move {
                let Some(queue) = data.get("queue").and_then(Value::as_str) else {
                    return Ok(Some(missing("queue")));
                };
                match store.pop(queue).await {
                    Ok(value) => Ok(Some(json!({
                        "queue": queue,
                        "found": value.is_some(),
                        "value": value,
                    }))),
                    Err(e) => Ok(Some(state_error(&e))),
                }
            }
        });

        let store = Arc::clone(&self.async_state);
        let get_queue_handler = handler_fn(move |_, data, _| {
            let store = Arc::clone(&store);
            async move {
                let Some(queue) = data.get("queue").and_then(Value::as_str) else {
                    return Ok(Some(missing("queue")));
                };
                match store.get_queue(queue).await {
                    Ok(items) => Ok(Some(json!({
                        "queue": queue,
                        "length": items.len(),
                        "items": items,
                    }))),
                    Err(e) => Ok(Some(state_error(&e))),
                }
            }
        });

        let store = Arc::clone(&self.async_state);
        let length_handler = handler_fn(move |_, data, _| {
            let store = Arc::clone(&store);
            async move {
                let Some(queue) = data.get("queue").and_then(Value::as_str) else {
                    return Ok(Some(missing("queue")));
                };
                match store.queue_length(queue).await {
                    Ok(length) => Ok(Some(json!({"queue": queue, "length": length}))),
                    Err(e) => Ok(Some(state_error(&e))),
                }
            }
        });

        let store = Arc::clone(&self.async_state);
        let clear_handler = handler_fn(move |_, data, _| {
            let store = Arc::clone(&store);
            async move {
                let Some(queue) = data.get("queue").and_then(Value::as_str) else {
                    return Ok(Some(missing("queue")));
                };
                match store.clear(queue).await {
                    Ok(cleared) => Ok(Some(json!({"queue": queue, "cleared": cleared}))),
                    Err(e) => Ok(Some(state_error(&e))),
                }
            }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("state:set")
                    .summary("Set a namespaced value")
                    .param("namespace", Param::new(ParamType::String).default_value(json!("global")))
                    .param("key", Param::new(ParamType::String).required())
                    .param("value", Param::new(ParamType::Any).required()),
                set_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("state:get")
                    .summary("Get a namespaced value")
                    .param("namespace", Param::new(ParamType::String).default_value(json!("global")))
                    .param("key", Param::new(ParamType::String).required()),
                get_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("state:delete")
                    .summary("Delete a namespaced value")
                    .param("namespace", Param::new(ParamType::String).default_value(json!("global")))
                    .param("key", Param::new(ParamType::String).required()),
                delete_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("state:list")
                    .summary("List keys in a namespace")
                    .param("namespace", Param::new(ParamType::String).default_value(json!("global"))),
                list_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("state:entity:create")
                    .summary("Create a graph entity")
                    .param("id", Param::new(ParamType::String))
                    .param("entity_type", Param::new(ParamType::String).required())
                    .param("properties", Param::new(ParamType::Object)),
                entity_create,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("state:entity:query")
                    .summary("Query graph entities")
                    .param("entity_type", Param::new(ParamType::String)),
                entity_query,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("state:relationship:create")
                    .summary("Create a graph relationship")
                    .param("from", Param::new(ParamType::String).required())
                    .param("to", Param::new(ParamType::String).required())
                    .param("relation_type", Param::new(ParamType::String).required())
                    .param("properties", Param::new(ParamType::Object)),
                rel_create,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("state:relationship:query")
                    .summary("Query graph relationships")
                    .param("from", Param::new(ParamType::String))
                    .param("to", Param::new(ParamType::String))
                    .param("relation_type", Param::new(ParamType::String)),
                rel_query,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("state:graph:traverse")
                    .summary("Breadth-first traversal from an entity")
                    .param("start", Param::new(ParamType::String).required())
                    .param("direction", Param::new(ParamType::String).default_value(json!("from")))
                    .param("depth", Param::new(ParamType::Integer).default_value(json!(1)))
                    .param("relation_types", Param::new(ParamType::Array)),
                traverse,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("async_state:push")
                    .summary("Append a value to a persistent queue")
                    .param("queue", Param::new(ParamType::String).required())
                    .param("value", Param::new(ParamType::Any).required())
                    .param("ttl_seconds", Param::new(ParamType::Integer)),
                push_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("async_state:pop")
                    .summary("Pop the oldest value from a persistent queue")
                    .param("queue", Param::new(ParamType::String).required()),
                pop_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("async_state:get_queue")
                    .summary("Read a persistent queue without consuming it")
                    .param("queue", Param::new(ParamType::String).required()),
                get_queue_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("async_state:queue_length")
                    .summary("Length of a persistent queue")
                    .param("queue", Param::new(ParamType::String).required()),
                length_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("async_state:clear")
                    .summary("Remove every entry in a persistent queue")
                    .param("queue", Param::new(ParamType::String).required()),
                clear_handler,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksi_events::{EmitOptions, EventRouter};
    use ksi_plugins::PluginRegistry;

    async fn setup() -> EventRouter {
        let router = EventRouter::new(100);
        let registry = PluginRegistry::new(router.clone());
        let store = Arc::new(AsyncStateStore::open_in_memory().unwrap());
        registry
            .load(Arc::new(StatePlugin::new(store)))
            .await
            .unwrap();
        router
    }

    #[tokio::test]
    async fn test_kv_roundtrip_over_bus() {
        let router = setup().await;
        let set = router
            .emit(
                "state:set",
                json!({"key": "k", "value": {"nested": true}}),
                EmitOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(set["status"], "set");
        assert_eq!(set["namespace"], "global");

        let get = router
            .emit("state:get", json!({"key": "k"}), EmitOptions::new())
            .await
            .unwrap();
        assert_eq!(get["found"], true);
        assert_eq!(get["value"]["nested"], true);

        let del = router
            .emit("state:delete", json!({"key": "k"}), EmitOptions::new())
            .await
            .unwrap();
        assert_eq!(del["deleted"], true);
    }

    #[tokio::test]
    async fn test_missing_key_rejected() {
        let router = setup().await;
        let result = router
            .emit("state:set", json!({"value": 1}), EmitOptions::new())
            .await
            .unwrap();
        assert_eq!(result["error"]["code"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_graph_over_bus() {
        let router = setup().await;
        router
            .emit(
                "state:entity:create",
                json!({"id": "a", "entity_type": "agent"}),
                EmitOptions::new(),
            )
            .await;
        router
            .emit(
                "state:entity:create",
                json!({"id": "b", "entity_type": "agent"}),
                EmitOptions::new(),
            )
            .await;
        let rel = router
            .emit(
                "state:relationship:create",
                json!({"from": "a", "to": "b", "relation_type": "spawned"}),
                EmitOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(rel["status"], "created");

        let traversal = router
            .emit(
                "state:graph:traverse",
                json!({"start": "a", "depth": 2}),
                EmitOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(traversal["nodes"][0]["id"], "b");
    }

    #[tokio::test]
    async fn test_async_state_over_bus() {
        let router = setup().await;
        let push = router
            .emit(
                "async_state:push",
                json!({"queue": "inj:s1", "value": {"content": "hello"}}),
                EmitOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(push["length"], 1);

        let peek = router
            .emit(
                "async_state:get_queue",
                json!({"queue": "inj:s1"}),
                EmitOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(peek["items"][0]["content"], "hello");

        let pop = router
            .emit("async_state:pop", json!({"queue": "inj:s1"}), EmitOptions::new())
            .await
            .unwrap();
        assert_eq!(pop["found"], true);

        let length = router
            .emit(
                "async_state:queue_length",
                json!({"queue": "inj:s1"}),
                EmitOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(length["length"], 0);
    }
}
