//! Entity/relationship graph with bounded traversal.
//!
//! Relationships are stored by id in a flat table and resolved on demand,
//! so agent trees and other cyclic structures never hold direct
//! references to each other.

use std::collections::{HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StateError, StateResult};

/// A typed node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Entity id.
    pub id: String,
    /// Entity type (`"agent"`, `"construct"`, ...).
    pub entity_type: String,
    /// Arbitrary JSON properties.
    pub properties: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A typed edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    /// Relationship id.
    pub id: String,
    /// Source entity id.
    pub from: String,
    /// Target entity id.
    pub to: String,
    /// Relation type (`"spawned"`, `"observes"`, ...).
    pub relation_type: String,
    /// Arbitrary JSON properties.
    pub properties: Value,
}

/// Traversal direction for [`GraphStore::traverse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalDirection {
    /// Follow edges from the start node outward (`from` → `to`).
    #[default]
    From,
    /// Follow edges pointing at the current node (`to` → `from`).
    To,
    /// Follow edges in both directions.
    Both,
}

/// In-memory graph store.
#[derive(Debug, Default)]
pub struct GraphStore {
    entities: DashMap<String, Entity>,
    relationships: RwLock<Vec<Relationship>>,
}

impl GraphStore {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entity. A caller-supplied id replaces any existing
    /// entity with that id.
    pub fn create_entity(
        &self,
        id: Option<String>,
        entity_type: impl Into<String>,
        properties: Value,
    ) -> Entity {
        let entity = Entity {
            id: id.unwrap_or_else(|| format!("ent_{}", ksi_core::short_id())),
            entity_type: entity_type.into(),
            properties,
            created_at: Utc::now(),
        };
        self.entities.insert(entity.id.clone(), entity.clone());
        entity
    }

    /// Look up an entity by id.
    #[must_use]
    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.entities.get(id).map(|e| e.value().clone())
    }

    /// Remove an entity and every edge touching it. Returns `true` if it
    /// existed.
    pub fn remove_entity(&self, id: &str) -> bool {
        let removed = self.entities.remove(id).is_some();
        if removed {
            self.relationships
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|r| r.from != id && r.to != id);
        }
        removed
    }

    /// Entities matching an optional type filter.
    #[must_use]
    pub fn query_entities(&self, entity_type: Option<&str>) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| entity_type.is_none_or(|t| e.entity_type == t))
            .map(|e| e.value().clone())
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities
    }

    /// Create a relationship between two existing entities.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::EntityNotFound`] if either endpoint is
    /// missing.
    pub fn create_relationship(
        &self,
        from: &str,
        to: &str,
        relation_type: impl Into<String>,
        properties: Value,
    ) -> StateResult<Relationship> {
        if !self.entities.contains_key(from) {
            return Err(StateError::EntityNotFound(from.to_string()));
        }
        if !self.entities.contains_key(to) {
            return Err(StateError::EntityNotFound(to.to_string()));
        }
        let relationship = Relationship {
            id: format!("rel_{}", ksi_core::short_id()),
            from: from.to_string(),
            to: to.to_string(),
            relation_type: relation_type.into(),
            properties,
        };
        self.relationships
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(relationship.clone());
        Ok(relationship)
    }

    /// Relationships matching the given filters (all optional).
    #[must_use]
    pub fn query_relationships(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        relation_type: Option<&str>,
    ) -> Vec<Relationship> {
        self.relationships
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| from.is_none_or(|f| r.from == f))
            .filter(|r| to.is_none_or(|t| r.to == t))
            .filter(|r| relation_type.is_none_or(|t| r.relation_type == t))
            .cloned()
            .collect()
    }

    /// Breadth-first traversal from `start`, bounded by `max_depth`.
    ///
    /// Returns the visited entities (excluding `start`) and the edges
    /// followed, honouring the direction and relation-type filters.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::EntityNotFound`] if `start` does not exist.
    pub fn traverse(
        &self,
        start: &str,
        direction: TraversalDirection,
        max_depth: usize,
        relation_types: Option<&[String]>,
    ) -> StateResult<(Vec<Entity>, Vec<Relationship>)> {
        if !self.entities.contains_key(start) {
            return Err(StateError::EntityNotFound(start.to_string()));
        }

        let relationships = self
            .relationships
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.to_string());
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((start.to_string(), 0));

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut edge_ids: HashSet<String> = HashSet::new();

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for relationship in &relationships {
                if let Some(types) = relation_types {
                    if !types.iter().any(|t| t == &relationship.relation_type) {
                        continue;
                    }
                }
                let next = match direction {
                    TraversalDirection::From if relationship.from == current => {
                        Some(relationship.to.clone())
                    },
                    TraversalDirection::To if relationship.to == current => {
                        Some(relationship.from.clone())
                    },
                    TraversalDirection::Both if relationship.from == current => {
                        Some(relationship.to.clone())
                    },
                    TraversalDirection::Both if relationship.to == current => {
                        Some(relationship.from.clone())
                    },
                    _ => None,
                };
                let Some(next) = next else { continue };
                if edge_ids.insert(relationship.id.clone()) {
                    edges.push(relationship.clone());
                }
                if visited.insert(next.clone()) {
                    if let Some(entity) = self.entity(&next) {
                        nodes.push(entity);
                    }
                    queue.push_back((next, depth.saturating_add(1)));
                }
            }
        }

        Ok((nodes, edges))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain() -> GraphStore {
        // a -spawned-> b -spawned-> c, plus a -observes-> c
        let graph = GraphStore::new();
        graph.create_entity(Some("a".into()), "agent", json!({}));
        graph.create_entity(Some("b".into()), "agent", json!({}));
        graph.create_entity(Some("c".into()), "agent", json!({}));
        graph.create_relationship("a", "b", "spawned", json!({})).unwrap();
        graph.create_relationship("b", "c", "spawned", json!({})).unwrap();
        graph.create_relationship("a", "c", "observes", json!({})).unwrap();
        graph
    }

    #[test]
    fn test_entity_roundtrip() {
        let graph = GraphStore::new();
        let entity = graph.create_entity(None, "agent", json!({"profile": "base"}));
        assert!(entity.id.starts_with("ent_"));
        assert_eq!(graph.entity(&entity.id).unwrap().entity_type, "agent");
    }

    #[test]
    fn test_relationship_requires_endpoints() {
        let graph = GraphStore::new();
        graph.create_entity(Some("a".into()), "agent", json!({}));
        let err = graph.create_relationship("a", "missing", "spawned", json!({}));
        assert!(matches!(err, Err(StateError::EntityNotFound(_))));
    }

    #[test]
    fn test_traverse_depth_limit() {
        let graph = chain();
        let (nodes, _) = graph
            .traverse("a", TraversalDirection::From, 1, None)
            .unwrap();
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        // Depth 1 from "a": b (spawned) and c (observes), but not c-via-b.
        assert!(ids.contains(&"b"));
        assert!(ids.contains(&"c"));

        let (nodes, edges) = graph
            .traverse("a", TraversalDirection::From, 2, Some(&["spawned".to_string()]))
            .unwrap();
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn test_traverse_reverse_direction() {
        let graph = chain();
        let (nodes, _) = graph
            .traverse("c", TraversalDirection::To, 3, Some(&["spawned".to_string()]))
            .unwrap();
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_remove_entity_drops_edges() {
        let graph = chain();
        assert!(graph.remove_entity("b"));
        assert!(graph.query_relationships(None, None, Some("spawned")).is_empty());
        // The a -observes-> c edge survives.
        assert_eq!(graph.query_relationships(None, None, None).len(), 1);
    }
}
