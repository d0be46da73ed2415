//! Agent records.

use chrono::{DateTime, Utc};
use ksi_core::{AgentId, SessionId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Spawned and able to receive messages/completions.
    Active,
    /// Terminated; kept only transiently for status reporting.
    Terminated,
}

/// A spawned agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent id (`agent_<hex>`).
    pub agent_id: AgentId,
    /// Composition profile the agent was spawned from.
    pub profile: String,
    /// Lifecycle status.
    pub status: AgentStatus,
    /// Sandbox directory key. Stable for the lifetime of the agent —
    /// one directory per agent, not per conversation turn.
    pub sandbox_uuid: Uuid,
    /// Latest session id observed from the agent's completions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Client/agent that owns this agent as a construct.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub originator_id: Option<String>,
    /// Parent agent in the spawn tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<AgentId>,
    /// How deep below itself this agent observes descendant events:
    /// `0` = none, `n` = up to depth `n`, `-1` = all descendants.
    pub subscription_level: i64,
    /// Spawn time.
    pub created_at: DateTime<Utc>,
}
