//! KSI Agent - Orchestrates populations of agents that communicate by
//! emitting events.
//!
//! Agents are spawned from named composition profiles, get a sandbox
//! directory keyed by a UUID that stays **stable across conversation
//! turns** (so provider-level session continuity is preserved), and form
//! parent/child trees. The trees feed the router's hierarchical routing:
//! ancestors observe descendant events up to their declared subscription
//! level.
//!
//! Termination is idempotent and cascades to transitive children, and to
//! constructs when their originator is terminated.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod composition;
mod error;
mod service;
mod types;

pub use composition::{CompositionLibrary, CompositionPlugin, Profile};
pub use error::{AgentError, AgentResult};
pub use service::{AgentPlugin, AgentService};
pub use types::{AgentRecord, AgentStatus};
