//! KSI State - Event-surfaced stores for the KSI daemon.
//!
//! Two families of state:
//!
//! - `state:*` — ephemeral, in-memory: a namespaced key-value store plus
//!   an entity/relationship graph with bounded traversal.
//! - `async_state:*` — persistent queues in a SQLite database
//!   (`<state_dir>/async_state.db`) with TTL-based pruning. Used by the
//!   injection router and observation history for cross-request
//!   continuation; entries survive daemon restarts.
//!
//! [`StatePlugin`] surfaces both over the bus.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod async_state;
mod error;
mod graph;
mod kv;
mod plugin;

pub use async_state::AsyncStateStore;
pub use error::{StateError, StateResult};
pub use graph::{Entity, GraphStore, Relationship, TraversalDirection};
pub use kv::KvStore;
pub use plugin::StatePlugin;
