//! KSI Events - Namespace-aware event routing with correlation support.
//!
//! This crate provides the central dispatch for the daemon:
//! - Hierarchical namespaces (`completion:async`, `agent:spawn`, ...)
//! - Priority-ordered handler dispatch with first-non-nil-wins semantics
//! - Pattern/wildcard subscriptions, separate from handler dispatch
//! - Request/response correlation with single-shot futures and timeouts
//! - A bounded ring history for replay and introspection
//! - Hierarchical observation routing for agent spawn trees
//!
//! # Architecture
//!
//! The [`EventRouter`] owns all mutable routing state behind short-lived
//! locks; locks are **never held across await points**. Handlers receive an
//! [`EventContext`] carrying an [`EventEmitter`] — a weak handle back to the
//! router — so plugins can emit further events without creating reference
//! cycles.
//!
//! # Example
//!
//! ```rust
//! use ksi_events::{EmitOptions, EventRouter, handler_fn};
//! use serde_json::json;
//!
//! # async fn example() {
//! let router = EventRouter::new(1000);
//!
//! router.subscribe(
//!     "monitor",
//!     &["task:*".to_string()],
//!     handler_fn(|_event, _data, _ctx| async move { Ok(None) }),
//!     None,
//! );
//!
//! router
//!     .emit("task:start", json!({"id": 1}), EmitOptions::new().source("test"))
//!     .await;
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod handler;
mod hierarchy;
mod record;
mod router;
mod schema;
mod stats;
mod subscription;

pub use error::{EventError, EventResult, HandlerOutput};
pub use handler::{EventContext, EventEmitter, EventHandler, handler_fn};
pub use hierarchy::{AgentHierarchy, AncestorObserver, ObservationSink};
pub use record::EventRecord;
pub use router::{EmitOptions, EventRouter, HandlerBinding};
pub use schema::{SchemaValidator, require_fields};
pub use stats::StatsSnapshot;
pub use subscription::Subscription;

/// Default correlation timeout in seconds.
pub const DEFAULT_CORRELATION_TIMEOUT_SECS: u64 = 30;

/// Default bounded history length.
pub const DEFAULT_MAX_HISTORY: usize = 1000;
