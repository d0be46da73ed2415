//! Convenient re-exports for downstream crates.

pub use crate::error::{EventError, EventResult, HandlerOutput};
pub use crate::handler::{EventContext, EventEmitter, EventHandler, handler_fn};
pub use crate::hierarchy::{AgentHierarchy, AncestorObserver, ObservationSink};
pub use crate::record::EventRecord;
pub use crate::router::{EmitOptions, EventRouter, HandlerBinding};
pub use crate::schema::require_fields;
