//! KSI Observation - Filtered, read-only delivery of events from target
//! agents to observers.
//!
//! Observation is deliberately routed through a separate channel from
//! primary dispatch: the router hands every event to the
//! [`ObservationSink`](ksi_events::ObservationSink) implemented here, and
//! matching observers receive `observe:begin` / `observe:end` pairs
//! without ever influencing the first-non-nil handler result.
//!
//! Deliveries are appended to async-state for `observation:query_history`,
//! `observation:replay` (adjustable speed, original or replay-tagged
//! re-emission), and `observation:analyze_patterns` (frequency, sequence
//! bigrams, begin/end performance pairing).

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod analyze;
mod error;
mod filter;
mod service;

pub use error::{ObservationError, ObservationResult};
pub use filter::{ContentMatch, ObservationFilter, RateLimit};
pub use service::{ObservationPlugin, ObservationService};

/// Async-state queue holding observation deliveries.
pub const HISTORY_QUEUE: &str = "observation:history";
