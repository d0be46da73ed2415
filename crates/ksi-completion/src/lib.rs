//! KSI Completion - LLM completion coordination for the KSI daemon.
//!
//! This crate serializes provider calls per conversation and owns the
//! surrounding machinery:
//!
//! - Per-session FIFO queues with at-most-one in-flight request each
//! - Session-id chaining: every response mints a fresh session id that
//!   the client must send on the next turn
//! - The [`CompletionProvider`] contract and the Claude CLI subprocess
//!   provider
//! - JSON response logging to `<response_log_dir>/<session_id>.jsonl`
//! - JSON-event extraction from model output, with malformed-pattern
//!   feedback injected back to the emitting agent
//! - The injection router: next-turn prompt additions persisted in
//!   async-state queues

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod claude_cli;
mod error;
mod extraction;
mod injection;
mod provider;
mod queue;
mod response_log;
mod service;
mod types;

pub use claude_cli::ClaudeCliProvider;
pub use error::{CompletionError, CompletionResult};
pub use extraction::{ExtractionOutcome, extract_events, feedback_message};
pub use injection::{InjectionPlugin, InjectionRouter};
pub use provider::{CompletionProvider, ProviderRequest, ProviderResponse};
pub use queue::ConversationQueues;
pub use response_log::{ConversationPlugin, ResponseLogger};
pub use service::{CompletionPlugin, CompletionService};
pub use types::{CompletionRequest, InjectionConfig};
