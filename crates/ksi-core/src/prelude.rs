//! Convenient re-exports for downstream crates.

pub use crate::dirs::KsiHome;
pub use crate::envelope::{ErrorBody, ErrorEnvelope, EventEnvelope};
pub use crate::error::ErrorCode;
pub use crate::id::{AgentId, RequestId, SessionId, SubscriptionId};
pub use crate::name::namespace_of;
