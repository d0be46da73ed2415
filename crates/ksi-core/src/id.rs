//! Typed identifiers.
//!
//! All ids are short, human-scannable strings (`comp_1a2b3c4d`) rather than
//! full UUIDs, matching what shows up in daemon logs and response files.
//! Session ids are the exception: they are opaque strings minted by the
//! completion provider and are never generated locally.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate an 8-character hex suffix for prefixed ids.
#[must_use]
pub fn short_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple.chars().take(8).collect()
}

macro_rules! prefixed_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh id.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "_{}"), short_id()))
            }

            /// View as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

prefixed_id!(
    /// Identifier for a completion request (`comp_<hex>`).
    RequestId,
    "comp"
);

prefixed_id!(
    /// Identifier for a bus subscription (`sub_<hex>`).
    SubscriptionId,
    "sub"
);

prefixed_id!(
    /// Identifier for a spawned agent (`agent_<hex>`).
    AgentId,
    "agent"
);

/// Provider-issued conversation identifier.
///
/// A fresh session id is returned on every completion turn; the previous
/// one is only valid as the *input* to the next turn (invariant I5).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// View as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
