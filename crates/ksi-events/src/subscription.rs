//! Pattern-based subscriptions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use ksi_core::SubscriptionId;

use crate::error::{EventError, EventResult};
use crate::handler::EventHandler;

/// An observer-style listener, matched by exact name, glob pattern, or
/// namespace equality. Separate from handler dispatch.
pub struct Subscription {
    /// Subscription id (`sub_<hex>`).
    pub id: SubscriptionId,
    /// Owning component (used for bulk teardown on disconnect).
    pub subscriber: String,
    /// Raw patterns as supplied.
    pub patterns: Vec<String>,
    /// Compiled matchers for the wildcard patterns.
    pub(crate) matchers: Vec<GlobMatcher>,
    /// Namespace to match when set.
    pub namespace: Option<String>,
    /// Handler invoked for matching events.
    pub(crate) handler: Arc<dyn EventHandler>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subscriber", &self.subscriber)
            .field("patterns", &self.patterns)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Build a subscription, compiling wildcard patterns once.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`] if a wildcard pattern does
    /// not compile.
    pub(crate) fn new(
        subscriber: impl Into<String>,
        patterns: &[String],
        handler: Arc<dyn EventHandler>,
        namespace: Option<String>,
    ) -> EventResult<Self> {
        let mut matchers = Vec::new();
        for pattern in patterns {
            if pattern.contains('*') {
                let glob = Glob::new(pattern).map_err(|e| EventError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
                matchers.push(glob.compile_matcher());
            }
        }
        Ok(Self {
            id: SubscriptionId::generate(),
            subscriber: subscriber.into(),
            patterns: patterns.to_vec(),
            matchers,
            namespace,
            handler,
            created_at: Utc::now(),
        })
    }

    /// Whether this subscription has any wildcard patterns.
    #[must_use]
    pub fn has_wildcards(&self) -> bool {
        !self.matchers.is_empty()
    }

    /// Exact-name membership in `patterns`.
    #[must_use]
    pub fn matches_exact(&self, event_name: &str) -> bool {
        self.patterns.iter().any(|p| p == event_name)
    }

    /// Glob match against the compiled wildcard patterns.
    #[must_use]
    pub fn matches_wildcard(&self, event_name: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(event_name))
    }

    /// Namespace-equality match.
    #[must_use]
    pub fn matches_namespace(&self, event_name: &str) -> bool {
        self.namespace
            .as_deref()
            .is_some_and(|ns| ksi_core::matches_namespace(event_name, ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn noop() -> Arc<dyn EventHandler> {
        handler_fn(|_, _, _| async move { Ok(None) })
    }

    #[test]
    fn test_exact_match() {
        let sub =
            Subscription::new("t", &["task:start".to_string()], noop(), None).unwrap();
        assert!(sub.matches_exact("task:start"));
        assert!(!sub.matches_exact("task:end"));
        assert!(!sub.has_wildcards());
    }

    #[test]
    fn test_wildcard_match() {
        let sub = Subscription::new("t", &["task:*".to_string()], noop(), None).unwrap();
        assert!(sub.has_wildcards());
        assert!(sub.matches_wildcard("task:start"));
        assert!(sub.matches_wildcard("task:end"));
        assert!(!sub.matches_wildcard("other:x"));
    }

    #[test]
    fn test_star_matches_all() {
        let sub = Subscription::new("t", &["*".to_string()], noop(), None).unwrap();
        assert!(sub.matches_wildcard("task:start"));
        assert!(sub.matches_wildcard("completion:result"));
    }

    #[test]
    fn test_namespace_match() {
        let sub =
            Subscription::new("t", &[], noop(), Some("completion".to_string())).unwrap();
        assert!(sub.matches_namespace("completion:async"));
        assert!(!sub.matches_namespace("agent:spawn"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = Subscription::new("t", &["task:[*".to_string()], noop(), None);
        assert!(matches!(result, Err(EventError::InvalidPattern { .. })));
    }
}
