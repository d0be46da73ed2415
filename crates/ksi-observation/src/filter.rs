//! Observation filters.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Content predicate on a field of the observed event's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentMatch {
    /// Dotted path into the payload (`"data.key"` style, without the
    /// leading `data.` — the lookup runs against the payload itself).
    pub field: String,
    /// Literal value for `equals`/`contains`.
    #[serde(default)]
    pub value: Option<Value>,
    /// Regex for `matches`.
    #[serde(default)]
    pub pattern: Option<String>,
    /// One of `equals`, `contains`, `matches`.
    #[serde(default = "default_operator")]
    pub operator: String,
}

fn default_operator() -> String {
    "equals".to_string()
}

/// Token-bucket style rate limit over a sliding window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum deliveries inside the window.
    pub max_events: usize,
    /// Window length in seconds.
    pub window_seconds: f64,
}

/// Declarative filter attached to an observation subscription.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ObservationFilter {
    /// Event-name globs that must match (empty = match all).
    #[serde(default)]
    pub include: Vec<String>,
    /// Event-name globs that must not match.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Optional content predicate.
    #[serde(default)]
    pub content_match: Option<ContentMatch>,
    /// Optional sliding-window rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    /// Optional delivery probability in `[0, 1]`.
    #[serde(default)]
    pub sampling_rate: Option<f64>,
}

/// A compiled filter with its mutable rate-limit window.
pub(crate) struct CompiledFilter {
    filter: ObservationFilter,
    include: Vec<GlobMatcher>,
    exclude: Vec<GlobMatcher>,
    window: Mutex<VecDeque<Instant>>,
}

fn compile(patterns: &[String]) -> Vec<GlobMatcher> {
    patterns
        .iter()
        .filter_map(|p| match Glob::new(p) {
            Ok(glob) => Some(glob.compile_matcher()),
            Err(e) => {
                warn!(pattern = %p, error = %e, "ignoring bad filter pattern");
                None
            },
        })
        .collect()
}

/// Dotted-path lookup into a JSON value.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

impl CompiledFilter {
    pub(crate) fn new(filter: ObservationFilter) -> Self {
        let include = compile(&filter.include);
        let exclude = compile(&filter.exclude);
        Self {
            filter,
            include,
            exclude,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Evaluate the filter for one event delivery. Mutates the
    /// rate-limit window when a limit is configured.
    pub(crate) fn admits(&self, event_name: &str, payload: &Value) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|m| m.is_match(event_name)) {
            return false;
        }
        if self.exclude.iter().any(|m| m.is_match(event_name)) {
            return false;
        }

        if let Some(content) = &self.filter.content_match {
            if !self.content_admits(content, payload) {
                return false;
            }
        }

        if let Some(rate) = &self.filter.sampling_rate {
            if rand::random::<f64>() >= rate.clamp(0.0, 1.0) {
                return false;
            }
        }

        if let Some(limit) = &self.filter.rate_limit {
            let window = Duration::from_secs_f64(limit.window_seconds.max(0.0));
            let now = Instant::now();
            let mut timestamps = self
                .window
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            while timestamps
                .front()
                .is_some_and(|t| now.duration_since(*t) > window)
            {
                timestamps.pop_front();
            }
            if timestamps.len() >= limit.max_events {
                return false;
            }
            timestamps.push_back(now);
        }

        true
    }

    fn content_admits(&self, content: &ContentMatch, payload: &Value) -> bool {
        let Some(found) = lookup(payload, &content.field) else {
            return false;
        };
        match content.operator.as_str() {
            "contains" => {
                let needle = content
                    .value
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                found.as_str().is_some_and(|s| s.contains(needle))
            },
            "matches" => {
                let Some(pattern) = &content.pattern else {
                    return false;
                };
                match regex::Regex::new(pattern) {
                    Ok(re) => found.as_str().is_some_and(|s| re.is_match(s)),
                    Err(e) => {
                        warn!(pattern = %pattern, error = %e, "bad content_match regex");
                        false
                    },
                }
            },
            // "equals" and anything unknown fall back to equality.
            _ => content.value.as_ref() == Some(found),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(value: Value) -> CompiledFilter {
        CompiledFilter::new(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_empty_filter_admits_all() {
        let f = filter(json!({}));
        assert!(f.admits("any:event", &json!({})));
    }

    #[test]
    fn test_include_exclude() {
        let f = filter(json!({"include": ["task:*"], "exclude": ["task:noise"]}));
        assert!(f.admits("task:start", &json!({})));
        assert!(!f.admits("task:noise", &json!({})));
        assert!(!f.admits("other:x", &json!({})));
    }

    #[test]
    fn test_content_equals_and_contains() {
        let eq = filter(json!({"content_match": {"field": "status", "value": "done"}}));
        assert!(eq.admits("t:x", &json!({"status": "done"})));
        assert!(!eq.admits("t:x", &json!({"status": "busy"})));
        assert!(!eq.admits("t:x", &json!({})));

        let contains = filter(json!({
            "content_match": {"field": "text", "value": "err", "operator": "contains"}
        }));
        assert!(contains.admits("t:x", &json!({"text": "an error here"})));
        assert!(!contains.admits("t:x", &json!({"text": "all fine"})));
    }

    #[test]
    fn test_content_matches_regex_and_nested_field() {
        let f = filter(json!({
            "content_match": {"field": "result.state", "pattern": "^ok", "operator": "matches"}
        }));
        assert!(f.admits("t:x", &json!({"result": {"state": "ok: 3"}})));
        assert!(!f.admits("t:x", &json!({"result": {"state": "failed"}})));
    }

    #[test]
    fn test_rate_limit_window() {
        let f = filter(json!({"rate_limit": {"max_events": 2, "window_seconds": 60.0}}));
        assert!(f.admits("t:x", &json!({})));
        assert!(f.admits("t:x", &json!({})));
        assert!(!f.admits("t:x", &json!({})));
    }

    #[test]
    fn test_sampling_extremes() {
        let never = filter(json!({"sampling_rate": 0.0}));
        assert!(!never.admits("t:x", &json!({})));
        let always = filter(json!({"sampling_rate": 1.0}));
        assert!(always.admits("t:x", &json!({})));
    }
}
