//! The event router: dispatch, correlation, history.
//!
//! # Locking
//!
//! All routing state sits behind `std::sync` locks that are only held for
//! lookup/insert; matching handler lists are snapshotted and the locks
//! released before any handler is awaited. Correlation waiters are
//! `oneshot` channels — single-shot by construction
//! (`Pending → Resolved | TimedOut | Cancelled`).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use ksi_core::{ErrorCode, ErrorEnvelope, SubscriptionId, namespace_of};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::error::EventResult;
use crate::handler::{EventContext, EventEmitter, EventHandler};
use crate::hierarchy::{AgentHierarchy, ObservationSink};
use crate::record::EventRecord;
use crate::schema::SchemaValidator;
use crate::stats::{BusStats, StatsSnapshot};
use crate::subscription::Subscription;
use crate::{DEFAULT_CORRELATION_TIMEOUT_SECS, DEFAULT_MAX_HISTORY};

/// Event name used for hierarchical observation delivery to ancestors.
pub(crate) const ANCESTOR_OBSERVATION_EVENT: &str = "agent:observation";

/// Options for a single emit.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    /// Source component (`"unix"`, a plugin name, ...).
    pub source: String,
    /// Correlation id binding this emit to a response.
    pub correlation_id: Option<String>,
    /// Wait for a correlated response (up to the timeout).
    pub expect_response: bool,
    /// Per-call timeout override.
    pub timeout: Option<Duration>,
    /// Id of the event that caused this one.
    pub parent_id: Option<String>,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl EmitOptions {
    /// Options with source `"unknown"` and no response expected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            source: "unknown".to_string(),
            correlation_id: None,
            expect_response: false,
            timeout: None,
            parent_id: None,
        }
    }

    /// Set the source component.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    /// Wait for a correlated response.
    #[must_use]
    pub fn expect_response(mut self) -> Self {
        self.expect_response = true;
        self
    }

    /// Override the correlation timeout for this call.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Record the causing event's id.
    #[must_use]
    pub fn parent_id(mut self, id: impl Into<String>) -> Self {
        self.parent_id = Some(id.into());
        self
    }
}

/// A handler bound to an exact event name through the plugin registry.
pub struct HandlerBinding {
    /// Event name this handler answers.
    pub event: String,
    /// Qualified handler name recorded in `handlers_called`.
    pub name: String,
    /// Owning plugin, for bulk unregistration on reload.
    pub owner: String,
    /// Dispatch priority; lower runs first (default 100).
    pub priority: i32,
    /// The handler.
    pub handler: Arc<dyn EventHandler>,
}

impl HandlerBinding {
    /// Create a binding with the default priority.
    #[must_use]
    pub fn new(
        event: impl Into<String>,
        name: impl Into<String>,
        owner: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            event: event.into(),
            name: name.into(),
            owner: owner.into(),
            priority: 100,
            handler,
        }
    }

    /// Set the dispatch priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Clone)]
struct RegisteredHandler {
    name: String,
    owner: String,
    priority: i32,
    seq: u64,
    handler: Arc<dyn EventHandler>,
}

/// Shared router state. Public API lives on [`EventRouter`].
pub(crate) struct RouterInner {
    handlers: RwLock<HashMap<String, Vec<RegisteredHandler>>>,
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    /// Secondary list of wildcard subscriptions, checked for every event.
    wildcard_subs: RwLock<Vec<Arc<Subscription>>>,
    namespace_index: RwLock<HashMap<String, HashSet<SubscriptionId>>>,
    correlations: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    schemas: RwLock<HashMap<String, SchemaValidator>>,
    history: Mutex<VecDeque<EventRecord>>,
    max_history: usize,
    correlation_timeout: Duration,
    stats: BusStats,
    hierarchy: RwLock<Option<Arc<dyn AgentHierarchy>>>,
    observation: RwLock<Option<Arc<dyn ObservationSink>>>,
    seq: AtomicU64,
}

/// Central event router. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventRouter {
    pub(crate) inner: Arc<RouterInner>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("max_history", &self.inner.max_history)
            .field("correlation_timeout", &self.inner.correlation_timeout)
            .finish_non_exhaustive()
    }
}

struct DispatchOutcome {
    handlers_called: Vec<String>,
    first_result: Option<Value>,
    first_error: Option<(String, String)>,
}

impl EventRouter {
    /// Create a router with the given history bound and the default
    /// correlation timeout.
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self::with_timeout(
            max_history,
            Duration::from_secs(DEFAULT_CORRELATION_TIMEOUT_SECS),
        )
    }

    /// Create a router with explicit history bound and timeout.
    #[must_use]
    pub fn with_timeout(max_history: usize, correlation_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                handlers: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                wildcard_subs: RwLock::new(Vec::new()),
                namespace_index: RwLock::new(HashMap::new()),
                correlations: Mutex::new(HashMap::new()),
                schemas: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                max_history: max_history.max(1),
                correlation_timeout,
                stats: BusStats::default(),
                hierarchy: RwLock::new(None),
                observation: RwLock::new(None),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Default router (history bound [`DEFAULT_MAX_HISTORY`]).
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }

    /// The configured correlation timeout.
    #[must_use]
    pub fn correlation_timeout(&self) -> Duration {
        self.inner.correlation_timeout
    }

    /// A weak emitter handle for plugins and background tasks.
    #[must_use]
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register the agent-hierarchy hook for ancestor routing.
    pub fn set_hierarchy(&self, hierarchy: Arc<dyn AgentHierarchy>) {
        *self
            .inner
            .hierarchy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hierarchy);
    }

    /// Register the observation sink consulted on every event.
    pub fn set_observation_sink(&self, sink: Arc<dyn ObservationSink>) {
        *self
            .inner
            .observation
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    // -----------------------------------------------------------------
    // Handler registration
    // -----------------------------------------------------------------

    /// Register a handler for an exact event name.
    ///
    /// Handlers run in ascending priority; ties break by registration
    /// order.
    pub fn register_handler(&self, binding: HandlerBinding) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let registered = RegisteredHandler {
            name: binding.name,
            owner: binding.owner,
            priority: binding.priority,
            seq,
            handler: binding.handler,
        };
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = handlers.entry(binding.event.clone()).or_default();
        entry.push(registered);
        entry.sort_by_key(|h| (h.priority, h.seq));
        debug!(event = %binding.event, "handler registered");
    }

    /// Remove every handler owned by `owner`. Returns how many were
    /// removed.
    pub fn unregister_handlers_of(&self, owner: &str) -> usize {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0usize;
        for entry in handlers.values_mut() {
            let before = entry.len();
            entry.retain(|h| h.owner != owner);
            removed = removed.saturating_add(before.saturating_sub(entry.len()));
        }
        handlers.retain(|_, entry| !entry.is_empty());
        removed
    }

    /// Event names that currently have at least one handler.
    #[must_use]
    pub fn handled_events(&self) -> Vec<String> {
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        handlers.keys().cloned().collect()
    }

    // -----------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------

    /// Subscribe to event patterns.
    ///
    /// Patterns are compiled once; wildcard patterns go to a secondary
    /// list that is checked for every event.
    ///
    /// # Errors
    ///
    /// Returns an error if a wildcard pattern does not compile.
    pub fn subscribe(
        &self,
        subscriber: impl Into<String>,
        patterns: &[String],
        handler: Arc<dyn EventHandler>,
        namespace: Option<String>,
    ) -> EventResult<SubscriptionId> {
        let subscription = Arc::new(Subscription::new(
            subscriber,
            patterns,
            handler,
            namespace.clone(),
        )?);
        let id = subscription.id.clone();

        if subscription.has_wildcards() {
            self.inner
                .wildcard_subs
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(&subscription));
        }
        if let Some(ns) = namespace {
            self.inner
                .namespace_index
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(ns)
                .or_default()
                .insert(id.clone());
        }
        debug!(
            subscriber = %subscription.subscriber,
            patterns = ?subscription.patterns,
            id = %id,
            "subscribed"
        );
        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), subscription);
        Ok(id)
    }

    /// Remove a subscription. Returns `false` if the id is unknown.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(subscription) = removed else {
            return false;
        };
        if let Some(ns) = &subscription.namespace {
            let mut index = self
                .inner
                .namespace_index
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(set) = index.get_mut(ns) {
                set.remove(id);
            }
        }
        self.inner
            .wildcard_subs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id != *id);
        debug!(id = %id, "unsubscribed");
        true
    }

    /// Remove every subscription owned by `subscriber` (connection
    /// teardown). Returns how many were removed.
    pub fn unsubscribe_owner(&self, subscriber: &str) -> usize {
        let ids: Vec<SubscriptionId> = {
            let subs = self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subs.values()
                .filter(|s| s.subscriber == subscriber)
                .map(|s| s.id.clone())
                .collect()
        };
        let mut removed = 0usize;
        for id in &ids {
            if self.unsubscribe(id) {
                removed = removed.saturating_add(1);
            }
        }
        removed
    }

    // -----------------------------------------------------------------
    // Schemas & correlation
    // -----------------------------------------------------------------

    /// Register a validator for an event name.
    pub fn register_schema(&self, event_name: impl Into<String>, validator: SchemaValidator) {
        self.inner
            .schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_name.into(), validator);
    }

    /// Resolve a pending correlation with a value.
    ///
    /// Returns `true` if a waiter existed and was resolved. Single-shot:
    /// the waiter is consumed.
    pub fn resolve(&self, correlation_id: &str, value: Value) -> bool {
        let sender = self
            .inner
            .correlations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id);
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Cancel every pending correlation (daemon shutdown). Waiters
    /// observe a `CANCELLED` error result. Returns how many were
    /// cancelled.
    pub fn cancel_all_correlations(&self) -> usize {
        let mut correlations = self
            .inner
            .correlations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = correlations.len();
        correlations.clear();
        count
    }

    // -----------------------------------------------------------------
    // Emit
    // -----------------------------------------------------------------

    /// Emit an event to all matching handlers and subscriptions.
    ///
    /// Returns the first non-nil handler result. With
    /// `expect_response`, waits up to the correlation timeout and returns
    /// either the resolved value or a `TIMEOUT`/`CANCELLED` error result.
    pub async fn emit(
        &self,
        event_name: &str,
        data: Value,
        options: EmitOptions,
    ) -> Option<Value> {
        let event_id = Uuid::new_v4().to_string();
        let mut record = EventRecord::new(
            event_id.clone(),
            event_name,
            options.source.clone(),
            data.clone(),
        );
        record.correlation_id = options.correlation_id.clone();
        record.parent_id = options.parent_id.clone();

        self.inner.stats.emitted();
        trace!(event = event_name, source = %options.source, "emitting event");

        // Validate against a registered schema, if any.
        if let Some(validator) = self.schema_for(event_name) {
            if let Err(message) = validator(&data) {
                warn!(event = event_name, %message, "event validation failed");
                record.error = Some(format!("Validation error: {message}"));
                self.push_history(record);
                self.inner.stats.failed();
                return Some(ErrorEnvelope::new(ErrorCode::Validation, message).to_value());
            }
        }

        // Set up the correlation waiter before dispatch so a handler can
        // resolve it mid-flight.
        let corr_key = options
            .correlation_id
            .clone()
            .unwrap_or_else(|| event_id.clone());
        let waiter = if options.expect_response {
            let (tx, rx) = oneshot::channel();
            self.inner
                .correlations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(corr_key.clone(), tx);
            Some(rx)
        } else {
            None
        };

        if let Some(sink) = self.observation_sink() {
            sink.event_begin(&record);
        }

        let outcome = self.dispatch(event_name, &data, &event_id, &options).await;
        record.handlers_called = outcome.handlers_called;
        if !record.handlers_called.is_empty() {
            self.inner.stats.handled();
        }

        let mut primary = outcome.first_result;

        // Handler errors surface only when no peer produced a result.
        if primary.is_none() {
            if let Some((handler_name, message)) = outcome.first_error {
                record.error = Some(message.clone());
                self.inner.stats.failed();
                primary = Some(
                    ErrorEnvelope::new(ErrorCode::HandlerError, message)
                        .with_handler(handler_name)
                        .to_value(),
                );
            }
        }

        // `<event>:response` convergence: emitting a response event with
        // the original correlation id resolves that waiter directly.
        if options.correlation_id.is_some() && event_name.ends_with(":response") {
            self.resolve(&corr_key, data.clone());
        }

        // First non-nil result resolves the correlation.
        if let Some(result) = &primary {
            self.resolve(&corr_key, result.clone());
        }

        record.result = primary.clone();
        if let Some(sink) = self.observation_sink() {
            sink.event_end(&record);
        }

        // Hierarchical routing to agent ancestors, off the dispatch path.
        self.route_to_ancestors(event_name, &data, &event_id);

        let final_result = if let Some(rx) = waiter {
            let timeout = options.timeout.unwrap_or(self.inner.correlation_timeout);
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(value)) => {
                    record.result = Some(value.clone());
                    Some(value)
                },
                Ok(Err(_)) => {
                    record.error = Some("Cancelled".to_string());
                    Some(
                        ErrorEnvelope::new(ErrorCode::Cancelled, "correlation cancelled")
                            .to_value(),
                    )
                },
                Err(_) => {
                    warn!(event = event_name, "timeout waiting for response");
                    record.error = Some("Response timeout".to_string());
                    Some(ErrorEnvelope::new(ErrorCode::Timeout, "Response timeout").to_value())
                },
            }
        } else {
            primary
        };

        // Clean up a still-pending waiter (timeout path).
        self.inner
            .correlations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&corr_key);

        self.push_history(record);
        final_result
    }

    async fn dispatch(
        &self,
        event_name: &str,
        data: &Value,
        event_id: &str,
        options: &EmitOptions,
    ) -> DispatchOutcome {
        let ctx = EventContext {
            event_id: event_id.to_string(),
            source: options.source.clone(),
            correlation_id: options.correlation_id.clone(),
            emitter: self.emitter(),
        };

        // Snapshot matching handlers under brief locks; release before
        // any await.
        let handlers: Vec<RegisteredHandler> = {
            let map = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            map.get(event_name).cloned().unwrap_or_default()
        };

        let subscriptions = self.matching_subscriptions(event_name);

        let mut outcome = DispatchOutcome {
            handlers_called: Vec::new(),
            first_result: None,
            first_error: None,
        };

        for registered in handlers {
            match registered.handler.handle(event_name, data, &ctx).await {
                Ok(Some(value)) => {
                    outcome.handlers_called.push(registered.name.clone());
                    if outcome.first_result.is_none() {
                        outcome.first_result = Some(value);
                    }
                },
                Ok(None) => outcome.handlers_called.push(registered.name.clone()),
                Err(e) => {
                    error!(
                        event = event_name,
                        handler = %registered.name,
                        owner = %registered.owner,
                        error = %e,
                        "handler error"
                    );
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some((registered.name.clone(), e.to_string()));
                    }
                },
            }
        }

        for subscription in subscriptions {
            match subscription.handler.handle(event_name, data, &ctx).await {
                Ok(Some(value)) => {
                    outcome
                        .handlers_called
                        .push(subscription.subscriber.clone());
                    if outcome.first_result.is_none() {
                        outcome.first_result = Some(value);
                    }
                },
                Ok(None) => outcome
                    .handlers_called
                    .push(subscription.subscriber.clone()),
                Err(e) => {
                    error!(
                        event = event_name,
                        subscriber = %subscription.subscriber,
                        error = %e,
                        "subscription handler error"
                    );
                    if outcome.first_error.is_none() {
                        outcome.first_error =
                            Some((subscription.subscriber.clone(), e.to_string()));
                    }
                },
            }
        }

        outcome
    }

    /// Collect matching subscriptions: exact ∪ namespace ∪ wildcard, each
    /// at most once, wildcards last.
    fn matching_subscriptions(&self, event_name: &str) -> Vec<Arc<Subscription>> {
        let mut seen: HashSet<SubscriptionId> = HashSet::new();
        let mut matched: Vec<Arc<Subscription>> = Vec::new();

        {
            let subs = self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for subscription in subs.values() {
                if subscription.matches_exact(event_name)
                    && seen.insert(subscription.id.clone())
                {
                    matched.push(Arc::clone(subscription));
                }
            }

            if let Some(ns) = namespace_of(event_name) {
                let index = self
                    .inner
                    .namespace_index
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(ids) = index.get(ns) {
                    for id in ids {
                        if let Some(subscription) = subs.get(id) {
                            if seen.insert(subscription.id.clone()) {
                                matched.push(Arc::clone(subscription));
                            }
                        }
                    }
                }
            }
        }

        let wildcards: Vec<Arc<Subscription>> = self
            .inner
            .wildcard_subs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscription in wildcards {
            if subscription.matches_wildcard(event_name) && seen.insert(subscription.id.clone())
            {
                matched.push(subscription);
            }
        }

        matched
    }

    fn route_to_ancestors(&self, event_name: &str, data: &Value, event_id: &str) {
        if event_name == ANCESTOR_OBSERVATION_EVENT || event_name.starts_with("observe:") {
            return;
        }
        let Some(agent_id) = data.get("_agent_id").and_then(Value::as_str) else {
            return;
        };
        let hierarchy = {
            let guard = self
                .inner
                .hierarchy
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };
        let Some(hierarchy) = hierarchy else {
            return;
        };

        for ancestor in hierarchy.ancestors(agent_id) {
            if !ancestor.observes() {
                continue;
            }
            let emitter = self.emitter();
            let payload = serde_json::json!({
                "observer": ancestor.agent_id,
                "source_agent": agent_id,
                "event": event_name,
                "data": data,
                "depth": ancestor.depth,
            });
            let parent = event_id.to_string();
            tokio::spawn(async move {
                let _ = emitter
                    .emit(
                        ANCESTOR_OBSERVATION_EVENT,
                        payload,
                        EmitOptions::new().source("router").parent_id(parent),
                    )
                    .await;
            });
        }
    }

    // -----------------------------------------------------------------
    // History & stats
    // -----------------------------------------------------------------

    fn push_history(&self, record: EventRecord) {
        let mut history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        history.push_back(record);
        while history.len() > self.inner.max_history {
            history.pop_front();
        }
    }

    /// Snapshot of records matching the given name patterns, newest last,
    /// truncated to `limit` (most recent kept).
    #[must_use]
    pub fn recent(&self, patterns: Option<&[String]>, limit: usize) -> Vec<EventRecord> {
        let matchers: Option<Vec<globset::GlobMatcher>> = patterns.map(|ps| {
            ps.iter()
                .filter_map(|p| globset::Glob::new(p).ok())
                .map(|g| g.compile_matcher())
                .collect()
        });
        let history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<EventRecord> = history
            .iter()
            .filter(|r| match &matchers {
                Some(ms) => ms.iter().any(|m| m.is_match(&r.event_name)),
                None => true,
            })
            .cloned()
            .collect();
        if records.len() > limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }
        records
    }

    /// Walk the ring buffer, returning matching records.
    #[must_use]
    pub fn replay(&self, filter: Option<&dyn Fn(&EventRecord) -> bool>) -> Vec<EventRecord> {
        let history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .filter(|r| filter.is_none_or(|f| f(r)))
            .cloned()
            .collect()
    }

    /// Walk the ring buffer, re-invoking `handler` for each matching
    /// record. Handler errors are logged and skipped.
    pub async fn replay_with(
        &self,
        filter: Option<&dyn Fn(&EventRecord) -> bool>,
        handler: Arc<dyn EventHandler>,
    ) -> Vec<EventRecord> {
        let records = self.replay(filter);
        for record in &records {
            let ctx = EventContext {
                event_id: record.id.clone(),
                source: record.source.clone(),
                correlation_id: record.correlation_id.clone(),
                emitter: self.emitter(),
            };
            if let Err(e) = handler.handle(&record.event_name, &record.data, &ctx).await {
                error!(event = %record.event_name, error = %e, "error replaying event");
            }
        }
        records
    }

    /// Current history length.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop all history records.
    pub fn clear_history(&self) {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("event history cleared");
    }

    /// Point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_emitted: self.inner.stats.events_emitted.load(Ordering::Relaxed),
            events_handled: self.inner.stats.events_handled.load(Ordering::Relaxed),
            events_failed: self.inner.stats.events_failed.load(Ordering::Relaxed),
            active_subscriptions: self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            active_correlations: self
                .inner
                .correlations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            history_size: self.history_len(),
            registered_schemas: self
                .inner
                .schemas
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            pattern_subscriptions: self
                .inner
                .wildcard_subs
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    fn schema_for(&self, event_name: &str) -> Option<SchemaValidator> {
        self.inner
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .cloned()
    }

    fn observation_sink(&self) -> Option<Arc<dyn ObservationSink>> {
        self.inner
            .observation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::hierarchy::AncestorObserver;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn answer(value: Value) -> Arc<dyn EventHandler> {
        handler_fn(move |_, _, _| {
            let value = value.clone();
            async move { Ok(Some(value)) }
        })
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        handler_fn(move |_, _, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
    }

    #[tokio::test]
    async fn test_emit_returns_first_non_nil() {
        let router = EventRouter::new(100);
        router.register_handler(
            HandlerBinding::new("t:x", "silent", "p1", handler_fn(|_, _, _| async move {
                Ok(None)
            }))
            .priority(10),
        );
        router.register_handler(
            HandlerBinding::new("t:x", "first", "p2", answer(json!({"who": "first"})))
                .priority(20),
        );
        router.register_handler(
            HandlerBinding::new("t:x", "second", "p3", answer(json!({"who": "second"})))
                .priority(30),
        );

        let result = router
            .emit("t:x", json!({}), EmitOptions::new().source("test"))
            .await;
        assert_eq!(result.unwrap()["who"], "first");
    }

    #[tokio::test]
    async fn test_priority_order_with_ties() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let push = |tag: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
            let order = Arc::clone(order);
            handler_fn(move |_, _, _| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(tag);
                    Ok(None)
                }
            })
        };

        let router = EventRouter::new(100);
        router.register_handler(
            HandlerBinding::new("t:y", "late", "p", push("late", &order)).priority(200),
        );
        router.register_handler(
            HandlerBinding::new("t:y", "tie_a", "p", push("tie_a", &order)).priority(100),
        );
        router.register_handler(
            HandlerBinding::new("t:y", "tie_b", "p", push("tie_b", &order)).priority(100),
        );
        router.register_handler(
            HandlerBinding::new("t:y", "early", "p", push("early", &order)).priority(1),
        );

        router.emit("t:y", json!({}), EmitOptions::new()).await;
        assert_eq!(
            *order.lock().unwrap(),
            vec!["early", "tie_a", "tie_b", "late"]
        );
    }

    #[tokio::test]
    async fn test_all_handlers_called_despite_result() {
        let counter = Arc::new(AtomicUsize::new(0));
        let router = EventRouter::new(100);
        router.register_handler(
            HandlerBinding::new("t:z", "result", "p", answer(json!(1))).priority(1),
        );
        router.register_handler(
            HandlerBinding::new("t:z", "side_effect", "p", counting(Arc::clone(&counter)))
                .priority(2),
        );

        let result = router.emit("t:z", json!({}), EmitOptions::new()).await;
        assert_eq!(result, Some(json!(1)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pattern_subscription_delivery() {
        // "task:*" receives every task event and nothing else.
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let router = EventRouter::new(100);
        router
            .subscribe(
                "watcher",
                &["task:*".to_string()],
                handler_fn(move |event, _, _| {
                    let seen = Arc::clone(&seen_clone);
                    async move {
                        seen.lock().unwrap().push(event);
                        Ok(None)
                    }
                }),
                None,
            )
            .unwrap();

        router.emit("task:start", json!({}), EmitOptions::new()).await;
        router.emit("task:end", json!({}), EmitOptions::new()).await;
        router.emit("other:x", json!({}), EmitOptions::new()).await;

        assert_eq!(*seen.lock().unwrap(), vec!["task:start", "task:end"]);
    }

    #[tokio::test]
    async fn test_namespace_subscription() {
        let counter = Arc::new(AtomicUsize::new(0));
        let router = EventRouter::new(100);
        router
            .subscribe(
                "ns_watcher",
                &[],
                counting(Arc::clone(&counter)),
                Some("completion".to_string()),
            )
            .unwrap();

        router
            .emit("completion:async", json!({}), EmitOptions::new())
            .await;
        router.emit("agent:spawn", json!({}), EmitOptions::new()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscription_invoked_once_per_event() {
        // Overlapping exact + wildcard patterns on one subscription.
        let counter = Arc::new(AtomicUsize::new(0));
        let router = EventRouter::new(100);
        router
            .subscribe(
                "overlap",
                &["task:start".to_string(), "task:*".to_string()],
                counting(Arc::clone(&counter)),
                None,
            )
            .unwrap();

        router.emit("task:start", json!({}), EmitOptions::new()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_owner() {
        let counter = Arc::new(AtomicUsize::new(0));
        let router = EventRouter::new(100);
        router
            .subscribe("conn_1", &["a:*".to_string()], counting(Arc::clone(&counter)), None)
            .unwrap();
        router
            .subscribe("conn_1", &["b:*".to_string()], counting(Arc::clone(&counter)), None)
            .unwrap();
        router
            .subscribe("conn_2", &["a:*".to_string()], counting(Arc::clone(&counter)), None)
            .unwrap();

        assert_eq!(router.unsubscribe_owner("conn_1"), 2);
        router.emit("a:x", json!({}), EmitOptions::new()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_history_bound() {
        // After M emits, len(history) == min(M, max_history).
        let router = EventRouter::new(5);
        for i in 0..3 {
            router.emit("h:x", json!({"i": i}), EmitOptions::new()).await;
        }
        assert_eq!(router.history_len(), 3);
        for i in 0..10 {
            router.emit("h:x", json!({"i": i}), EmitOptions::new()).await;
        }
        assert_eq!(router.history_len(), 5);
    }

    #[tokio::test]
    async fn test_timeout_when_unhandled() {
        // No handler matches; the caller gets a TIMEOUT error
        // result and the record shows handlers_called == [].
        let router =
            EventRouter::with_timeout(100, Duration::from_millis(50));
        let result = router
            .emit(
                "nosuch:event",
                json!({}),
                EmitOptions::new().expect_response(),
            )
            .await
            .unwrap();
        assert_eq!(result["error"]["code"], "TIMEOUT");
        assert_eq!(result["error"]["message"], "Response timeout");

        let records = router.replay(Some(&|r: &EventRecord| r.event_name == "nosuch:event"));
        assert_eq!(records.len(), 1);
        assert!(records[0].handlers_called.is_empty());
        assert_eq!(records[0].error.as_deref(), Some("Response timeout"));
    }

    #[tokio::test]
    async fn test_expect_response_resolves_from_handler() {
        // The waiter resolves exactly once, with the handler value.
        let router = EventRouter::new(100);
        router.register_handler(HandlerBinding::new(
            "q:ask",
            "answerer",
            "p",
            answer(json!({"answer": 42})),
        ));
        let result = router
            .emit(
                "q:ask",
                json!({}),
                EmitOptions::new()
                    .correlation_id(Some("corr-1".to_string()))
                    .expect_response(),
            )
            .await
            .unwrap();
        assert_eq!(result["answer"], 42);
        // The waiter was consumed: resolving again finds nothing.
        assert!(!router.resolve("corr-1", json!({"late": true})));
    }

    #[tokio::test]
    async fn test_response_event_convergence() {
        // A handler replies later by emitting "<event>:response" with the
        // original correlation id.
        let router = EventRouter::new(100);
        let emitter = router.emitter();
        router.register_handler(HandlerBinding::new(
            "slow:op",
            "slow_worker",
            "p",
            handler_fn(move |_, _, ctx| {
                let emitter = ctx.emitter.clone();
                let corr = ctx.correlation_id.clone();
                async move {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        let _ = emitter
                            .emit(
                                "slow:op:response",
                                json!({"done": true}),
                                EmitOptions::new().correlation_id(corr),
                            )
                            .await;
                    });
                    Ok(None)
                }
            }),
        ));
        drop(emitter);

        let result = router
            .emit(
                "slow:op",
                json!({}),
                EmitOptions::new()
                    .correlation_id(Some("corr-slow".to_string()))
                    .expect_response()
                    .timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(result["done"], true);
    }

    #[tokio::test]
    async fn test_handler_error_surfaces_without_peer_result() {
        let router = EventRouter::new(100);
        router.register_handler(HandlerBinding::new(
            "bad:op",
            "broken",
            "p",
            handler_fn(|_, _, _| async move {
                Err(crate::EventError::Handler("boom".to_string()))
            }),
        ));
        let result = router.emit("bad:op", json!({}), EmitOptions::new()).await.unwrap();
        assert_eq!(result["error"]["code"], "HANDLER_ERROR");
        assert_eq!(result["error"]["handler"], "broken");
    }

    #[tokio::test]
    async fn test_handler_error_hidden_by_peer_result() {
        let router = EventRouter::new(100);
        router.register_handler(
            HandlerBinding::new("mixed:op", "broken", "p", handler_fn(|_, _, _| async move {
                Err(crate::EventError::Handler("boom".to_string()))
            }))
            .priority(1),
        );
        router.register_handler(
            HandlerBinding::new("mixed:op", "ok", "p", answer(json!({"ok": true})))
                .priority(2),
        );
        let result = router.emit("mixed:op", json!({}), EmitOptions::new()).await.unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn test_schema_validation_rejects() {
        let router = EventRouter::new(100);
        router.register_schema("strict:op", crate::require_fields(&["prompt"]));
        router.register_handler(HandlerBinding::new(
            "strict:op",
            "h",
            "p",
            answer(json!({"ran": true})),
        ));
        let result = router
            .emit("strict:op", json!({"model": "x"}), EmitOptions::new())
            .await
            .unwrap();
        assert_eq!(result["error"]["code"], "VALIDATION");
        // The handler never ran.
        let records = router.replay(Some(&|r: &EventRecord| r.event_name == "strict:op"));
        assert!(records[0].handlers_called.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_correlations() {
        let router = EventRouter::with_timeout(100, Duration::from_secs(5));
        let emit_router = router.clone();
        let pending = tokio::spawn(async move {
            emit_router
                .emit(
                    "never:answered",
                    json!({}),
                    EmitOptions::new().expect_response(),
                )
                .await
        });
        // Let the emit register its waiter.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.cancel_all_correlations(), 1);
        let result = pending.await.unwrap().unwrap();
        assert_eq!(result["error"]["code"], "CANCELLED");
    }

    struct StaticHierarchy {
        ancestors: Vec<AncestorObserver>,
    }

    impl AgentHierarchy for StaticHierarchy {
        fn ancestors(&self, _agent_id: &str) -> Vec<AncestorObserver> {
            self.ancestors.clone()
        }
    }

    #[tokio::test]
    async fn test_hierarchical_routing_levels() {
        // Parent (level 1) observes depth-1 events; grandparent with
        // level 1 does not observe depth-2 events.
        let router = EventRouter::new(100);
        router.set_hierarchy(Arc::new(StaticHierarchy {
            ancestors: vec![
                AncestorObserver {
                    agent_id: "agent_parent".to_string(),
                    subscription_level: 1,
                    depth: 1,
                },
                AncestorObserver {
                    agent_id: "agent_grandparent".to_string(),
                    subscription_level: 1,
                    depth: 2,
                },
            ],
        }));

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        router.register_handler(HandlerBinding::new(
            ANCESTOR_OBSERVATION_EVENT,
            "observation_collector",
            "p",
            handler_fn(move |_, data, _| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    if let Some(observer) = data.get("observer").and_then(Value::as_str) {
                        seen.lock().unwrap().push(observer.to_string());
                    }
                    Ok(None)
                }
            }),
        ));

        router
            .emit(
                "worker:progress",
                json!({"_agent_id": "agent_child", "step": 1}),
                EmitOptions::new(),
            )
            .await;
        // Observation delivery is spawned; give it a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let observed = seen.lock().unwrap().clone();
        assert_eq!(observed, vec!["agent_parent".to_string()]);
    }

    #[tokio::test]
    async fn test_recent_filters_and_limits() {
        let router = EventRouter::new(100);
        for i in 0..5 {
            router.emit("a:x", json!({"i": i}), EmitOptions::new()).await;
        }
        router.emit("b:y", json!({}), EmitOptions::new()).await;

        let all = router.recent(None, 100);
        assert_eq!(all.len(), 6);

        let only_a = router.recent(Some(&["a:*".to_string()]), 2);
        assert_eq!(only_a.len(), 2);
        assert_eq!(only_a[1].data["i"], 4);
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let router = EventRouter::new(100);
        router.register_handler(HandlerBinding::new("s:ok", "h", "p", answer(json!(1))));
        router.emit("s:ok", json!({}), EmitOptions::new()).await;
        router.emit("s:miss", json!({}), EmitOptions::new()).await;

        let stats = router.stats();
        assert_eq!(stats.events_emitted, 2);
        assert_eq!(stats.events_handled, 1);
        assert_eq!(stats.history_size, 2);
    }

    #[tokio::test]
    async fn test_emitter_outlives_router_safely() {
        let router = EventRouter::new(100);
        let emitter = router.emitter();
        drop(router);
        let err = emitter.emit("x:y", json!({}), EmitOptions::new()).await;
        assert!(matches!(err, Err(crate::EventError::BusClosed)));
    }
}
