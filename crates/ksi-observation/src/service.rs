//! Observation subscriptions and the router sink.
//!
//! The sink methods are called synchronously on the dispatch path; they
//! only push the record onto an unbounded channel. A single worker task
//! evaluates subscriptions, emits `observe:begin`/`observe:end` pairs,
//! and appends deliveries to async-state history. Delivery to a given
//! subscription is therefore FIFO.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use globset::{Glob, GlobMatcher};
use ksi_core::{ErrorCode, ErrorEnvelope, SubscriptionId};
use ksi_events::{EmitOptions, EventEmitter, EventRecord, ObservationSink, handler_fn};
use ksi_plugins::{HandlerRegistration, HandlerSpec, KsiPlugin, Param, ParamType};
use ksi_state::AsyncStateStore;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::HISTORY_QUEUE;
use crate::analyze;
use crate::error::{ObservationError, ObservationResult};
use crate::filter::{CompiledFilter, ObservationFilter};

const SOURCE: &str = "observation_service";
/// Cap on replay inter-event delay, regardless of recorded gaps.
const MAX_REPLAY_GAP: Duration = Duration::from_secs(5);

struct ObsSubscription {
    id: SubscriptionId,
    observer: String,
    target: String,
    events: Vec<String>,
    matchers: Vec<GlobMatcher>,
    filter: CompiledFilter,
    raw_filter: ObservationFilter,
}

impl ObsSubscription {
    fn matches_event(&self, event_name: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(event_name))
    }

    fn matches_target(&self, source_agent: &str) -> bool {
        self.target == "*" || self.target == source_agent
    }
}

enum ObsTask {
    Begin(EventRecord),
    End(EventRecord),
}

/// Records filtered observations and serves history queries.
pub struct ObservationService {
    emitter: EventEmitter,
    store: Arc<AsyncStateStore>,
    subscriptions: DashMap<String, Arc<ObsSubscription>>,
    /// `observation_id → subscription ids` admitted at begin, consumed
    /// at end so both halves of a pair obey one filter decision.
    admitted: Mutex<HashMap<String, Vec<String>>>,
    tx: mpsc::UnboundedSender<ObsTask>,
}

impl std::fmt::Debug for ObservationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationService")
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl ObservationService {
    /// Create the service and spawn its delivery worker.
    #[must_use]
    pub fn new(emitter: EventEmitter, store: Arc<AsyncStateStore>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            emitter,
            store,
            subscriptions: DashMap::new(),
            admitted: Mutex::new(HashMap::new()),
            tx,
        });
        tokio::spawn(Self::run_worker(Arc::downgrade(&service), rx));
        service
    }

    async fn run_worker(
        service: Weak<ObservationService>,
        mut rx: mpsc::UnboundedReceiver<ObsTask>,
    ) {
        while let Some(task) = rx.recv().await {
            let Some(service) = service.upgrade() else {
                break;
            };
            match task {
                ObsTask::Begin(record) => service.deliver_begin(&record).await,
                ObsTask::End(record) => service.deliver_end(&record).await,
            }
        }
        debug!("observation worker exiting");
    }

    /// Register a subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if an event pattern does not compile.
    pub fn subscribe(
        &self,
        observer: impl Into<String>,
        target: impl Into<String>,
        events: &[String],
        filter: ObservationFilter,
    ) -> ObservationResult<SubscriptionId> {
        let mut matchers = Vec::new();
        for pattern in events {
            let glob = Glob::new(pattern).map_err(|e| ObservationError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            matchers.push(glob.compile_matcher());
        }
        let subscription = Arc::new(ObsSubscription {
            id: SubscriptionId::generate(),
            observer: observer.into(),
            target: target.into(),
            events: events.to_vec(),
            matchers,
            raw_filter: filter.clone(),
            filter: CompiledFilter::new(filter),
        });
        let id = subscription.id.clone();
        debug!(
            id = %id,
            observer = %subscription.observer,
            target = %subscription.target,
            "observation subscription added"
        );
        self.subscriptions.insert(id.0.clone(), subscription);
        Ok(id)
    }

    /// Remove a subscription. Returns `true` if it existed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    /// Snapshot of registered subscriptions.
    #[must_use]
    pub fn list(&self) -> Vec<Value> {
        self.subscriptions
            .iter()
            .map(|entry| {
                json!({
                    "id": entry.id,
                    "observer": entry.observer,
                    "target": entry.target,
                    "events": entry.events,
                    "filter": entry.raw_filter,
                })
            })
            .collect()
    }

    fn source_agent(record: &EventRecord) -> String {
        record
            .agent_id()
            .map_or_else(|| record.source.clone(), ToString::to_string)
    }

    async fn deliver_begin(&self, record: &EventRecord) {
        let source_agent = Self::source_agent(record);
        let admitted: Vec<Arc<ObsSubscription>> = self
            .subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|sub| {
                sub.matches_target(&source_agent)
                    && sub.matches_event(&record.event_name)
                    && sub.filter.admits(&record.event_name, &record.data)
            })
            .collect();
        if admitted.is_empty() {
            return;
        }

        self.admitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                record.id.clone(),
                admitted.iter().map(|s| s.id.0.clone()).collect(),
            );

        for subscription in admitted {
            let payload = json!({
                "observation_id": record.id,
                "subscription_id": subscription.id,
                "observer": subscription.observer,
                "target": source_agent,
                "event": record.event_name,
                "data": record.data,
                "timestamp": record.timestamp.to_rfc3339(),
            });
            let _ = self
                .emitter
                .emit("observe:begin", payload, EmitOptions::new().source(SOURCE))
                .await;
            self.append_history(&json!({
                "type": "begin",
                "observation_id": record.id,
                "observer": subscription.observer,
                "target": source_agent,
                "event": record.event_name,
                "data": record.data,
                "ts_ms": record.timestamp.timestamp_millis(),
            }))
            .await;
        }
    }

    async fn deliver_end(&self, record: &EventRecord) {
        let subscription_ids = self
            .admitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&record.id);
        let Some(subscription_ids) = subscription_ids else {
            return;
        };
        let source_agent = Self::source_agent(record);
        let end_ts = Utc::now().timestamp_millis();

        for sub_id in subscription_ids {
            let Some(subscription) = self
                .subscriptions
                .get(&sub_id)
                .map(|e| Arc::clone(e.value()))
            else {
                continue;
            };
            let payload = json!({
                "observation_id": record.id,
                "subscription_id": subscription.id,
                "observer": subscription.observer,
                "target": source_agent,
                "event": record.event_name,
                "result": record.result,
                "error": record.error,
                "handlers_called": record.handlers_called,
            });
            let _ = self
                .emitter
                .emit("observe:end", payload, EmitOptions::new().source(SOURCE))
                .await;
            self.append_history(&json!({
                "type": "end",
                "observation_id": record.id,
                "observer": subscription.observer,
                "target": source_agent,
                "event": record.event_name,
                "result": record.result,
                "ts_ms": end_ts,
            }))
            .await;
        }
    }

    async fn append_history(&self, entry: &Value) {
        if let Err(e) = self.store.push(HISTORY_QUEUE, entry, None).await {
            warn!(error = %e, "failed to append observation history");
        }
    }

    /// History records matching the filters, oldest first, truncated to
    /// `limit` (most recent kept).
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn query_history(
        &self,
        target: Option<&str>,
        event_pattern: Option<&str>,
        limit: usize,
    ) -> ObservationResult<Vec<Value>> {
        let matcher = event_pattern
            .and_then(|p| Glob::new(p).ok())
            .map(|g| g.compile_matcher());
        let mut records: Vec<Value> = self
            .store
            .get_queue(HISTORY_QUEUE)
            .await?
            .into_iter()
            .filter(|r| {
                target.is_none_or(|t| r.get("target").and_then(Value::as_str) == Some(t))
            })
            .filter(|r| {
                matcher.as_ref().is_none_or(|m| {
                    r.get("event")
                        .and_then(Value::as_str)
                        .is_some_and(|e| m.is_match(e))
                })
            })
            .collect();
        if records.len() > limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }
        Ok(records)
    }

    /// Replay history records by re-emitting them.
    ///
    /// `speed` scales recorded inter-event gaps (2.0 = twice as fast);
    /// with `as_replay` the records are emitted as `observe:replay`
    /// events instead of their original names.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn replay(
        &self,
        target: Option<&str>,
        event_pattern: Option<&str>,
        speed: f64,
        as_replay: bool,
        limit: usize,
    ) -> ObservationResult<usize> {
        let records: Vec<Value> = self
            .query_history(target, event_pattern, limit)
            .await?
            .into_iter()
            .filter(|r| r.get("type").and_then(Value::as_str) == Some("begin"))
            .collect();
        let count = records.len();
        let emitter = self.emitter.clone();
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };

        tokio::spawn(async move {
            let mut previous_ts: Option<i64> = None;
            for record in records {
                let ts = record.get("ts_ms").and_then(Value::as_i64).unwrap_or(0);
                if let Some(prev) = previous_ts {
                    let gap_ms = ts.saturating_sub(prev).max(0);
                    #[allow(clippy::cast_precision_loss)]
                    let scaled = Duration::from_millis(gap_ms.max(0) as u64)
                        .div_f64(speed)
                        .min(MAX_REPLAY_GAP);
                    tokio::time::sleep(scaled).await;
                }
                previous_ts = Some(ts);

                if as_replay {
                    let _ = emitter
                        .emit(
                            "observe:replay",
                            json!({
                                "original_event": record.get("event"),
                                "target": record.get("target"),
                                "data": record.get("data"),
                                "original_ts_ms": ts,
                            }),
                            EmitOptions::new().source("observation_replay"),
                        )
                        .await;
                } else if let Some(event) = record.get("event").and_then(Value::as_str) {
                    let data = record.get("data").cloned().unwrap_or(json!({}));
                    let _ = emitter
                        .emit(event, data, EmitOptions::new().source("observation_replay"))
                        .await;
                }
            }
        });
        Ok(count)
    }

    /// Run one of the pattern analyses over the full history.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence failure.
    pub async fn analyze(&self, analysis_type: &str, limit: usize) -> ObservationResult<Value> {
        let records = self.store.get_queue(HISTORY_QUEUE).await?;
        Ok(match analysis_type {
            "sequence" => analyze::sequences(&records, limit),
            "performance" => analyze::performance(&records),
            _ => analyze::frequency(&records, limit),
        })
    }
}

impl ObservationSink for ObservationService {
    fn event_begin(&self, record: &EventRecord) {
        // Never observe the observation channel itself.
        if record.event_name.starts_with("observe:")
            || record.event_name == "agent:observation"
        {
            return;
        }
        let _ = self.tx.send(ObsTask::Begin(record.clone()));
    }

    fn event_end(&self, record: &EventRecord) {
        if record.event_name.starts_with("observe:")
            || record.event_name == "agent:observation"
        {
            return;
        }
        let _ = self.tx.send(ObsTask::End(record.clone()));
    }
}

/// Plugin exposing `observation:*` events.
pub struct ObservationPlugin {
    service: Arc<ObservationService>,
}

impl ObservationPlugin {
    /// Create the plugin around a service.
    #[must_use]
    pub fn new(service: Arc<ObservationService>) -> Self {
        Self { service }
    }
}

fn missing(field: &str) -> Value {
    ErrorEnvelope::new(ErrorCode::Validation, format!("missing required field: {field}"))
        .to_value()
}

fn internal(e: &ObservationError) -> Value {
    ErrorEnvelope::new(ErrorCode::InternalError, e.to_string()).to_value()
}

impl KsiPlugin for ObservationPlugin {
    fn name(&self) -> &str {
        "observation_service"
    }

    fn summary(&self) -> &str {
        "Filtered observation of agent events, history, replay, analysis"
    }

    #[allow(clippy::too_many_lines)]
    fn handlers(&self) -> Vec<HandlerRegistration> {
        let service = Arc::clone(&self.service);
        let subscribe_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let Some(observer) = data.get("observer").and_then(Value::as_str) else {
                    return Ok(Some(missing("observer")));
                };
                let Some(target) = data.get("target").and_then(Value::as_str) else {
                    return Ok(Some(missing("target")));
                };
                let events: Vec<String> = data
                    .get("events")
                    .and_then(Value::as_array)
                    .map_or_else(
                        || vec!["*".to_string()],
                        |a| {
                            a.iter()
                                .filter_map(Value::as_str)
                                .map(ToString::to_string)
                                .collect()
                        },
                    );
                let filter: ObservationFilter = data
                    .get("filter")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .unwrap_or_default()
                    .unwrap_or_default();

                match service.subscribe(observer, target, &events, filter) {
                    Ok(id) => Ok(Some(json!({
                        "subscription_id": id,
                        "observer": observer,
                        "target": target,
                    }))),
                    Err(e) => Ok(Some(internal(&e))),
                }
            }
        });

        let service = Arc::clone(&self.service);
        let unsubscribe_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let Some(id) = data.get("subscription_id").and_then(Value::as_str) else {
                    return Ok(Some(missing("subscription_id")));
                };
                let removed = service.unsubscribe(id);
                Ok(Some(json!({"subscription_id": id, "removed": removed})))
            }
        });

        let service = Arc::clone(&self.service);
        let list_handler = handler_fn(move |_, _, _| {
            let service = Arc::clone(&service);
            async move {
                let subscriptions = service.list();
                Ok(Some(json!({
                    "count": subscriptions.len(),
                    "subscriptions": subscriptions,
                })))
            }
        });

        let service = Arc::clone(&self.service);
        let history_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let limit = data
                    .get("limit")
                    .and_then(Value::as_u64)
                    .and_then(|l| usize::try_from(l).ok())
                    .unwrap_or(100);
                match service
                    .query_history(
                        data.get("target").and_then(Value::as_str),
                        data.get("event").and_then(Value::as_str),
                        limit,
                    )
                    .await
                {
                    Ok(records) => Ok(Some(json!({
                        "count": records.len(),
                        "records": records,
                    }))),
                    Err(e) => Ok(Some(internal(&e))),
                }
            }
        });

        let service = Arc::clone(&self.service);
        let replay_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let speed = data.get("speed").and_then(Value::as_f64).unwrap_or(1.0);
                let as_replay = data
                    .get("as_replay")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let limit = data
                    .get("limit")
                    .and_then(Value::as_u64)
                    .and_then(|l| usize::try_from(l).ok())
                    .unwrap_or(100);
                match service
                    .replay(
                        data.get("target").and_then(Value::as_str),
                        data.get("event").and_then(Value::as_str),
                        speed,
                        as_replay,
                        limit,
                    )
                    .await
                {
                    Ok(count) => Ok(Some(json!({"status": "replaying", "count": count}))),
                    Err(e) => Ok(Some(internal(&e))),
                }
            }
        });

        let service = Arc::clone(&self.service);
        let analyze_handler = handler_fn(move |_, data, _| {
            let service = Arc::clone(&service);
            async move {
                let analysis_type = data
                    .get("analysis_type")
                    .and_then(Value::as_str)
                    .unwrap_or("frequency");
                let limit = data
                    .get("limit")
                    .and_then(Value::as_u64)
                    .and_then(|l| usize::try_from(l).ok())
                    .unwrap_or(10);
                match service.analyze(analysis_type, limit).await {
                    Ok(result) => Ok(Some(result)),
                    Err(e) => Ok(Some(internal(&e))),
                }
            }
        });

        vec![
            HandlerRegistration::new(
                HandlerSpec::new("observation:subscribe")
                    .summary("Observe a target agent's events through a filter")
                    .param("observer", Param::new(ParamType::String).required())
                    .param("target", Param::new(ParamType::String).required())
                    .param("events", Param::new(ParamType::Array))
                    .param("filter", Param::new(ParamType::Object))
                    .triggers("observe:begin")
                    .triggers("observe:end"),
                subscribe_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("observation:unsubscribe")
                    .summary("Remove an observation subscription")
                    .param("subscription_id", Param::new(ParamType::String).required()),
                unsubscribe_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("observation:list")
                    .summary("List observation subscriptions"),
                list_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("observation:query_history")
                    .summary("Query recorded observations")
                    .param("target", Param::new(ParamType::String))
                    .param("event", Param::new(ParamType::String))
                    .param("limit", Param::new(ParamType::Integer).default_value(json!(100))),
                history_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("observation:replay")
                    .summary("Re-emit recorded observations at adjustable speed")
                    .param("target", Param::new(ParamType::String))
                    .param("event", Param::new(ParamType::String))
                    .param("speed", Param::new(ParamType::Number).default_value(json!(1.0)))
                    .param("as_replay", Param::new(ParamType::Boolean).default_value(json!(true)))
                    .param("limit", Param::new(ParamType::Integer).default_value(json!(100))),
                replay_handler,
            ),
            HandlerRegistration::new(
                HandlerSpec::new("observation:analyze_patterns")
                    .summary("Frequency, sequence, or performance analysis of history")
                    .param(
                        "analysis_type",
                        Param::new(ParamType::String).default_value(json!("frequency")),
                    )
                    .param("limit", Param::new(ParamType::Integer).default_value(json!(10))),
                analyze_handler,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksi_events::EventRouter;
    use ksi_plugins::PluginRegistry;

    struct Harness {
        router: EventRouter,
        service: Arc<ObservationService>,
        observed: tokio::sync::mpsc::UnboundedReceiver<(String, Value)>,
    }

    async fn harness() -> Harness {
        let router = EventRouter::new(1000);
        let registry = PluginRegistry::new(router.clone());
        let store = Arc::new(AsyncStateStore::open_in_memory().unwrap());
        let service = ObservationService::new(router.emitter(), store);
        registry
            .load(Arc::new(ObservationPlugin::new(Arc::clone(&service))))
            .await
            .unwrap();
        router.set_observation_sink(Arc::clone(&service) as Arc<dyn ObservationSink>);

        let (tx, observed) = tokio::sync::mpsc::unbounded_channel();
        router
            .subscribe(
                "observe_collector",
                &["observe:*".to_string()],
                handler_fn(move |event, data, _| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((event, data));
                        Ok(None)
                    }
                }),
                None,
            )
            .unwrap();

        Harness {
            router,
            service,
            observed,
        }
    }

    async fn recv(h: &mut Harness) -> (String, Value) {
        tokio::time::timeout(Duration::from_secs(5), h.observed.recv())
            .await
            .expect("timed out waiting for observation")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_begin_end_pair_delivered() {
        let mut h = harness().await;
        h.service
            .subscribe("watcher", "agent_a", &["task:*".to_string()], ObservationFilter::default())
            .unwrap();

        h.router
            .emit(
                "task:start",
                json!({"_agent_id": "agent_a", "step": 1}),
                EmitOptions::new(),
            )
            .await;

        let (begin_event, begin) = recv(&mut h).await;
        assert_eq!(begin_event, "observe:begin");
        assert_eq!(begin["observer"], "watcher");
        assert_eq!(begin["target"], "agent_a");
        assert_eq!(begin["event"], "task:start");
        assert_eq!(begin["data"]["step"], 1);

        let (end_event, end) = recv(&mut h).await;
        assert_eq!(end_event, "observe:end");
        assert_eq!(end["observation_id"], begin["observation_id"]);
    }

    #[tokio::test]
    async fn test_non_matching_events_not_delivered() {
        let mut h = harness().await;
        h.service
            .subscribe("watcher", "agent_a", &["task:*".to_string()], ObservationFilter::default())
            .unwrap();

        // Wrong target, then wrong event name.
        h.router
            .emit("task:start", json!({"_agent_id": "agent_b"}), EmitOptions::new())
            .await;
        h.router
            .emit("other:x", json!({"_agent_id": "agent_a"}), EmitOptions::new())
            .await;
        // A matching one to flush the pipeline.
        h.router
            .emit("task:end", json!({"_agent_id": "agent_a"}), EmitOptions::new())
            .await;

        let (_, begin) = recv(&mut h).await;
        assert_eq!(begin["event"], "task:end");
    }

    #[tokio::test]
    async fn test_filter_exclude_applies() {
        let mut h = harness().await;
        let filter: ObservationFilter =
            serde_json::from_value(json!({"exclude": ["task:noise"]})).unwrap();
        h.service
            .subscribe("watcher", "agent_a", &["task:*".to_string()], filter)
            .unwrap();

        h.router
            .emit("task:noise", json!({"_agent_id": "agent_a"}), EmitOptions::new())
            .await;
        h.router
            .emit("task:real", json!({"_agent_id": "agent_a"}), EmitOptions::new())
            .await;

        let (_, begin) = recv(&mut h).await;
        assert_eq!(begin["event"], "task:real");
    }

    #[tokio::test]
    async fn test_history_and_analysis_over_bus() {
        let mut h = harness().await;
        h.router
            .emit(
                "observation:subscribe",
                json!({"observer": "watcher", "target": "agent_a", "events": ["job:*"]}),
                EmitOptions::new(),
            )
            .await;

        for _ in 0..2 {
            h.router
                .emit("job:run", json!({"_agent_id": "agent_a"}), EmitOptions::new())
                .await;
        }
        // Drain begin/end pairs so history is written.
        for _ in 0..4 {
            recv(&mut h).await;
        }

        let history = h
            .router
            .emit(
                "observation:query_history",
                json!({"target": "agent_a", "event": "job:*"}),
                EmitOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(history["count"], 4);

        let frequency = h
            .router
            .emit(
                "observation:analyze_patterns",
                json!({"analysis_type": "frequency"}),
                EmitOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(frequency["events"][0]["event"], "job:run");
        assert_eq!(frequency["events"][0]["count"], 2);

        let performance = h
            .router
            .emit(
                "observation:analyze_patterns",
                json!({"analysis_type": "performance"}),
                EmitOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(performance["events"][0]["count"], 2);
    }

    #[tokio::test]
    async fn test_replay_reemits_original_events() {
        let mut h = harness().await;
        h.service
            .subscribe("watcher", "agent_a", &["job:*".to_string()], ObservationFilter::default())
            .unwrap();
        h.router
            .emit(
                "job:run",
                json!({"_agent_id": "agent_a", "n": 7}),
                EmitOptions::new(),
            )
            .await;
        recv(&mut h).await;
        recv(&mut h).await;

        // Collect re-emitted originals.
        let (tx, mut replayed) = tokio::sync::mpsc::unbounded_channel();
        h.router
            .subscribe(
                "replay_collector",
                &["job:*".to_string()],
                handler_fn(move |_, data, _| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(data);
                        Ok(None)
                    }
                }),
                None,
            )
            .unwrap();

        let count = h
            .service
            .replay(Some("agent_a"), None, 10.0, false, 100)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let data = tokio::time::timeout(Duration::from_secs(5), replayed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data["n"], 7);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let mut h = harness().await;
        let id = h
            .service
            .subscribe("watcher", "agent_a", &["t:*".to_string()], ObservationFilter::default())
            .unwrap();
        assert!(h.service.unsubscribe(id.as_str()));
        assert!(!h.service.unsubscribe(id.as_str()));

        h.router
            .emit("t:x", json!({"_agent_id": "agent_a"}), EmitOptions::new())
            .await;
        // Nothing should arrive; use a short timeout.
        let outcome =
            tokio::time::timeout(Duration::from_millis(200), h.observed.recv()).await;
        assert!(outcome.is_err());
    }
}
