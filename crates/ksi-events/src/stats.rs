//! Bus statistics counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic counters updated on the dispatch path.
#[derive(Debug, Default)]
pub(crate) struct BusStats {
    pub(crate) events_emitted: AtomicU64,
    pub(crate) events_handled: AtomicU64,
    pub(crate) events_failed: AtomicU64,
}

impl BusStats {
    pub(crate) fn emitted(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handled(&self) {
        self.events_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of bus statistics, as returned by
/// [`EventRouter::stats`](crate::EventRouter::stats).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Total events emitted.
    pub events_emitted: u64,
    /// Events that reached at least one handler.
    pub events_handled: u64,
    /// Events that failed validation or dispatch.
    pub events_failed: u64,
    /// Currently registered subscriptions.
    pub active_subscriptions: usize,
    /// Correlation futures currently pending.
    pub active_correlations: usize,
    /// Records currently in the ring history.
    pub history_size: usize,
    /// Validators registered.
    pub registered_schemas: usize,
    /// Wildcard subscriptions in the secondary list.
    pub pattern_subscriptions: usize,
}
