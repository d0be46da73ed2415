//! Per-conversation request queues.
//!
//! One queue per session identity, each owned by at most one worker (the
//! `busy` flag). Requests without a session id get a synthetic
//! `new:<request_id>` identity that is rekeyed when the first response
//! mints a real session id. Empty, idle queues are garbage-collected
//! after a TTL.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::CompletionRequest;

struct QueueState {
    pending: VecDeque<CompletionRequest>,
    busy: bool,
    last_active: Instant,
}

impl QueueState {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            busy: false,
            last_active: Instant::now(),
        }
    }
}

/// The conversation queue map.
pub struct ConversationQueues {
    queues: Mutex<HashMap<String, QueueState>>,
    gc_ttl: Duration,
}

impl std::fmt::Debug for ConversationQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationQueues")
            .field("gc_ttl", &self.gc_ttl)
            .finish_non_exhaustive()
    }
}

impl ConversationQueues {
    /// Create a queue map whose empty, idle queues are GC'd after
    /// `gc_ttl`.
    #[must_use]
    pub fn new(gc_ttl: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            gc_ttl,
        }
    }

    /// Enqueue a request under `key`.
    ///
    /// Returns `true` when the caller must start a worker for this queue
    /// (it was not busy); the queue is marked busy either way, keeping
    /// the at-most-one-worker invariant.
    pub fn enqueue(&self, key: &str, request: CompletionRequest) -> bool {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = queues
            .entry(key.to_string())
            .or_insert_with(QueueState::new);
        state.pending.push_back(request);
        state.last_active = Instant::now();
        if state.busy {
            false
        } else {
            state.busy = true;
            true
        }
    }

    /// Take the next request for the worker owning `key`.
    ///
    /// Returns `None` when the queue has drained; the busy flag is
    /// cleared and the worker must exit.
    pub fn next(&self, key: &str) -> Option<CompletionRequest> {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = queues.get_mut(key)?;
        state.last_active = Instant::now();
        match state.pending.pop_front() {
            Some(request) => Some(request),
            None => {
                state.busy = false;
                None
            },
        }
    }

    /// Move a queue from `old_key` to `new_key` after a response minted a
    /// new session id.
    ///
    /// Returns `true` when the calling worker still owns the (merged)
    /// queue. If the target queue already has a busy worker, this
    /// worker's pending requests are handed over and it must exit.
    pub fn rekey(&self, old_key: &str, new_key: &str) -> bool {
        if old_key == new_key {
            return true;
        }
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(old_state) = queues.remove(old_key) else {
            return false;
        };
        match queues.get_mut(new_key) {
            Some(target) => {
                target.pending.extend(old_state.pending);
                target.last_active = Instant::now();
                if target.busy {
                    debug!(old_key, new_key, "queue handed to existing worker");
                    false
                } else {
                    target.busy = true;
                    true
                }
            },
            None => {
                queues.insert(new_key.to_string(), old_state);
                true
            },
        }
    }

    /// Remove a pending (not yet started) request by id. Returns `true`
    /// if it was found.
    pub fn cancel_pending(&self, request_id: &str) -> bool {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for state in queues.values_mut() {
            let before = state.pending.len();
            state.pending.retain(|r| r.request_id.as_str() != request_id);
            if state.pending.len() < before {
                return true;
            }
        }
        false
    }

    /// Pending depth per queue.
    #[must_use]
    pub fn depths(&self) -> HashMap<String, usize> {
        let queues = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queues
            .iter()
            .map(|(key, state)| (key.clone(), state.pending.len()))
            .collect()
    }

    /// Drop empty, idle queues older than the GC TTL. Returns how many
    /// were collected.
    pub fn gc_idle(&self) -> usize {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = queues.len();
        let ttl = self.gc_ttl;
        queues.retain(|_, state| {
            state.busy || !state.pending.is_empty() || state.last_active.elapsed() < ttl
        });
        before.saturating_sub(queues.len())
    }
}
