//! Scripted completion provider.
//!
//! Pops canned response texts in order (falling back to `"ok"`), mints
//! `stub-sess-<n>` session ids, and records every invocation so tests
//! can assert session chaining and per-session serialization. The
//! sentinel response `"<error>"` makes that call fail like a provider
//! crash.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ksi_completion::{
    CompletionError, CompletionProvider, CompletionResult, ProviderRequest, ProviderResponse,
};
use ksi_core::SessionId;
use serde_json::json;

/// Scripted provider for tests.
#[derive(Debug)]
pub struct StubProvider {
    scripted: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<ProviderRequest>>,
    session_counter: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl Default for StubProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StubProvider {
    /// A stub with no scripted responses and no artificial delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            session_counter: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Script the next responses, in order.
    #[must_use]
    pub fn with_responses(self, responses: &[&str]) -> Self {
        {
            let mut scripted = self.scripted.lock().expect("stub lock");
            scripted.extend(responses.iter().map(|s| (*s).to_string()));
        }
        self
    }

    /// Add an artificial per-call delay (for overlap assertions).
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every request this provider has served, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderRequest> {
        self.calls.lock().expect("stub lock").clone()
    }

    /// Highest number of concurrently in-flight calls observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: &ProviderRequest) -> CompletionResult<ProviderResponse> {
        let current = self
            .in_flight
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.calls.lock().expect("stub lock").push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let result = self
            .scripted
            .lock()
            .expect("stub lock")
            .pop_front()
            .unwrap_or_else(|| "ok".to_string());
        if result == "<error>" {
            return Err(CompletionError::Provider {
                message: "stub provider failure".to_string(),
                stderr: Some("stub stderr".to_string()),
            });
        }

        let n = self
            .session_counter
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        Ok(ProviderResponse {
            result,
            session_id: SessionId(format!("stub-sess-{n}")),
            usage: Some(json!({"output_tokens": 1})),
            model: Some(request.model.clone()),
        })
    }
}
