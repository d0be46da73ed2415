//! The LLM provider contract.
//!
//! A provider is called with `(prompt, model, session_id?, allowed_tools?)`
//! and must return the response text plus a **new** session id that
//! supersedes the input one. Providers are external collaborators; the
//! daemon ships a Claude CLI subprocess implementation and tests use a
//! scripted stub.

use async_trait::async_trait;
use ksi_core::SessionId;
use serde_json::Value;

use crate::error::CompletionResult;

/// One provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Prompt text (injections already prepended).
    pub prompt: String,
    /// Model name.
    pub model: String,
    /// Session to resume; `None` starts a fresh conversation.
    pub session_id: Option<SessionId>,
    /// Tools the provider may enable, when supported.
    pub allowed_tools: Vec<String>,
}

/// A provider's answer for one turn.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Response text.
    pub result: String,
    /// Fresh session id for the next turn.
    pub session_id: SessionId,
    /// Token usage, when reported.
    pub usage: Option<Value>,
    /// Model that actually served the request, when reported.
    pub model: Option<String>,
}

impl ProviderResponse {
    /// Render the `{response: {...}}` wire shape carried by
    /// `completion:result`.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "response": {
                "result": self.result,
                "session_id": self.session_id,
                "usage": self.usage,
                "model": self.model,
            }
        })
    }
}

/// Interface all completion providers implement.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for logs and status output.
    fn name(&self) -> &str;

    /// Run one completion turn.
    async fn complete(&self, request: &ProviderRequest) -> CompletionResult<ProviderResponse>;
}

/// Blanket implementation so `Box<dyn CompletionProvider>` can be used
/// wherever `P: CompletionProvider` is required.
#[async_trait]
impl CompletionProvider for Box<dyn CompletionProvider> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn complete(&self, request: &ProviderRequest) -> CompletionResult<ProviderResponse> {
        (**self).complete(request).await
    }
}
