//! Handler trait, invocation context, and the weak emitter handle.

use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{EventError, EventResult, HandlerOutput};
use crate::router::{EmitOptions, EventRouter, RouterInner};

/// A function registered to run when a named event is dispatched.
///
/// Returning `Ok(None)` means the handler did not claim the event and
/// dispatch continues; the router returns the first non-nil result to the
/// emitter. All outbound communication must go through the context's
/// emitter — handlers never hold direct references to other services.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    async fn handle(&self, event: &str, data: &Value, ctx: &EventContext) -> HandlerOutput;
}

/// Per-invocation context passed to handlers.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Id of the event being dispatched.
    pub event_id: String,
    /// Source component of the emit.
    pub source: String,
    /// Correlation id of the emit, if any.
    pub correlation_id: Option<String>,
    /// Weak handle back to the router for follow-up emits.
    pub emitter: EventEmitter,
}

/// Weak, cloneable handle to the router.
///
/// Plugins hold one of these across their lifetime; it does not keep the
/// router alive, so daemon teardown is not blocked by plugin references.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    pub(crate) inner: Weak<RouterInner>,
}

impl EventEmitter {
    /// Upgrade to a full router handle.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::BusClosed`] if the router has been dropped.
    pub fn router(&self) -> EventResult<EventRouter> {
        self.inner
            .upgrade()
            .map(|inner| EventRouter { inner })
            .ok_or(EventError::BusClosed)
    }

    /// Emit an event through the router.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::BusClosed`] if the router has been dropped.
    pub async fn emit(
        &self,
        event_name: &str,
        data: Value,
        options: EmitOptions,
    ) -> EventResult<Option<Value>> {
        let router = self.router()?;
        Ok(router.emit(event_name, data, options).await)
    }
}

struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(String, Value, EventContext) -> BoxFuture<'static, HandlerOutput> + Send + Sync,
{
    async fn handle(&self, event: &str, data: &Value, ctx: &EventContext) -> HandlerOutput {
        (self.func)(event.to_string(), data.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
///
/// The closure receives owned copies of the event name, payload, and
/// context, so the returned future carries no borrows.
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn EventHandler>
where
    F: Fn(String, Value, EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutput> + Send + 'static,
{
    Arc::new(FnHandler {
        func: move |event, data, ctx| func(event, data, ctx).boxed(),
    })
}
