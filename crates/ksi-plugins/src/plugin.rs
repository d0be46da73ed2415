//! The plugin interface.

use async_trait::async_trait;
use ksi_events::EventEmitter;

use crate::error::RegistryResult;
use crate::spec::HandlerRegistration;

/// Context handed to plugins at startup.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Weak handle to the event router for follow-up emits.
    pub emitter: EventEmitter,
}

/// A loadable unit of handlers with lifecycle hooks.
///
/// Plugins are registered at daemon init (or re-created from a factory on
/// `plugin:reload`). Handler metadata comes from
/// [`HandlerSpec`](crate::HandlerSpec) builders, which drive the
/// discovery service.
#[async_trait]
pub trait KsiPlugin: Send + Sync {
    /// Unique plugin name; doubles as the handler owner in the router.
    fn name(&self) -> &str;

    /// Plugin version shown by `module:list`.
    fn version(&self) -> &str {
        "1.0.0"
    }

    /// One-line description.
    fn summary(&self) -> &str {
        ""
    }

    /// Whether `plugin:reload` may re-instantiate this plugin.
    /// Transport plugins return `false`.
    fn reloadable(&self) -> bool {
        true
    }

    /// The handlers this plugin contributes.
    fn handlers(&self) -> Vec<HandlerRegistration>;

    /// Called once after the plugin's handlers are bound.
    async fn on_startup(&self, ctx: &PluginContext) -> RegistryResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called during daemon shutdown or before reload.
    async fn on_shutdown(&self) {}
}
