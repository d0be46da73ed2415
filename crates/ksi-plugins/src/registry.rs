//! Plugin loading, hook invocation, and handler binding.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use ksi_events::{EventRouter, HandlerBinding};
use tracing::{info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::plugin::{KsiPlugin, PluginContext};
use crate::spec::HandlerSpec;

/// Re-creates a plugin instance for `plugin:reload`.
pub type PluginFactory = Box<dyn Fn() -> Arc<dyn KsiPlugin> + Send + Sync>;

struct LoadedPlugin {
    plugin: Arc<dyn KsiPlugin>,
    factory: Option<PluginFactory>,
    specs: Vec<HandlerSpec>,
    loaded_at: DateTime<Utc>,
}

/// Snapshot of a loaded plugin for introspection.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// One-line summary.
    pub summary: String,
    /// Whether `plugin:reload` is allowed without `force`.
    pub reloadable: bool,
    /// Handler metadata.
    pub specs: Vec<HandlerSpec>,
    /// When the plugin was loaded.
    pub loaded_at: DateTime<Utc>,
}

/// Holds loaded plugins and binds their handlers into the router.
pub struct PluginRegistry {
    router: EventRouter,
    plugins: RwLock<HashMap<String, LoadedPlugin>>,
    load_order: RwLock<Vec<String>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugin_names())
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Create a registry bound to a router.
    #[must_use]
    pub fn new(router: EventRouter) -> Self {
        Self {
            router,
            plugins: RwLock::new(HashMap::new()),
            load_order: RwLock::new(Vec::new()),
        }
    }

    /// The router this registry binds handlers into.
    #[must_use]
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Load a plugin instance without a factory (not re-instantiable).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyLoaded`] for a duplicate name and
    /// [`RegistryError::Startup`] if the plugin's startup hook fails.
    pub async fn load(&self, plugin: Arc<dyn KsiPlugin>) -> RegistryResult<()> {
        self.load_inner(plugin, None).await
    }

    /// Load a plugin from a factory, keeping the factory for reload.
    ///
    /// # Errors
    ///
    /// Same as [`PluginRegistry::load`].
    pub async fn load_with_factory(&self, factory: PluginFactory) -> RegistryResult<()> {
        let plugin = factory();
        self.load_inner(plugin, Some(factory)).await
    }

    async fn load_inner(
        &self,
        plugin: Arc<dyn KsiPlugin>,
        factory: Option<PluginFactory>,
    ) -> RegistryResult<()> {
        let name = plugin.name().to_string();
        {
            let plugins = self
                .plugins
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if plugins.contains_key(&name) {
                return Err(RegistryError::AlreadyLoaded(name));
            }
        }

        let registrations = plugin.handlers();
        let mut specs = Vec::with_capacity(registrations.len());
        for registration in registrations {
            let spec = registration.spec;
            self.router.register_handler(
                HandlerBinding::new(
                    spec.event.clone(),
                    format!("{name}.{}", spec.handler_name),
                    name.clone(),
                    registration.handler,
                )
                .priority(spec.priority),
            );
            specs.push(spec);
        }

        {
            let mut plugins = self
                .plugins
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            plugins.insert(
                name.clone(),
                LoadedPlugin {
                    plugin: Arc::clone(&plugin),
                    factory,
                    specs,
                    loaded_at: Utc::now(),
                },
            );
        }
        self.load_order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.clone());

        let ctx = PluginContext {
            emitter: self.router.emitter(),
        };
        if let Err(e) = plugin.on_startup(&ctx).await {
            warn!(plugin = %name, error = %e, "plugin startup failed; unloading");
            self.router.unregister_handlers_of(&name);
            self.plugins
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&name);
            self.load_order
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|n| n != &name);
            return Err(RegistryError::Startup {
                plugin: name,
                message: e.to_string(),
            });
        }

        info!(plugin = %name, "plugin loaded");
        Ok(())
    }

    /// Remove and re-import a plugin from its factory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown plugin,
    /// [`RegistryError::NotReloadable`] when the plugin declines reload
    /// and `force` is not set, and [`RegistryError::NoFactory`] when the
    /// plugin was loaded without one.
    pub async fn reload(&self, name: &str, force: bool) -> RegistryResult<()> {
        // Pre-flight checks under a brief read lock.
        {
            let plugins = self
                .plugins
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let loaded = plugins
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            if !loaded.plugin.reloadable() && !force {
                return Err(RegistryError::NotReloadable(name.to_string()));
            }
            if loaded.factory.is_none() {
                return Err(RegistryError::NoFactory(name.to_string()));
            }
        }

        let removed = self
            .plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        self.load_order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|n| n != name);

        removed.plugin.on_shutdown().await;
        self.router.unregister_handlers_of(name);

        let factory = removed
            .factory
            .ok_or_else(|| RegistryError::NoFactory(name.to_string()))?;
        let fresh = factory();
        info!(plugin = %name, "reloading plugin");
        self.load_inner(fresh, Some(factory)).await
    }

    /// Shut down every plugin in reverse load order and unbind all
    /// handlers.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = {
            let order = self
                .load_order
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            order.iter().rev().cloned().collect()
        };
        for name in names {
            let plugin = {
                let plugins = self
                    .plugins
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                plugins.get(&name).map(|p| Arc::clone(&p.plugin))
            };
            if let Some(plugin) = plugin {
                plugin.on_shutdown().await;
                self.router.unregister_handlers_of(&name);
                info!(plugin = %name, "plugin shut down");
            }
        }
        self.plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.load_order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Names of loaded plugins, in load order.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.load_order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Introspection snapshot of every loaded plugin, in load order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PluginInfo> {
        let order = self.plugin_names();
        let plugins = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        order
            .iter()
            .filter_map(|name| {
                plugins.get(name).map(|loaded| PluginInfo {
                    name: name.clone(),
                    version: loaded.plugin.version().to_string(),
                    summary: loaded.plugin.summary().to_string(),
                    reloadable: loaded.plugin.reloadable(),
                    specs: loaded.specs.clone(),
                    loaded_at: loaded.loaded_at,
                })
            })
            .collect()
    }

    /// Find the spec for an event, with its owning plugin's name.
    #[must_use]
    pub fn find_spec(&self, event: &str) -> Option<(String, HandlerSpec)> {
        let plugins = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for name in self
            .load_order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            if let Some(loaded) = plugins.get(name) {
                if let Some(spec) = loaded.specs.iter().find(|s| s.event == event) {
                    return Some((name.clone(), spec.clone()));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{HandlerRegistration, HandlerSpec};
    use async_trait::async_trait;
    use ksi_events::{EmitOptions, handler_fn};
    use serde_json::json;

    struct EchoPlugin {
        name: String,
        reloadable: bool,
    }

    #[async_trait]
    impl KsiPlugin for EchoPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn reloadable(&self) -> bool {
            self.reloadable
        }

        fn handlers(&self) -> Vec<HandlerRegistration> {
            vec![HandlerRegistration::new(
                HandlerSpec::new("echo:say").summary("Echo the payload"),
                handler_fn(|_, data, _| async move { Ok(Some(data)) }),
            )]
        }
    }

    #[tokio::test]
    async fn test_load_binds_handlers() {
        let router = EventRouter::new(100);
        let registry = PluginRegistry::new(router.clone());
        registry
            .load(Arc::new(EchoPlugin {
                name: "echo".to_string(),
                reloadable: true,
            }))
            .await
            .unwrap();

        let result = router
            .emit("echo:say", json!({"hi": true}), EmitOptions::new())
            .await;
        assert_eq!(result.unwrap()["hi"], true);
    }

    #[tokio::test]
    async fn test_duplicate_load_rejected() {
        let registry = PluginRegistry::new(EventRouter::new(100));
        let mk = || {
            Arc::new(EchoPlugin {
                name: "echo".to_string(),
                reloadable: true,
            })
        };
        registry.load(mk()).await.unwrap();
        assert!(matches!(
            registry.load(mk()).await,
            Err(RegistryError::AlreadyLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_requires_factory() {
        let registry = PluginRegistry::new(EventRouter::new(100));
        registry
            .load(Arc::new(EchoPlugin {
                name: "echo".to_string(),
                reloadable: true,
            }))
            .await
            .unwrap();
        assert!(matches!(
            registry.reload("echo", false).await,
            Err(RegistryError::NoFactory(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_from_factory() {
        let router = EventRouter::new(100);
        let registry = PluginRegistry::new(router.clone());
        registry
            .load_with_factory(Box::new(|| {
                Arc::new(EchoPlugin {
                    name: "echo".to_string(),
                    reloadable: true,
                })
            }))
            .await
            .unwrap();

        registry.reload("echo", false).await.unwrap();
        // Handlers still answer after reload.
        let result = router
            .emit("echo:say", json!({"n": 2}), EmitOptions::new())
            .await;
        assert_eq!(result.unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn test_non_reloadable_requires_force() {
        let registry = PluginRegistry::new(EventRouter::new(100));
        registry
            .load_with_factory(Box::new(|| {
                Arc::new(EchoPlugin {
                    name: "transport".to_string(),
                    reloadable: false,
                })
            }))
            .await
            .unwrap();

        assert!(matches!(
            registry.reload("transport", false).await,
            Err(RegistryError::NotReloadable(_))
        ));
        registry.reload("transport", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_all_unbinds() {
        let router = EventRouter::new(100);
        let registry = PluginRegistry::new(router.clone());
        registry
            .load(Arc::new(EchoPlugin {
                name: "echo".to_string(),
                reloadable: true,
            }))
            .await
            .unwrap();

        registry.shutdown_all().await;
        assert!(registry.plugin_names().is_empty());
        let result = router
            .emit("echo:say", json!({}), EmitOptions::new())
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_find_spec() {
        let registry = PluginRegistry::new(EventRouter::new(100));
        registry
            .load(Arc::new(EchoPlugin {
                name: "echo".to_string(),
                reloadable: true,
            }))
            .await
            .unwrap();
        let (owner, spec) = registry.find_spec("echo:say").unwrap();
        assert_eq!(owner, "echo");
        assert_eq!(spec.summary, "Echo the payload");
        assert!(registry.find_spec("missing:event").is_none());
    }
}
