//! Daemon assembly and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use ksi_agent::{AgentPlugin, AgentService, CompositionLibrary, CompositionPlugin};
use ksi_completion::{
    CompletionPlugin, CompletionProvider, CompletionService, ConversationPlugin, InjectionPlugin,
    InjectionRouter, ResponseLogger,
};
use ksi_config::Config;
use ksi_core::KsiHome;
use ksi_events::EventRouter;
use ksi_observation::{ObservationPlugin, ObservationService};
use ksi_plugins::{DiscoveryPlugin, PluginRegistry};
use ksi_state::{AsyncStateStore, StatePlugin};
use tokio::sync::broadcast;
use tracing::info;

use crate::core_plugin::CorePlugin;
use crate::error::DaemonResult;
use crate::message::MessagePlugin;
use crate::monitor::MonitorPlugin;
use crate::transport::{UnixSocketPlugin, UnixSocketTransport};

/// Interval for pruning expired async-state entries.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// A fully wired daemon instance.
///
/// Everything is constructed behind this struct — no process-wide
/// singletons — so tests can run multiple isolated daemons in one
/// process.
pub struct KsiDaemon {
    config: Config,
    router: EventRouter,
    registry: Arc<PluginRegistry>,
    transport: Arc<UnixSocketTransport>,
    agents: Arc<AgentService>,
    completion: Arc<CompletionService>,
    shutdown_tx: broadcast::Sender<()>,
    prune_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for KsiDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KsiDaemon")
            .field("socket", &self.transport.path())
            .finish_non_exhaustive()
    }
}

impl KsiDaemon {
    /// Scaffold directories, wire every service, load the built-in
    /// plugins, and bind the socket.
    ///
    /// # Errors
    ///
    /// Returns an error on unreadable config directories, state-store
    /// failure, plugin startup failure, or socket bind failure — all
    /// fatal at init.
    pub async fn start(
        home: &KsiHome,
        config: Config,
        provider: Arc<dyn CompletionProvider>,
    ) -> DaemonResult<Arc<Self>> {
        home.ensure()?;

        let router = EventRouter::with_timeout(
            config.bus.max_history,
            Duration::from_secs(config.bus.correlation_timeout_secs),
        );
        let registry = Arc::new(PluginRegistry::new(router.clone()));

        // Leaf services first: state, injections, response logs.
        let state_store = Arc::new(AsyncStateStore::open(
            &config.resolve_state_dir(home).join("async_state.db"),
        )?);
        let injections = Arc::new(InjectionRouter::new(Arc::clone(&state_store)));
        let response_log = Arc::new(ResponseLogger::new(config.resolve_response_log_dir(home)));

        let completion = CompletionService::new(
            router.emitter(),
            provider,
            Arc::clone(&injections),
            Arc::clone(&response_log),
            config.completion.default_model.clone(),
            Duration::from_secs(config.completion.queue_gc_ttl_secs),
        );
        let agents = AgentService::new(
            router.emitter(),
            config.resolve_sandbox_dir(home),
            config.completion.default_model.clone(),
        );
        let observation = ObservationService::new(router.emitter(), Arc::clone(&state_store));

        router.set_hierarchy(Arc::clone(&agents) as Arc<dyn ksi_events::AgentHierarchy>);
        router.set_observation_sink(
            Arc::clone(&observation) as Arc<dyn ksi_events::ObservationSink>
        );

        let (shutdown_tx, _) = broadcast::channel(8);

        registry
            .load(Arc::new(CorePlugin::new(router.clone(), shutdown_tx.clone())))
            .await?;
        registry
            .load(Arc::new(DiscoveryPlugin::new(&registry)))
            .await?;
        registry
            .load(Arc::new(StatePlugin::new(Arc::clone(&state_store))))
            .await?;
        registry
            .load(Arc::new(CompletionPlugin::new(Arc::clone(&completion))))
            .await?;
        registry
            .load(Arc::new(InjectionPlugin::new(Arc::clone(&injections))))
            .await?;
        registry
            .load(Arc::new(ConversationPlugin::new(Arc::clone(&response_log))))
            .await?;
        registry
            .load(Arc::new(CompositionPlugin::new(Arc::new(
                CompositionLibrary::with_defaults(),
            ))))
            .await?;
        registry
            .load(Arc::new(AgentPlugin::new(Arc::clone(&agents))))
            .await?;
        registry
            .load(Arc::new(ObservationPlugin::new(Arc::clone(&observation))))
            .await?;
        registry
            .load(Arc::new(MonitorPlugin::new(router.clone())))
            .await?;
        registry.load(Arc::new(MessagePlugin::new())).await?;

        let transport = Arc::new(UnixSocketTransport::new(
            config.resolve_socket_path(home),
            router.clone(),
        ));
        transport.start()?;
        registry
            .load(Arc::new(UnixSocketPlugin::new(Arc::clone(&transport))))
            .await?;

        let prune_handle = state_store.spawn_prune_loop(PRUNE_INTERVAL);

        info!(socket = %transport.path().display(), "daemon started");
        Ok(Arc::new(Self {
            config,
            router,
            registry,
            transport,
            agents,
            completion,
            shutdown_tx,
            prune_handle,
        }))
    }

    /// The event router (for embedding and tests).
    #[must_use]
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// The socket path the transport is bound to.
    #[must_use]
    pub fn socket_path(&self) -> std::path::PathBuf {
        self.transport.path().to_path_buf()
    }

    /// Subscribe to the shutdown signal (`system:shutdown` or embedder).
    #[must_use]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Gracefully stop the daemon.
    ///
    /// In-flight completions get the configured grace period, then
    /// plugins shut down in reverse load order, agents are terminated,
    /// the socket is closed, and pending correlations are cancelled.
    /// Pending injections stay in the async-state database for the next
    /// start.
    pub async fn shutdown(&self) {
        info!("daemon shutting down");

        // Let in-flight responses drain to their connections.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let grace = Duration::from_secs(self.config.daemon.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        while self.completion.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.transport.stop();
        self.agents.terminate_all().await;
        self.registry.shutdown_all().await;
        let cancelled = self.router.cancel_all_correlations();
        if cancelled > 0 {
            info!(cancelled, "cancelled pending correlations");
        }
        self.prune_handle.abort();
        info!("daemon stopped");
    }
}
