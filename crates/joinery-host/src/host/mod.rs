//! The assembled plugin host.
//!
//! [`PluginHost`] owns one of each component and exposes the operations an
//! embedder drives: start-up, install, removal, bulk reload, update checks
//! and engine resynchronisation.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use joinery_config::Config;

use crate::backend::{BackendRegistry, FileSystemHandle, PluginKind};
use crate::engine::{
    DisconnectAction, EngineMode, EngineRegistry, ReloadGuards, disconnect_action, should_reload,
};
use crate::error::HostError;
use crate::events::{EventBus, HostEvent};
use crate::fetch::{HttpFetcher, SourceFetcher};
use crate::installer::DependencyInstaller;
use crate::lifecycle::{ControllerParts, LifecycleController, PluginInstance};
use crate::messages::{MessageSink, TracingMessageSink};
use crate::parser::{ParseOverrides, compare_versions, parse_plugin_source};
use crate::reference::ReferenceResolver;
use crate::repository::{Manifest, ManifestEntry, Repository, RepositoryResolver};
use crate::store::{KeyValueStore, WorkspaceStores, content_hash};
use crate::window::WindowManager;
use crate::workflow::WorkflowGraph;
use crate::workspace::{InstalledPlugin, PluginRecord, WorkflowRecord, WorkspaceManager};

const HOST_TARGET: &str = "joinery_host::host";

/// Collects the collaborators a [`PluginHost`] is built from.
pub struct PluginHostBuilder {
    config: Config,
    config_store: Option<Arc<dyn KeyValueStore>>,
    workspace_stores: Option<Arc<dyn WorkspaceStores>>,
    backends: BackendRegistry,
    windows: Option<Arc<dyn WindowManager>>,
    engines: Option<Arc<dyn EngineRegistry>>,
    graph: Option<Arc<dyn WorkflowGraph>>,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    messages: Option<Arc<dyn MessageSink>>,
    fs: Option<FileSystemHandle>,
}

impl PluginHostBuilder {
    /// Store holding the repository list, workspace list and settings.
    #[must_use]
    pub fn config_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    /// Source of per-workspace stores.
    #[must_use]
    pub fn workspace_stores(mut self, stores: Arc<dyn WorkspaceStores>) -> Self {
        self.workspace_stores = Some(stores);
        self
    }

    /// Sandbox factories per execution kind.
    #[must_use]
    pub fn backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = backends;
        self
    }

    /// Window rendering collaborator.
    #[must_use]
    pub fn windows(mut self, windows: Arc<dyn WindowManager>) -> Self {
        self.windows = Some(windows);
        self
    }

    /// Remote engine lookup.
    #[must_use]
    pub fn engines(mut self, engines: Arc<dyn EngineRegistry>) -> Self {
        self.engines = Some(engines);
        self
    }

    /// Workflow graph receiving operation nodes.
    #[must_use]
    pub fn graph(mut self, graph: Arc<dyn WorkflowGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Fetcher for manifests and plugin sources. Defaults to HTTP.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// User-facing message channel. Defaults to the tracing log.
    #[must_use]
    pub fn messages(mut self, messages: Arc<dyn MessageSink>) -> Self {
        self.messages = Some(messages);
        self
    }

    /// File-system collaborator handed to every sandbox.
    #[must_use]
    pub fn file_system(mut self, fs: FileSystemHandle) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Assembles the host.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::MissingCollaborator`] when a required
    /// collaborator was not supplied, and [`HostError::Fetch`] when the
    /// default HTTP fetcher cannot be built.
    pub fn build(self) -> Result<PluginHost, HostError> {
        let missing = |collaborator| HostError::MissingCollaborator { collaborator };
        let config_store = self.config_store.ok_or_else(|| missing("config_store"))?;
        let workspace_stores = self.workspace_stores.ok_or_else(|| missing("workspace_stores"))?;
        let windows = self.windows.ok_or_else(|| missing("windows"))?;
        let engines = self.engines.ok_or_else(|| missing("engines"))?;
        let graph = self.graph.ok_or_else(|| missing("graph"))?;
        let fetcher: Arc<dyn SourceFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(self.config.fetch_timeout())?),
        };
        let messages: Arc<dyn MessageSink> = self
            .messages
            .unwrap_or_else(|| Arc::new(TracingMessageSink));
        let events = EventBus::new();

        let repositories = Arc::new(RepositoryResolver::new(
            Arc::clone(&fetcher),
            Arc::clone(&config_store),
            Arc::clone(&messages),
        ));
        let workspace = Arc::new(WorkspaceManager::new(
            Arc::clone(&config_store),
            workspace_stores,
            events.clone(),
            Arc::clone(&messages),
        ));
        let controller = LifecycleController::new(ControllerParts {
            backends: self.backends,
            engines,
            windows,
            graph,
            events: events.clone(),
            messages: Arc::clone(&messages),
            config_store,
            fs: self.fs,
            workspace: self.config.workspace().to_owned(),
        });
        let references = ReferenceResolver::new(fetcher);
        let installer = DependencyInstaller::new(
            references.clone(),
            Arc::clone(&repositories),
            Arc::clone(&workspace),
            Arc::clone(&controller),
            Arc::clone(&messages),
            events.clone(),
        );
        Ok(PluginHost {
            config: self.config,
            events,
            messages,
            repositories,
            workspace,
            controller,
            references,
            installer,
            reload_guards: ReloadGuards::new(),
        })
    }
}

/// Plugin host lifecycle controller with its collaborators wired together.
pub struct PluginHost {
    config: Config,
    events: EventBus,
    messages: Arc<dyn MessageSink>,
    repositories: Arc<RepositoryResolver>,
    workspace: Arc<WorkspaceManager>,
    controller: Arc<LifecycleController>,
    references: ReferenceResolver,
    installer: DependencyInstaller,
    reload_guards: ReloadGuards,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("config", &self.config)
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl PluginHost {
    /// Starts a builder for a host configured by `config`.
    #[must_use]
    pub fn builder(config: Config) -> PluginHostBuilder {
        PluginHostBuilder {
            config,
            config_store: None,
            workspace_stores: None,
            backends: BackendRegistry::new(),
            windows: None,
            engines: None,
            graph: None,
            fetcher: None,
            messages: None,
            fs: None,
        }
    }

    /// Loads the repository and workspace lists, opens the configured
    /// workspace and starts its plugins.
    ///
    /// # Errors
    ///
    /// Returns storage failures and [`HostError::NoWorkspace`].
    pub async fn init(&self) -> Result<Vec<InstalledPlugin>, HostError> {
        self.repositories.load_repository_list().await?;
        self.workspace.load_workspace_list().await?;
        let selected = self
            .workspace
            .load_workspace(Some(self.config.workspace()))
            .await?;
        self.controller.set_workspace(selected);
        self.reload_plugins(self.config.skip_native_on_start()).await
    }

    /// Subscribes to host events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Instance lifecycle controller.
    #[must_use]
    pub const fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Repository list and available plugins.
    #[must_use]
    pub fn repositories(&self) -> &RepositoryResolver {
        &self.repositories
    }

    /// Workspace list and documents.
    #[must_use]
    pub fn workspace(&self) -> &WorkspaceManager {
        &self.workspace
    }

    /// Live instance named `name`.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.controller.index().by_name(name)
    }

    /// See [`DependencyInstaller::install`].
    ///
    /// # Errors
    ///
    /// See [`DependencyInstaller::install`].
    pub async fn install(
        &self,
        reference: &str,
        tag: Option<&str>,
        do_not_load: bool,
    ) -> Result<PluginRecord, HostError> {
        self.installer.install(reference, tag, do_not_load).await
    }

    /// See [`DependencyInstaller::load_recursively`].
    ///
    /// # Errors
    ///
    /// See [`DependencyInstaller::load_recursively`].
    pub async fn load_recursively(
        &self,
        reference: &str,
        tag: Option<&str>,
    ) -> Result<Option<Arc<PluginInstance>>, HostError> {
        self.installer.load_recursively(reference, tag).await
    }

    /// Restarts every plugin of the open workspace.
    ///
    /// Live instances are terminated and registrations cleared first.
    /// Records failing hash verification stay listed but are not loaded.
    /// With `skip_native`, native-kind plugins are left for engine
    /// resynchronisation. A plugin that fails to load does not stop the
    /// others.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures while reading
    /// the workspace.
    pub async fn reload_plugins(&self, skip_native: bool) -> Result<Vec<InstalledPlugin>, HostError> {
        self.controller.terminate_all().await;
        let installed = self.workspace.reload_documents().await?;
        self.repositories.sync_installed(
            installed
                .iter()
                .map(|plugin| (plugin.record.name.as_str(), plugin.record.tag.as_deref())),
        );
        for plugin in installed.iter().filter(|plugin| plugin.verified) {
            let record = &plugin.record;
            if skip_native && record.plugin_kind().is_some_and(PluginKind::is_native) {
                debug!(target: HOST_TARGET, plugin = %record.name, "native plugin left for engine connection");
                continue;
            }
            if let Err(error) = self.controller.reload(record).await {
                error!(target: HOST_TARGET, plugin = %record.name, %error, "plugin failed to reload");
            }
        }
        info!(target: HOST_TARGET, count = installed.len(), "workspace plugins reloaded");
        Ok(installed)
    }

    /// Deletes `record` from the workspace and unloads it.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures; nothing is
    /// unloaded in that case.
    pub async fn remove_plugin(&self, record: &PluginRecord) -> Result<(), HostError> {
        if let Err(error) = self.workspace.remove_plugin(record).await {
            error!(target: HOST_TARGET, plugin = %record.name, %error, "error occured when removing plugin");
            self.messages.show_message(&error.user_message(), None);
            return Err(error);
        }
        self.repositories.mark_removed(&record.name);
        self.messages
            .show_message(&format!("\"{}\" has been removed.", record.name), None);
        self.controller.unload(&record.name, false).await;
        self.events.emit(HostEvent::PluginRemoved {
            name: record.name.clone(),
        });
        Ok(())
    }

    /// Stored source of the plugin with durable id `id`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures.
    pub async fn plugin_source(&self, id: &str) -> Result<String, HostError> {
        self.workspace.plugin_source(id).await
    }

    /// First docs block of the plugin with durable id `id`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures.
    pub async fn plugin_docs(&self, id: &str) -> Result<Option<String>, HostError> {
        self.workspace.plugin_docs(id).await
    }

    /// Re-resolves the origin of `instance` and records whether a newer
    /// source is available.
    ///
    /// With a stored hash, a changed source counts as an update unless its
    /// version is older. Without one, only a higher version counts. An
    /// instance without an origin falls back to the available entry of the
    /// same name; with neither, no update is reported.
    ///
    /// # Errors
    ///
    /// Returns resolution, fetch and parse failures of the remote source.
    pub async fn check_plugin_update(&self, instance: &PluginInstance) -> Result<bool, HostError> {
        let current = instance.config();
        let available = self.repositories.available();
        let declared = current
            .origin
            .clone()
            .filter(|origin| !origin.is_empty())
            .or_else(|| fallback_origin(&available, instance.name()));
        let Some(origin) = declared else {
            instance.set_update_available(false);
            return Ok(false);
        };
        let source = self.references.resolve(&origin, &available).await?;
        let remote = parse_plugin_source(
            &source.code,
            &ParseOverrides {
                tag: source.tag.clone(),
                ..ParseOverrides::default()
            },
        )?;
        let current_version = current.version.as_deref().unwrap_or_default();
        let remote_version = remote.version.as_deref().unwrap_or_default();
        let ordering = compare_versions(current_version, remote_version);
        let available_update = match current.hash.as_deref().filter(|hash| !hash.is_empty()) {
            Some(hash) => hash != content_hash(&source.code) && ordering.is_le(),
            None => ordering.is_lt(),
        };
        instance.set_update_available(available_update);
        debug!(target: HOST_TARGET, plugin = %instance.name(), available_update, "update check finished");
        Ok(available_update)
    }

    /// Checks every live instance for updates; failures are logged.
    pub async fn check_updates(&self) {
        for instance in self.controller.index().all() {
            if let Err(error) = self.check_plugin_update(&instance).await {
                warn!(target: HOST_TARGET, plugin = %instance.name(), %error, "update check failed");
            }
        }
    }

    /// Reloads installed native plugins that should run on the engine that
    /// just connected.
    ///
    /// A plugin whose reload is already in flight is skipped. Failures are
    /// logged per plugin.
    pub async fn engine_connected(&self, engine_id: &str) {
        for plugin in self.workspace.installed() {
            let record = plugin.record;
            if !plugin.verified || !record.plugin_kind().is_some_and(PluginKind::is_native) {
                continue;
            }
            let mode = EngineMode::from_setting(record.engine_mode.as_deref());
            let running = self
                .controller
                .index()
                .by_name(&record.name)
                .map(|instance| instance.running_status());
            if !should_reload(&mode, engine_id, running) {
                continue;
            }
            let Some(_guard) = self.reload_guards.begin(&record.name) else {
                debug!(target: HOST_TARGET, plugin = %record.name, engine = %engine_id, "reload already in flight");
                continue;
            };
            info!(target: HOST_TARGET, plugin = %record.name, engine = %engine_id, "reloading on engine connection");
            if let Err(error) = self.controller.reload(&record).await {
                error!(target: HOST_TARGET, plugin = %record.name, engine = %engine_id, %error, "reload failed");
            }
        }
    }

    /// Reloads or unloads live native instances bound to a lost engine.
    pub async fn engine_disconnected(&self, engine_id: &str) {
        let bound: Vec<Arc<PluginInstance>> = self
            .controller
            .index()
            .all()
            .into_iter()
            .filter(|instance| instance.kind().is_some_and(PluginKind::is_native))
            .filter(|instance| instance.binding().is_bound_to(engine_id))
            .collect();
        for instance in bound {
            let config = instance.config();
            let mode = EngineMode::from_setting(config.engine_mode.as_deref());
            match disconnect_action(&mode, instance.is_disconnected(), !config.code.is_empty()) {
                DisconnectAction::Reload => {
                    let record = PluginRecord::from_config(config);
                    if let Err(error) = self.controller.reload(&record).await {
                        error!(target: HOST_TARGET, plugin = %instance.name(), engine = %engine_id, %error, "reload failed");
                    }
                }
                DisconnectAction::Unload => self.controller.unload(instance.name(), false).await,
            }
        }
    }

    /// Opens workspace `name` and restarts its plugins.
    ///
    /// # Errors
    ///
    /// See [`WorkspaceManager::load_workspace`] and [`Self::reload_plugins`].
    pub async fn load_workspace(&self, name: &str) -> Result<Vec<InstalledPlugin>, HostError> {
        let selected = self.workspace.load_workspace(Some(name)).await?;
        self.controller.set_workspace(selected);
        self.reload_plugins(false).await
    }

    /// Known workspace names.
    #[must_use]
    pub fn workspaces(&self) -> Vec<String> {
        self.workspace.workspaces()
    }

    /// See [`WorkspaceManager::remove_workspace`].
    ///
    /// # Errors
    ///
    /// See [`WorkspaceManager::remove_workspace`].
    pub async fn remove_workspace(&self, name: &str) -> Result<(), HostError> {
        self.workspace.remove_workspace(name).await
    }

    /// Plugins listed in the open workspace.
    #[must_use]
    pub fn installed(&self) -> Vec<InstalledPlugin> {
        self.workspace.installed()
    }

    /// Workflows saved in the open workspace.
    #[must_use]
    pub fn workflows(&self) -> Vec<WorkflowRecord> {
        self.workspace.workflows()
    }

    /// See [`WorkspaceManager::save_workflow`].
    ///
    /// # Errors
    ///
    /// See [`WorkspaceManager::save_workflow`].
    pub async fn save_workflow(&self, name: &str, graph: &serde_json::Value) -> Result<WorkflowRecord, HostError> {
        self.workspace.save_workflow(name, graph).await
    }

    /// See [`WorkspaceManager::remove_workflow`].
    ///
    /// # Errors
    ///
    /// See [`WorkspaceManager::remove_workflow`].
    pub async fn remove_workflow(&self, workflow: &WorkflowRecord) -> Result<(), HostError> {
        self.workspace.remove_workflow(workflow).await
    }

    /// Plugins offered by the selected repository.
    #[must_use]
    pub fn available(&self) -> Vec<ManifestEntry> {
        self.repositories.available()
    }

    /// See [`RepositoryResolver::add_repository`].
    ///
    /// # Errors
    ///
    /// See [`RepositoryResolver::add_repository`].
    pub async fn add_repository(&self, repository: Repository) -> Result<Repository, HostError> {
        self.repositories.add_repository(repository).await
    }

    /// See [`RepositoryResolver::remove_repository`].
    ///
    /// # Errors
    ///
    /// See [`RepositoryResolver::remove_repository`].
    pub async fn remove_repository(&self, repository: &Repository) -> Result<(), HostError> {
        self.repositories.remove_repository(repository).await
    }

    /// See [`RepositoryResolver::reload_repository`].
    ///
    /// # Errors
    ///
    /// See [`RepositoryResolver::reload_repository`].
    pub async fn reload_repository(&self, repository: &Repository) -> Result<Manifest, HostError> {
        self.repositories.reload_repository(repository).await
    }

    /// Terminates every live instance.
    pub async fn shutdown(&self) {
        self.controller.terminate_all().await;
    }
}

fn fallback_origin(available: &[ManifestEntry], name: &str) -> Option<String> {
    available
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.uri.clone())
}
