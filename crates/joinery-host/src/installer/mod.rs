//! Recursive dependency installation.
//!
//! [`DependencyInstaller::install`] and [`DependencyInstaller::load_recursively`]
//! share one walk: resolve the reference, parse it, settle the effective tag,
//! process every declared dependency strictly in order, then perform the
//! terminal action. Install persists the plugin to the open workspace;
//! load-recursively only starts it. A failing dependency stops the walk and
//! is reported under the name of the plugin that declared it. Dependencies
//! processed before the failure keep their state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::error::HostError;
use crate::events::{EventBus, HostEvent};
use crate::lifecycle::{LifecycleController, PluginInstance};
use crate::messages::MessageSink;
use crate::parser::{ParseOverrides, PluginConfig, parse_plugin_source};
use crate::reference::ReferenceResolver;
use crate::repository::{ManifestEntry, RepositoryResolver};
use crate::workspace::{PluginRecord, WorkspaceManager};

const INSTALL_TARGET: &str = "joinery_host::installer";

const DOWNLOAD_NOTICE: Duration = Duration::from_secs(10);

/// What happens once a plugin's dependencies are in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Install { do_not_load: bool },
    Load,
}

/// Result of one step of the walk.
enum Outcome {
    Installed(PluginRecord),
    Loaded(Option<Arc<PluginInstance>>),
}

/// One pending reference.
struct Step {
    reference: String,
    tag: Option<String>,
    scope: Vec<ManifestEntry>,
    chain: Vec<String>,
}

/// Installs and loads plugins together with their dependencies.
pub struct DependencyInstaller {
    references: ReferenceResolver,
    repositories: Arc<RepositoryResolver>,
    workspace: Arc<WorkspaceManager>,
    controller: Arc<LifecycleController>,
    messages: Arc<dyn MessageSink>,
    events: EventBus,
}

impl std::fmt::Debug for DependencyInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyInstaller").finish_non_exhaustive()
    }
}

impl DependencyInstaller {
    /// Builds an installer over the host's collaborators.
    #[must_use]
    pub fn new(
        references: ReferenceResolver,
        repositories: Arc<RepositoryResolver>,
        workspace: Arc<WorkspaceManager>,
        controller: Arc<LifecycleController>,
        messages: Arc<dyn MessageSink>,
        events: EventBus,
    ) -> Self {
        Self {
            references,
            repositories,
            workspace,
            controller,
            messages,
            events,
        }
    }

    /// Installs `reference` and its dependencies into the open workspace.
    ///
    /// Unless `do_not_load` is set the plugin is started afterwards; a
    /// failure to start is reported but does not fail the install.
    ///
    /// # Errors
    ///
    /// Returns resolution, parse and storage failures,
    /// [`HostError::UnsupportedType`], [`HostError::DependencyCycle`], and
    /// [`HostError::Dependency`] wrapping the first failing dependency.
    pub async fn install(
        &self,
        reference: &str,
        tag: Option<&str>,
        do_not_load: bool,
    ) -> Result<PluginRecord, HostError> {
        let step = self.first_step(reference, tag);
        match self.walk(step, Terminal::Install { do_not_load }).await? {
            Outcome::Installed(record) => Ok(record),
            Outcome::Loaded(_) => Err(HostError::resolution(reference, "install produced no record")),
        }
    }

    /// Loads `reference` and its dependencies without persisting anything.
    ///
    /// Collections yield `Ok(None)`.
    ///
    /// # Errors
    ///
    /// As [`Self::install`], plus load failures of the plugin itself.
    pub async fn load_recursively(
        &self,
        reference: &str,
        tag: Option<&str>,
    ) -> Result<Option<Arc<PluginInstance>>, HostError> {
        let step = self.first_step(reference, tag);
        match self.walk(step, Terminal::Load).await? {
            Outcome::Loaded(instance) => Ok(instance),
            Outcome::Installed(_) => Ok(None),
        }
    }

    fn first_step(&self, reference: &str, tag: Option<&str>) -> Step {
        Step {
            reference: reference.to_owned(),
            tag: tag.map(str::to_owned),
            scope: self.repositories.available(),
            chain: Vec::new(),
        }
    }

    fn walk(&self, step: Step, terminal: Terminal) -> BoxFuture<'_, Result<Outcome, HostError>> {
        Box::pin(async move {
            let (mut config, scope) = self.resolve(&step).await?;
            if step.chain.contains(&config.name) {
                let mut chain = step.chain;
                chain.push(config.name);
                return Err(HostError::DependencyCycle { chain });
            }
            if !self.controller.backends().supports(&config.kind) {
                return Err(HostError::UnsupportedType { kind: config.kind });
            }
            self.settle(&mut config, step.tag.as_deref());

            let mut chain = step.chain;
            chain.push(config.name.clone());
            for dependency in config.dependencies.clone() {
                debug!(target: INSTALL_TARGET, plugin = %config.name, %dependency, "processing dependency");
                let next = Step {
                    reference: dependency,
                    tag: None,
                    scope: scope.clone(),
                    chain: chain.clone(),
                };
                self.walk(next, terminal)
                    .await
                    .map_err(|error| HostError::dependency(&config.name, error))?;
            }

            match terminal {
                Terminal::Install { do_not_load } => self
                    .save(config, step.tag.as_deref(), do_not_load)
                    .await
                    .map(Outcome::Installed),
                Terminal::Load => {
                    let record = PluginRecord::from_config(&config);
                    self.controller.reload(&record).await.map(Outcome::Loaded)
                }
            }
        })
    }

    /// Fetches and parses the source behind `step`, returning the scope its
    /// dependencies are resolved in.
    async fn resolve(&self, step: &Step) -> Result<(PluginConfig, Vec<ManifestEntry>), HostError> {
        let source = match self.references.resolve(&step.reference, &step.scope).await {
            Ok(source) => source,
            Err(error) => {
                warn!(target: INSTALL_TARGET, reference = %step.reference, %error, "plugin source unavailable");
                self.messages
                    .show_message(&error.user_message(), Some(DOWNLOAD_NOTICE));
                return Err(error);
            }
        };
        let overrides = ParseOverrides {
            tag: source.tag.clone(),
            origin: Some(step.reference.clone()),
            uri: Some(source.uri.clone()),
            ..ParseOverrides::default()
        };
        let mut config = parse_plugin_source(&source.code, &overrides)?;
        if config.origin.as_deref().is_none_or(str::is_empty) {
            config.origin = Some(step.reference.clone());
        }
        Ok((config, source.scope))
    }

    /// Applies engine affinity, tag precedence and origin clean-up.
    fn settle(&self, config: &mut PluginConfig, explicit_tag: Option<&str>) {
        let running = self.controller.index().by_name(&config.name);
        if config.plugin_kind().is_some_and(|kind| kind.is_native()) {
            if let Some(old) = &running {
                config.engine_mode.clone_from(&old.config().engine_mode);
            }
        }
        let running_tag = running.as_ref().and_then(|old| old.config().tag.clone());
        if let Some(tag) = explicit_tag.map(str::to_owned).or(running_tag) {
            config.tag = Some(tag);
        }
        if config.tag.is_some() {
            config.origin = config.origin.as_deref().map(strip_origin_tag);
        }
    }

    async fn save(
        &self,
        config: PluginConfig,
        explicit_tag: Option<&str>,
        do_not_load: bool,
    ) -> Result<PluginRecord, HostError> {
        let record = PluginRecord::from_config(&config);
        self.workspace.save_plugin(record.clone()).await?;
        self.repositories
            .mark_installed(&record.name, explicit_tag.or(record.tag.as_deref()));
        info!(target: INSTALL_TARGET, plugin = %record.name, tag = ?record.tag, "plugin installed");
        self.messages.show_message(
            &format!("Plugin \"{}\" has been successfully installed.", record.name),
            None,
        );
        self.events.emit(HostEvent::PluginInstalled {
            name: record.name.clone(),
        });
        if !do_not_load {
            if let Err(error) = self.controller.reload(&record).await {
                warn!(target: INSTALL_TARGET, plugin = %record.name, %error, "installed plugin failed to load");
            }
        }
        Ok(record)
    }
}

/// Drops a plugin-side `@tag` from an origin of the form `repo:plugin@tag`.
#[must_use]
pub fn strip_origin_tag(origin: &str) -> String {
    match origin.split_once(':') {
        Some((repository, plugin)) => match plugin.split_once('@') {
            Some((name, _)) => format!("{repository}:{name}"),
            None => origin.to_owned(),
        },
        None => origin.to_owned(),
    }
}
