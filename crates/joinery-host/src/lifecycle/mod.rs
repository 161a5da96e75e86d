//! Plugin instance lifecycle.
//!
//! [`LifecycleController`] drives every instance from instantiation through
//! connection, capability registration and `setup()` to termination. The
//! instance is stored in the [`InstanceIndex`] before the sandbox reports
//! readiness, so an unload issued mid-connection is observed: the load then
//! terminates its sandbox and fails with [`HostError::Superseded`] instead
//! of registering.

mod index;
mod instance;
mod preview;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::BoxFuture;
use crate::api::HostApi;
use crate::backend::{
    ApiMember, BackendError, BackendFactory, BackendRegistry, ConnectionSignal, FileSystemHandle,
    InstanceContext, InstanceSpec, Instantiation, PluginKind,
};
use crate::bridge::filter_for_plugin;
use crate::capability::{CapabilityRegistry, OperationDescriptor, WindowOpener};
use crate::engine::{EngineBinding, EngineMode, EngineRegistry};
use crate::error::HostError;
use crate::events::{EventBus, HostEvent};
use crate::ids::{instance_id, rand_id};
use crate::messages::MessageSink;
use crate::parser::{ParseOverrides, PluginConfig, parse_plugin_source};
use crate::repository::is_truthy;
use crate::store::KeyValueStore;
use crate::window::{WindowCallbacks, WindowConfig, WindowHandle, WindowManager};
use crate::workflow::WorkflowGraph;
use crate::workspace::PluginRecord;

pub use self::index::InstanceIndex;
pub use self::instance::{InstanceState, PluginInstance};
use self::preview::PreviewApi;

const LIFECYCLE_TARGET: &str = "joinery_host::lifecycle";

/// How long load failures stay on the message channel.
const FAILURE_NOTICE: Duration = Duration::from_secs(15);

const UNTITLED_WINDOW: &str = "untitled window";

/// Collaborators the controller is built from.
pub struct ControllerParts {
    /// Sandbox factories per execution kind.
    pub backends: BackendRegistry,
    /// Remote engine lookup.
    pub engines: Arc<dyn EngineRegistry>,
    /// Window rendering collaborator.
    pub windows: Arc<dyn WindowManager>,
    /// Workflow graph receiving operation nodes.
    pub graph: Arc<dyn WorkflowGraph>,
    /// Host event channel.
    pub events: EventBus,
    /// User-facing message channel.
    pub messages: Arc<dyn MessageSink>,
    /// Store holding per-plugin settings.
    pub config_store: Arc<dyn KeyValueStore>,
    /// File-system collaborator handed to every sandbox.
    pub fs: Option<FileSystemHandle>,
    /// Workspace exposed to sandboxes.
    pub workspace: String,
}

/// Drives plugin instances through their lifecycle.
pub struct LifecycleController {
    backends: BackendRegistry,
    engines: Arc<dyn EngineRegistry>,
    windows: Arc<dyn WindowManager>,
    capabilities: CapabilityRegistry,
    index: InstanceIndex,
    events: EventBus,
    messages: Arc<dyn MessageSink>,
    config_store: Arc<dyn KeyValueStore>,
    fs: Option<FileSystemHandle>,
    workspace: Mutex<String>,
    this: Weak<Self>,
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("backends", &self.backends)
            .field("instances", &self.index.len())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Builds a controller owning its own instance index and registry.
    #[must_use]
    pub fn new(parts: ControllerParts) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let opener: Weak<dyn WindowOpener> = this.clone();
            Self {
                capabilities: CapabilityRegistry::new(
                    parts.graph,
                    Arc::clone(&parts.windows),
                    parts.events.clone(),
                    opener,
                ),
                backends: parts.backends,
                engines: parts.engines,
                windows: parts.windows,
                index: InstanceIndex::new(),
                events: parts.events,
                messages: parts.messages,
                config_store: parts.config_store,
                fs: parts.fs,
                workspace: Mutex::new(parts.workspace),
                this: this.clone(),
            }
        })
    }

    /// Live instances.
    #[must_use]
    pub const fn index(&self) -> &InstanceIndex {
        &self.index
    }

    /// Published capabilities.
    #[must_use]
    pub const fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    /// Sandbox factories.
    #[must_use]
    pub const fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Engine lookup.
    #[must_use]
    pub fn engines(&self) -> &dyn EngineRegistry {
        self.engines.as_ref()
    }

    /// Host event channel.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// User-facing message channel.
    #[must_use]
    pub fn messages(&self) -> &dyn MessageSink {
        self.messages.as_ref()
    }

    /// Store holding per-plugin settings.
    #[must_use]
    pub fn config_store(&self) -> &dyn KeyValueStore {
        self.config_store.as_ref()
    }

    /// Workspace exposed to new sandboxes.
    #[must_use]
    pub fn workspace(&self) -> String {
        self.workspace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Changes the workspace exposed to sandboxes created from now on.
    pub fn set_workspace(&self, workspace: impl Into<String>) {
        *self.workspace.lock().unwrap_or_else(PoisonError::into_inner) = workspace.into();
    }

    fn host_api(&self) -> HostApi {
        HostApi::new(self.this.clone())
    }

    fn factory_for(&self, config: &PluginConfig) -> Result<(PluginKind, Arc<dyn BackendFactory>), HostError> {
        let unsupported = || HostError::UnsupportedType {
            kind: config.kind.clone(),
        };
        let kind = config.plugin_kind().ok_or_else(unsupported)?;
        let factory = self.backends.factory(kind).ok_or_else(unsupported)?;
        Ok((kind, factory))
    }

    /// Starts a sandbox for `config` and waits until it is set up.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::InvalidName`] or [`HostError::UnsupportedType`]
    /// before anything is instantiated, [`HostError::Superseded`] when the
    /// name was unloaded while connecting or setting up, and backend, registration or
    /// [`HostError::MissingSetup`] failures after the sandbox was created.
    /// A failed instance is terminated before the error is returned.
    pub async fn load(&self, mut config: PluginConfig) -> Result<Arc<PluginInstance>, HostError> {
        validate_name(&config)?;
        let (kind, factory) = self.factory_for(&config)?;
        if config.id.is_empty() {
            config.id = instance_id(&config.name);
        }
        let mode = EngineMode::from_setting(config.engine_mode.as_deref());
        config.engine_mode = Some(mode.as_str().to_owned());
        let binding = if kind.is_native() {
            EngineBinding::resolve(self.engines.as_ref(), mode, config.resumed)
        } else {
            EngineBinding::unbound(mode)
        };
        let context = InstanceContext {
            tag: config.tag.clone(),
            workspace: self.workspace(),
            engine_url: binding.engine_url(),
        };
        let name = config.name.clone();
        let api = self.host_api();
        let spec = InstanceSpec {
            config: config.clone(),
            api: api.clone(),
            context: context.clone(),
            fs: self.fs.clone(),
            preview: false,
            window: None,
        };
        let Instantiation { sandbox, ready } = factory
            .instantiate(spec)
            .map_err(|source| self.report(HostError::backend(&name, source)))?;
        let instance = Arc::new(PluginInstance::new(config, sandbox, binding));
        api.bind(&instance);
        instance.push_log(format!(
            "Loading plugin {} (TAG={}, WORKSPACE={})",
            instance.id(),
            context.tag.as_deref().unwrap_or("undefined"),
            context.workspace
        ));
        if let Some(url) = &context.engine_url {
            instance.push_log(format!("ENGINE_URL={url}"));
        }
        self.index.insert(Arc::clone(&instance));
        info!(target: LIFECYCLE_TARGET, plugin = %name, id = %instance.id(), kind = %kind, "loading plugin");

        match self.connect(&instance, ready).await {
            Ok(()) => {
                self.events.emit(HostEvent::PluginLoaded {
                    id: instance.id().to_owned(),
                    name,
                });
                Ok(instance)
            }
            Err(error) => {
                if error.is_superseded() {
                    warn!(
                        target: LIFECYCLE_TARGET,
                        id = %instance.id(),
                        "WARNING: this plugin is ready but unloaded"
                    );
                } else {
                    instance.set_state(InstanceState::Failed);
                    instance.sandbox().error(&name, &error.to_string());
                    self.capabilities.unregister(&instance, None);
                    self.index.remove(&instance);
                    let notice = match &error {
                        HostError::Backend { .. } => error.to_string(),
                        other => format!("<{name}>: {}", other.user_message()),
                    };
                    error!(target: LIFECYCLE_TARGET, plugin = %name, %error, "error occured when loading plugin");
                    self.messages.show_message(&notice, Some(FAILURE_NOTICE));
                }
                instance.terminate().await;
                Err(error)
            }
        }
    }

    async fn connect(&self, instance: &Arc<PluginInstance>, ready: ConnectionSignal) -> Result<(), HostError> {
        let name = instance.name().to_owned();
        ready
            .wait()
            .await
            .map_err(|source| HostError::backend(&name, source))?;
        instance.push_log("Plugin connected.");
        if instance.is_unloaded() {
            return Err(HostError::Superseded { plugin: name });
        }
        instance.set_state(InstanceState::Connected);
        let api = instance.api().ok_or_else(|| {
            HostError::backend(&name, BackendError::new("Error occured when loading plugin."))
        })?;

        let config = instance.config();
        if !config.kind.is_empty() {
            self.capabilities
                .register(instance, OperationDescriptor::for_plugin(config))?;
            instance.set_state(InstanceState::Registered);
        }
        if !config.extensions.is_empty() {
            self.capabilities
                .register_extensions(instance, &config.extensions);
        }

        if config.resumed && api.exposes(ApiMember::Resume) {
            instance.push_log("Resuming plugin.");
            api.resume()
                .await
                .map_err(|source| HostError::backend(&name, source))?;
        } else if api.exposes(ApiMember::Setup) {
            instance.push_log("Setting up plugin.");
            api.setup()
                .await
                .map_err(|source| HostError::backend(&name, source))?;
        } else {
            return Err(HostError::MissingSetup { plugin: name });
        }
        if instance.is_unloaded() {
            return Err(HostError::Superseded { plugin: name });
        }
        instance.set_state(InstanceState::Running);
        Ok(())
    }

    /// Registers a window plugin behind a proxy instead of starting it.
    ///
    /// The proxy's `run` opens a window of the plugin's own type, which
    /// is when the real sandbox is started.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::InvalidName`], [`HostError::UnsupportedType`],
    /// backend failures or registration failures.
    pub fn preload(&self, mut config: PluginConfig) -> Result<Arc<PluginInstance>, HostError> {
        validate_name(&config)?;
        let (kind, factory) = self.factory_for(&config)?;
        if config.id.is_empty() {
            config.id = instance_id(&config.name);
        }
        let name = config.name.clone();
        let api = self.host_api();
        let spec = InstanceSpec {
            config: config.clone(),
            api: api.clone(),
            context: InstanceContext {
                tag: config.tag.clone(),
                workspace: self.workspace(),
                engine_url: None,
            },
            fs: self.fs.clone(),
            preview: true,
            window: None,
        };
        let Instantiation { sandbox, .. } = factory
            .instantiate(spec)
            .map_err(|source| self.report(HostError::backend(&name, source)))?;
        let proxy = Arc::new(PreviewApi::new(self.this.clone(), config.clone()));
        let binding = EngineBinding::unbound(EngineMode::from_setting(config.engine_mode.as_deref()));
        let instance = Arc::new(PluginInstance::new(config, sandbox, binding).with_proxy(proxy));
        api.bind(&instance);
        self.capabilities
            .register(&instance, OperationDescriptor::for_plugin(instance.config()))?;
        instance.set_state(InstanceState::Registered);
        self.index.insert(Arc::clone(&instance));
        debug!(target: LIFECYCLE_TARGET, plugin = %name, kind = %kind, "window plugin preloaded");
        self.events.emit(HostEvent::PluginLoaded {
            id: instance.id().to_owned(),
            name,
        });
        Ok(instance)
    }

    /// Unloads every live instance named `name`.
    ///
    /// Instances leave both indices immediately, are marked unloaded, lose
    /// their capabilities and are then terminated. A temporary unload is
    /// one that a reload immediately follows; only a permanent unload
    /// emits [`HostEvent::PluginUnloaded`].
    pub async fn unload(&self, name: &str, temporary: bool) {
        let instances = self.index.remove_named(name);
        for instance in &instances {
            instance.mark_unloaded();
            self.capabilities.unregister(instance, None);
        }
        for instance in &instances {
            instance.terminate().await;
        }
        if !instances.is_empty() {
            debug!(target: LIFECYCLE_TARGET, plugin = name, count = instances.len(), temporary, "plugin unloaded");
        }
        if !temporary {
            self.events.emit(HostEvent::PluginUnloaded {
                name: name.to_owned(),
            });
        }
    }

    /// Unloads a single instance.
    pub async fn unload_instance(&self, instance: &Arc<PluginInstance>) {
        self.index.remove(instance);
        instance.mark_unloaded();
        self.capabilities.unregister(instance, None);
        instance.terminate().await;
    }

    /// Terminates every live instance and drops all registrations.
    pub async fn terminate_all(&self) {
        let instances = self.index.clear();
        for instance in &instances {
            instance.mark_unloaded();
            self.capabilities.unregister(instance, None);
        }
        self.capabilities.clear();
        for instance in instances {
            instance.terminate().await;
        }
    }

    /// Replaces any running copy of `record` with a fresh instance.
    ///
    /// Collections are containers and yield `Ok(None)`. Window kinds are
    /// preloaded; everything else is loaded.
    ///
    /// # Errors
    ///
    /// Returns parse failures of the stored source and any error from
    /// [`Self::load`] or [`Self::preload`].
    pub async fn reload(&self, record: &PluginRecord) -> Result<Option<Arc<PluginInstance>>, HostError> {
        self.unload(&record.name, true).await;
        let overrides = ParseOverrides {
            tag: record.tag.clone(),
            origin: record.origin.clone(),
            uri: None,
            durable_id: Some(record.id.clone()).filter(|id| !id.is_empty()),
            engine_mode: record.engine_mode.clone(),
            hash: record.hash.clone(),
        };
        let config = parse_plugin_source(&record.code, &overrides)
            .map_err(|error| self.report(HostError::Parse(error)))?;
        let kind = config.plugin_kind();
        if kind == Some(PluginKind::Collection) {
            return Ok(None);
        }
        if config.name != record.name {
            self.unload(&config.name, true).await;
        }
        let instance = if kind.is_some_and(PluginKind::is_window) {
            self.preload(config)?
        } else {
            self.load(config).await?
        };
        Ok(Some(instance))
    }

    /// Opens a window.
    ///
    /// Built-in `imjoy/*` types are handed straight to the window manager.
    /// Other types must be registered by a window-kind plugin, whose
    /// sandbox is started to render into the new window.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::WindowTypeNotRegistered`],
    /// [`HostError::NotAWindowPlugin`], window manager failures and
    /// failures of the rendering sandbox.
    pub async fn create_window(
        &self,
        source: Option<Arc<PluginInstance>>,
        mut config: WindowConfig,
    ) -> Result<WindowHandle, HostError> {
        if config.name.is_empty() {
            UNTITLED_WINDOW.clone_into(&mut config.name);
        }
        debug!(
            target: LIFECYCLE_TARGET,
            source = source.as_ref().map(|plugin| plugin.name()),
            window_type = %config.window_type,
            "creating window"
        );
        if config.is_builtin() {
            config.id = Some(format!("imjoy_{}", rand_id()));
            let id = self.windows.add_window(&config).await?;
            let callbacks = self.windows.setup_callbacks(&config);
            tokio::task::yield_now().await;
            callbacks.refresh();
            return Ok(WindowHandle {
                id,
                callbacks,
                plugin: None,
            });
        }

        let registration = self
            .capabilities
            .window(&config.window_type)
            .ok_or_else(|| HostError::WindowTypeNotRegistered {
                window_type: config.window_type.clone(),
            })?;
        let kind = registration
            .config
            .plugin_kind()
            .filter(|kind| kind.is_window())
            .ok_or_else(|| HostError::NotAWindowPlugin {
                window_type: config.window_type.clone(),
            })?;
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("{}_{}", registration.plugin_id, rand_id()));
        config.id = Some(id.clone());
        if config.window_container.is_none() {
            self.windows.add_window(&config).await?;
        }
        let callbacks = self.windows.setup_callbacks(&config);
        tokio::task::yield_now().await;
        callbacks.refresh();

        let rendered = self
            .render_window(registration.config, kind, &config, Arc::clone(&callbacks))
            .await;
        callbacks.refresh();
        let instance = rendered?;
        let closing = Arc::downgrade(&instance);
        callbacks.on_close(Box::new(move || {
            Box::pin(async move {
                if let Some(closed) = closing.upgrade() {
                    closed.terminate().await;
                }
            })
        }));
        Ok(WindowHandle {
            id,
            callbacks,
            plugin: Some(instance),
        })
    }

    async fn render_window(
        &self,
        template: PluginConfig,
        kind: PluginKind,
        window: &WindowConfig,
        callbacks: Arc<dyn WindowCallbacks>,
    ) -> Result<Arc<PluginInstance>, HostError> {
        let factory = self
            .backends
            .factory(kind)
            .ok_or_else(|| HostError::UnsupportedType {
                kind: template.kind.clone(),
            })?;
        let mut config = template;
        if let Some(id) = &window.id {
            config.id.clone_from(id);
        }
        if window.tag.is_some() {
            config.tag.clone_from(&window.tag);
        }
        let name = config.name.clone();
        let api = self.host_api();
        let spec = InstanceSpec {
            config: config.clone(),
            api: api.clone(),
            context: InstanceContext {
                tag: config.tag.clone(),
                workspace: self.workspace(),
                engine_url: None,
            },
            fs: self.fs.clone(),
            preview: false,
            window: Some(Arc::clone(&callbacks)),
        };
        let Instantiation { sandbox, ready } = factory
            .instantiate(spec)
            .map_err(|source| HostError::backend(&name, source))?;
        let instance = Arc::new(PluginInstance::new(
            config,
            sandbox,
            EngineBinding::unbound(EngineMode::Auto),
        ));
        api.bind(&instance);

        let outcome = self.drive_window(&instance, ready, window, callbacks.as_ref()).await;
        if let Err(error) = &outcome {
            instance.set_state(InstanceState::Failed);
            instance.sandbox().error(
                &name,
                &format!("Error occured when loading the window plugin {}: {error}", window.name),
            );
            instance.terminate().await;
        }
        outcome.map(|()| instance)
    }

    async fn drive_window(
        &self,
        instance: &Arc<PluginInstance>,
        ready: ConnectionSignal,
        window: &WindowConfig,
        callbacks: &dyn WindowCallbacks,
    ) -> Result<(), HostError> {
        let name = instance.name().to_owned();
        let connected = ready.wait().await;
        if !window.standalone {
            callbacks.focus();
        }
        connected.map_err(|source| HostError::backend(&name, source))?;
        instance.set_state(InstanceState::Connected);
        let api = instance.api().ok_or_else(|| {
            HostError::backend(&name, BackendError::new("the window plugin seems not ready."))
        })?;
        api.setup()
            .await
            .map_err(|source| HostError::backend(&name, source))?;
        instance.set_state(InstanceState::Running);

        let exposes_run = api.exposes(ApiMember::Run);
        if instance.config().runnable && !exposes_run {
            return Err(HostError::MissingRun { plugin: name });
        }
        if exposes_run {
            let record = window_call(window, &name);
            if let Some(call) = filter_for_plugin(&record) {
                api.run(call.into_value())
                    .await
                    .map_err(|source| HostError::backend(&name, source))?;
            }
        }
        Ok(())
    }

    /// Sends a failure to the message channel and the developer log.
    fn report(&self, error: HostError) -> HostError {
        error!(target: LIFECYCLE_TARGET, %error, "plugin operation failed");
        self.messages
            .show_message(&error.user_message(), Some(FAILURE_NOTICE));
        error
    }
}

impl WindowOpener for LifecycleController {
    fn open_window(
        &self,
        source: Option<Arc<PluginInstance>>,
        config: WindowConfig,
    ) -> BoxFuture<'static, Result<WindowHandle, HostError>> {
        let this = self.this.clone();
        Box::pin(async move {
            let controller = this.upgrade().ok_or(HostError::CallerUnavailable)?;
            controller.create_window(source, config).await
        })
    }
}

fn validate_name(config: &PluginConfig) -> Result<(), HostError> {
    if config.name.contains('/') {
        return Err(HostError::InvalidName {
            name: config.name.clone(),
        });
    }
    Ok(())
}

/// Call record for a window plugin's `run`, stamped with window provenance.
fn window_call(window: &WindowConfig, plugin_name: &str) -> Value {
    let mut data = match &window.data {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let previous = data.get("_op").cloned().unwrap_or(Value::Null);
    data.insert("_source_op".into(), previous);
    data.insert("_op".into(), Value::String(plugin_name.to_owned()));
    data.entry("_workflow_id").or_insert(Value::Null);

    let mut record = window.extra.clone();
    record.insert(
        "config".into(),
        if is_truthy(&window.config) {
            window.config.clone()
        } else {
            Value::Object(Map::new())
        },
    );
    record.insert("data".into(), Value::Object(data));
    Value::Object(record)
}
