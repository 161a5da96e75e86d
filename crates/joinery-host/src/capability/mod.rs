//! Capability registry.
//!
//! A running instance publishes operations, window types and input/output
//! schemas through [`CapabilityRegistry::register`]. Each operation becomes
//! a node template in the workflow graph whose handlers translate between
//! node and call shapes before invoking the instance. Registrations are
//! keyed by operation key and owned by the registering instance; only the
//! owner may replace or remove them.

mod debounce;
mod descriptor;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::backend::{ApiMember, PluginKind};
use crate::bridge::{WorkflowNode, plugin_to_workflow, workflow_to_plugin};
use crate::error::HostError;
use crate::events::{EventBus, HostEvent};
use crate::ids::{durable_key, rand_id};
use crate::lifecycle::PluginInstance;
use crate::parser::PluginConfig;
use crate::repository::is_truthy;
use crate::schema::CompiledSchema;
use crate::window::{
    GENERIC_WINDOW_TYPE, InputLoader, InputLoaderDescriptor, WindowConfig, WindowHandle,
    WindowManager,
};
use crate::workflow::{NodeHandler, NodeHandlers, NodeTemplate, UpdateHandler, WorkflowGraph};

use self::debounce::Debouncer;
pub use self::debounce::UPDATE_DEBOUNCE;
pub use self::descriptor::{OperationDescriptor, normalize_ui, wrap_schema};
use self::descriptor::NormalizedDescriptor;

const CAPABILITY_TARGET: &str = "joinery_host::capability";

/// Opens windows on behalf of the registry's input loaders.
pub trait WindowOpener: Send + Sync {
    /// Opens `config`, optionally on behalf of `source`.
    fn open_window(
        &self,
        source: Option<Arc<PluginInstance>>,
        config: WindowConfig,
    ) -> BoxFuture<'static, Result<WindowHandle, HostError>>;
}

/// Computes the registry key of an operation.
#[must_use]
pub fn op_key(plugin_name: &str, op_name: &str) -> String {
    if op_name == plugin_name {
        plugin_name.to_owned()
    } else {
        format!("{plugin_name}/{op_name}")
    }
}

/// A published operation.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    /// Registry key.
    pub key: String,
    /// Owning instance id.
    pub plugin_id: String,
    /// Owning plugin name.
    pub plugin_name: String,
    /// Operation name.
    pub op_name: String,
    /// Node template handed to the graph.
    pub template: NodeTemplate,
    /// Compiled input schema.
    pub inputs: Option<CompiledSchema>,
    /// Compiled output schema.
    pub outputs: Option<CompiledSchema>,
}

/// Plugin serving a window type.
#[derive(Debug, Clone)]
pub struct WindowRegistration {
    /// Config of the serving plugin.
    pub config: PluginConfig,
    /// Id of the instance that registered it.
    pub plugin_id: String,
}

/// Compiled output schema of an operation.
#[derive(Debug, Clone)]
pub struct OutputRegistration {
    /// Operation name.
    pub op_name: String,
    /// Owning plugin name.
    pub plugin_name: String,
    /// Compiled schema.
    pub schema: CompiledSchema,
}

#[derive(Default)]
struct Registrations {
    ops: HashMap<String, OperationRecord>,
    windows: HashMap<String, WindowRegistration>,
    inputs: HashMap<String, InputLoaderDescriptor>,
    outputs: HashMap<String, OutputRegistration>,
    loaders: HashMap<String, InputLoader>,
    extensions: HashMap<String, BTreeSet<String>>,
}

/// Capability registrations shared by every live instance of one host.
pub struct CapabilityRegistry {
    graph: Arc<dyn WorkflowGraph>,
    windows: Arc<dyn WindowManager>,
    events: EventBus,
    opener: Weak<dyn WindowOpener>,
    state: Mutex<Registrations>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CapabilityRegistry")
            .field("ops", &state.ops.keys().collect::<Vec<_>>())
            .field("windows", &state.windows.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(
        graph: Arc<dyn WorkflowGraph>,
        windows: Arc<dyn WindowManager>,
        events: EventBus,
        opener: Weak<dyn WindowOpener>,
    ) -> Self {
        Self {
            graph,
            windows,
            events,
            opener,
            state: Mutex::new(Registrations::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registrations> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes the `declared` operation on behalf of `instance` and returns its key.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::InvalidDescriptor`] for a malformed descriptor,
    /// [`HostError::RegistrationConflict`] when another instance owns the
    /// key, and [`HostError::Graph`] when the graph rejects the node.
    pub fn register(
        &self,
        instance: &Arc<PluginInstance>,
        declared: OperationDescriptor,
    ) -> Result<String, HostError> {
        let descriptor = NormalizedDescriptor::new(declared, instance.config())?;
        let plugin_name = instance.name().to_owned();
        let key = op_key(&plugin_name, &descriptor.name);

        if let Some(existing) = self.lock().ops.get(&key) {
            if existing.plugin_id != instance.id() {
                return Err(HostError::RegistrationConflict {
                    key,
                    owner: existing.plugin_id.clone(),
                });
            }
        }

        let mut tags = vec!["op".to_owned(), "plugin".to_owned()];
        if let Some(kind) = descriptor
            .kind
            .as_deref()
            .and_then(|kind| kind.parse::<PluginKind>().ok())
            .filter(|kind| *kind != PluginKind::Collection)
        {
            tags.push(kind.workflow_tag().to_owned());
        }
        let template = NodeTemplate {
            name: descriptor.name.clone(),
            tags,
            op_key: key.clone(),
            init: descriptor.ui.clone(),
        };
        let handlers = NodeHandlers {
            execute: execute_handler(instance, descriptor.run.clone()),
            update: update_handler(instance, descriptor.update.clone()),
        };
        self.graph.add_node(template.clone(), handlers)?;
        self.clear_slots(&key);

        let inputs = descriptor
            .inputs
            .clone()
            .and_then(|schema| compile_slot(&descriptor.name, "inputs", schema, true));
        let outputs = descriptor
            .outputs
            .clone()
            .and_then(|schema| compile_slot(&descriptor.name, "outputs", schema, false));

        let input_loader = inputs.as_ref().map(|schema| {
            let loader_descriptor = InputLoaderDescriptor {
                loader_key: key.clone(),
                op_name: descriptor.name.clone(),
                plugin_name: plugin_name.clone(),
                schema: schema.clone(),
            };
            let loader = self.input_loader(instance, &descriptor.name);
            (loader_descriptor, loader)
        });
        if let Some((loader_descriptor, loader)) = &input_loader {
            self.windows
                .register_input_loader(&key, loader_descriptor, Arc::clone(loader));
        }

        {
            let mut state = self.lock();
            if let Some((loader_descriptor, loader)) = input_loader {
                state.inputs.insert(key.clone(), loader_descriptor);
                state.loaders.insert(key.clone(), loader);
            }
            if let Some(schema) = &outputs {
                state.outputs.insert(
                    key.clone(),
                    OutputRegistration {
                        op_name: descriptor.name.clone(),
                        plugin_name: plugin_name.clone(),
                        schema: schema.clone(),
                    },
                );
            }
            if descriptor.name == plugin_name {
                state.windows.insert(
                    plugin_name.clone(),
                    WindowRegistration {
                        config: instance.config().clone(),
                        plugin_id: instance.id().to_owned(),
                    },
                );
            }
            state.ops.insert(
                key.clone(),
                OperationRecord {
                    key: key.clone(),
                    plugin_id: instance.id().to_owned(),
                    plugin_name: plugin_name.clone(),
                    op_name: descriptor.name.clone(),
                    template,
                    inputs,
                    outputs,
                },
            );
        }
        instance.record_op(&descriptor.name);
        info!(target: CAPABILITY_TARGET, plugin = %plugin_name, op = %key, "operation registered");
        self.events.emit(HostEvent::OperationRegistered {
            key: key.clone(),
            plugin_id: instance.id().to_owned(),
        });
        Ok(key)
    }

    /// Drops the schema and loader entries a previous registration of `key` left behind.
    fn clear_slots(&self, key: &str) {
        let had_loader = {
            let mut state = self.lock();
            state.inputs.remove(key);
            state.outputs.remove(key);
            state.loaders.remove(key).is_some()
        };
        if had_loader {
            self.windows.unregister_input_loader(key);
        }
    }

    /// Withdraws registrations of `instance`.
    ///
    /// With no `op_name`, every operation the instance owns is withdrawn,
    /// followed by its self-named operation. Entries owned by another
    /// instance are left untouched.
    pub fn unregister(&self, instance: &PluginInstance, op_name: Option<&str>) {
        match op_name {
            Some(name) => self.unregister_op(instance, name),
            None => self.unregister_all(instance),
        }
    }

    fn unregister_all(&self, instance: &PluginInstance) {
        for op in instance.ops() {
            self.unregister_op(instance, &op);
        }
        self.unregister_op(instance, instance.name());
        let mut state = self.lock();
        for plugins in state.extensions.values_mut() {
            plugins.remove(instance.name());
        }
        state.extensions.retain(|_, plugins| !plugins.is_empty());
    }

    fn unregister_op(&self, instance: &PluginInstance, op_name: &str) {
        let key = op_key(instance.name(), op_name);
        instance.forget_op(op_name);
        let owned = {
            let mut state = self.lock();
            let is_owner = state
                .ops
                .get(&key)
                .is_some_and(|record| record.plugin_id == instance.id());
            if is_owner {
                state.ops.remove(&key);
                state.inputs.remove(&key);
                state.loaders.remove(&key);
                state.outputs.remove(&key);
                let window_owned = state
                    .windows
                    .get(instance.name())
                    .is_some_and(|window| window.plugin_id == instance.id());
                if op_name == instance.name() && window_owned {
                    state.windows.remove(instance.name());
                }
            }
            is_owner
        };
        if owned {
            self.windows.unregister_input_loader(&key);
            self.graph.remove_node(&key);
            debug!(target: CAPABILITY_TARGET, op = %key, "operation unregistered");
        }
    }

    /// Records the file extensions `instance` can open.
    pub fn register_extensions(&self, instance: &PluginInstance, extensions: &[String]) {
        let mut state = self.lock();
        for extension in extensions {
            state
                .extensions
                .entry(extension.trim_start_matches('.').to_ascii_lowercase())
                .or_default()
                .insert(instance.name().to_owned());
        }
    }

    /// Plugins registered for files with `extension`.
    #[must_use]
    pub fn plugins_for_extension(&self, extension: &str) -> Vec<String> {
        let normalized = extension.trim_start_matches('.').to_ascii_lowercase();
        self.lock()
            .extensions
            .get(&normalized)
            .map(|plugins| plugins.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registered operation under `key`.
    #[must_use]
    pub fn operation(&self, key: &str) -> Option<OperationRecord> {
        self.lock().ops.get(key).cloned()
    }

    /// Every registered operation key, sorted.
    #[must_use]
    pub fn operation_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.lock().ops.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Plugin serving `window_type`.
    #[must_use]
    pub fn window(&self, window_type: &str) -> Option<WindowRegistration> {
        self.lock().windows.get(window_type).cloned()
    }

    /// Input loader registered under `key`.
    #[must_use]
    pub fn loader(&self, key: &str) -> Option<InputLoader> {
        self.lock().loaders.get(key).cloned()
    }

    /// Input descriptor registered under `key`.
    #[must_use]
    pub fn input(&self, key: &str) -> Option<InputLoaderDescriptor> {
        self.lock().inputs.get(key).cloned()
    }

    /// Output registration under `key`.
    #[must_use]
    pub fn output(&self, key: &str) -> Option<OutputRegistration> {
        self.lock().outputs.get(key).cloned()
    }

    /// Drops every registration without notifying collaborators.
    pub fn clear(&self) {
        *self.lock() = Registrations::default();
    }

    fn input_loader(&self, instance: &Arc<PluginInstance>, op_name: &str) -> InputLoader {
        let job = LoaderJob {
            instance: Arc::downgrade(instance),
            windows: Arc::clone(&self.windows),
            opener: self.opener.clone(),
            op_name: op_name.to_owned(),
            plugin_name: instance.name().to_owned(),
        };
        Arc::new(move |target: Value| Box::pin(job.clone().load(target)))
    }
}

/// What an input loader needs once a target payload arrives.
#[derive(Clone)]
struct LoaderJob {
    instance: Weak<PluginInstance>,
    windows: Arc<dyn WindowManager>,
    opener: Weak<dyn WindowOpener>,
    op_name: String,
    plugin_name: String,
}

impl LoaderJob {
    async fn load(self, target: Value) -> Result<(), HostError> {
        let instance = self
            .instance
            .upgrade()
            .ok_or(HostError::PluginNotFound { name: self.plugin_name })?;
        let config = match instance.config().ui.as_ref().filter(|ui| is_truthy(ui)) {
            Some(ui) => self.windows.prompt_config(instance.name(), ui).await?,
            None => Value::Object(Map::new()),
        };
        let call = workflow_to_plugin(WorkflowNode {
            data: config,
            target: tag_loader_target(target, &self.op_name),
        })
        .into_value();
        let api = instance
            .api()
            .filter(|candidate| candidate.exposes(ApiMember::Run))
            .ok_or_else(|| HostError::MissingRun {
                plugin: instance.name().to_owned(),
            })?;
        let result = api
            .run(call)
            .await
            .map_err(|error| HostError::backend(instance.name(), error))?;
        let Some(node) = plugin_to_workflow(&result) else {
            return Ok(());
        };
        let opener = self.opener.upgrade().ok_or(HostError::CallerUnavailable)?;
        opener
            .open_window(Some(instance), result_window(node))
            .await
            .map(drop)
    }
}

fn compile_slot(op_name: &str, slot: &str, schema: Value, allow_array: bool) -> Option<CompiledSchema> {
    match wrap_schema(schema, allow_array).and_then(CompiledSchema::compile) {
        Ok(compiled) => Some(compiled),
        Err(error) => {
            warn!(
                target: CAPABILITY_TARGET,
                op = op_name,
                slot,
                %error,
                "error occured when parsing the schema"
            );
            None
        }
    }
}

/// Stamps loader provenance onto a target payload.
fn tag_loader_target(mut target: Value, op_name: &str) -> Value {
    if let Value::Object(map) = &mut target {
        map.entry("_transfer").or_insert(Value::Bool(false));
        let previous = map.get("_op").cloned().unwrap_or(Value::Null);
        map.insert("_source_op".into(), previous);
        map.insert("_op".into(), Value::String(op_name.to_owned()));
        if !map.get("_workflow_id").is_some_and(is_truthy) {
            let id = format!("data_loader_{}{}", durable_key(op_name.trim()), rand_id());
            map.insert("_workflow_id".into(), Value::String(id));
        }
    }
    target
}

fn result_window(node: WorkflowNode) -> WindowConfig {
    let text = |key: &str| {
        node.target
            .get(key)
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_owned)
    };
    WindowConfig {
        name: text("name").unwrap_or_else(|| "result".to_owned()),
        window_type: text("type").unwrap_or_else(|| GENERIC_WINDOW_TYPE.to_owned()),
        config: if is_truthy(&node.data) {
            node.data.clone()
        } else {
            Value::Object(Map::new())
        },
        data: if is_truthy(&node.target) {
            node.target.clone()
        } else {
            Value::Object(Map::new())
        },
        ..WindowConfig::default()
    }
}

/// Target of a node handler: the owning instance and an optional named function.
#[derive(Clone)]
struct HandlerJob {
    instance: Weak<PluginInstance>,
    function: Option<String>,
    plugin_name: String,
}

impl HandlerJob {
    fn new(instance: &Arc<PluginInstance>, function: Option<String>) -> Self {
        Self {
            instance: Arc::downgrade(instance),
            function,
            plugin_name: instance.name().to_owned(),
        }
    }

    async fn execute(self, node: WorkflowNode) -> Result<Option<WorkflowNode>, HostError> {
        let instance = self
            .instance
            .upgrade()
            .ok_or(HostError::PluginNotFound { name: self.plugin_name })?;
        let Some(api) = instance.api() else {
            instance.push_log("WARNING: no run function defined.");
            return Ok(None);
        };
        let call = workflow_to_plugin(node).into_value();
        let outcome = match self.function.as_deref() {
            Some(function) => api.call(function, vec![call]).await,
            None if api.exposes(ApiMember::Run) => api.run(call).await,
            None => {
                instance.push_log("WARNING: no run function defined.");
                return Ok(None);
            }
        };
        match outcome {
            Ok(result) => Ok(plugin_to_workflow(&result)),
            Err(error) => {
                instance.sandbox().error(instance.name(), error.message());
                Err(HostError::backend(instance.name(), error))
            }
        }
    }

    async fn update(self, node: WorkflowNode) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        let Some(api) = instance.api() else {
            return;
        };
        let call = workflow_to_plugin(node).into_value();
        let outcome = match self.function.as_deref() {
            Some(function) => api.call(function, vec![call]).await,
            None => api.update(call).await,
        };
        if let Err(error) = outcome {
            warn!(
                target: CAPABILITY_TARGET,
                plugin = %instance.name(),
                %error,
                "update handler failed"
            );
            instance.sandbox().error(instance.name(), error.message());
        }
    }
}

fn execute_handler(instance: &Arc<PluginInstance>, function: Option<String>) -> NodeHandler {
    let job = HandlerJob::new(instance, function);
    Arc::new(move |node: WorkflowNode| Box::pin(job.clone().execute(node)))
}

fn update_handler(instance: &Arc<PluginInstance>, function: Option<String>) -> Option<UpdateHandler> {
    let exposes_update = instance
        .api()
        .is_some_and(|api| api.exposes(ApiMember::Update));
    if function.is_none() && !exposes_update {
        return None;
    }
    let job = HandlerJob::new(instance, function);
    let debouncer = Debouncer::new(UPDATE_DEBOUNCE);
    Some(Arc::new(move |node: WorkflowNode| {
        debouncer.schedule(job.clone().update(node));
    }))
}
