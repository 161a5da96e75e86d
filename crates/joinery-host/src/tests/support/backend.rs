//! Scripted sandbox backend.
//!
//! Each plugin name can be given a [`Script`] describing how its sandbox
//! connects and which API members it exposes. Sandboxes connect at once by
//! default; a held connection leaves the [`ConnectionNotifier`] with the
//! test so it can interleave unloads with the pending load.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::api::HostApi;
use crate::backend::{
    ApiMember, BackendError, BackendFactory, ConnectionNotifier, ConnectionSignal, InstanceSpec,
    Instantiation, PluginApi, SandboxBackend, connection_channel,
};
use crate::window::WindowCallbacks;

/// How a scripted sandbox reports its connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectMode {
    /// Connects immediately.
    #[default]
    Immediate,
    /// Fails immediately with the given reason.
    Fail(String),
    /// Waits until the test releases the notifier.
    Held,
}

/// Behaviour of every sandbox started for one plugin name.
#[derive(Debug, Clone)]
pub struct Script {
    pub connect: ConnectMode,
    pub members: HashSet<ApiMember>,
    pub functions: HashSet<String>,
    pub run_result: Option<Value>,
    pub setup_error: Option<String>,
    pub run_error: Option<String>,
    pub refuse_instantiation: bool,
    /// When set, `setup` waits for a notification before returning.
    pub setup_gate: Option<Arc<Notify>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            connect: ConnectMode::Immediate,
            members: [ApiMember::Setup, ApiMember::Run].into_iter().collect(),
            functions: HashSet::new(),
            run_result: None,
            setup_error: None,
            run_error: None,
            refuse_instantiation: false,
            setup_gate: None,
        }
    }
}

impl Script {
    pub fn with_members(members: &[ApiMember]) -> Self {
        Self {
            members: members.iter().copied().collect(),
            ..Self::default()
        }
    }
}

/// A recorded `instantiate` call.
#[derive(Clone)]
pub struct Started {
    pub name: String,
    pub id: String,
    pub preview: bool,
    pub workspace: String,
    pub tag: Option<String>,
    pub engine_url: Option<String>,
    pub window: Option<Arc<dyn WindowCallbacks>>,
    pub api: HostApi,
    pub sandbox: Arc<ScriptedSandbox>,
}

#[derive(Default)]
struct FactoryState {
    scripts: HashMap<String, Script>,
    started: Vec<Started>,
    held: HashMap<String, ConnectionNotifier>,
}

/// Backend factory driven by per-plugin scripts.
#[derive(Default)]
pub struct ScriptedFactory {
    state: Mutex<FactoryState>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the script for `name`.
    pub fn script(&self, name: &str, script: Script) {
        self.lock().scripts.insert(name.to_owned(), script);
    }

    /// Every sandbox started so far.
    pub fn started(&self) -> Vec<Started> {
        self.lock().started.clone()
    }

    /// Sandboxes started for `name`.
    pub fn started_for(&self, name: &str) -> Vec<Started> {
        self.started()
            .into_iter()
            .filter(|started| started.name == name)
            .collect()
    }

    /// Host API handed to the latest sandbox of `name`.
    pub fn api_for(&self, name: &str) -> Option<HostApi> {
        self.started_for(name).pop().map(|started| started.api)
    }

    /// Releases a held connection of `name` as connected.
    pub fn connect(&self, name: &str) -> bool {
        let notifier = self.lock().held.remove(name);
        notifier.map(ConnectionNotifier::connected).is_some()
    }

    /// Returns `true` while a connection of `name` is held.
    pub fn is_held(&self, name: &str) -> bool {
        self.lock().held.contains_key(name)
    }
}

impl BackendFactory for ScriptedFactory {
    fn instantiate(&self, spec: InstanceSpec) -> Result<Instantiation, BackendError> {
        let mut state = self.lock();
        let script = state
            .scripts
            .get(&spec.config.name)
            .cloned()
            .unwrap_or_default();
        if script.refuse_instantiation {
            return Err(BackendError::new("sandbox refused to start"));
        }
        let sandbox = Arc::new(ScriptedSandbox::new(&script));
        let (notifier, signal) = connection_channel();
        let ready: ConnectionSignal = match &script.connect {
            ConnectMode::Immediate => {
                notifier.connected();
                signal
            }
            ConnectMode::Fail(reason) => {
                notifier.failed(BackendError::new(reason.clone()));
                signal
            }
            ConnectMode::Held => {
                state.held.insert(spec.config.name.clone(), notifier);
                signal
            }
        };
        state.started.push(Started {
            name: spec.config.name.clone(),
            id: spec.config.id.clone(),
            preview: spec.preview,
            workspace: spec.context.workspace.clone(),
            tag: spec.context.tag.clone(),
            engine_url: spec.context.engine_url.clone(),
            window: spec.window.clone(),
            api: spec.api,
            sandbox: Arc::clone(&sandbox),
        });
        Ok(Instantiation {
            sandbox: sandbox as Arc<dyn SandboxBackend>,
            ready,
        })
    }
}

/// Sandbox whose API follows a [`Script`].
pub struct ScriptedSandbox {
    api: Arc<ScriptedApi>,
    terminations: AtomicUsize,
    disconnected: AtomicBool,
    errors: Mutex<Vec<String>>,
}

impl ScriptedSandbox {
    fn new(script: &Script) -> Self {
        Self {
            api: Arc::new(ScriptedApi::new(script.clone())),
            terminations: AtomicUsize::new(0),
            disconnected: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Simulates losing the execution engine.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// The scripted API.
    pub fn scripted_api(&self) -> Arc<ScriptedApi> {
        Arc::clone(&self.api)
    }

    /// Number of `terminate` calls received.
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    /// Errors reported on behalf of the plugin.
    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SandboxBackend for ScriptedSandbox {
    fn api(&self) -> Option<Arc<dyn PluginApi>> {
        Some(Arc::clone(&self.api) as Arc<dyn PluginApi>)
    }

    async fn terminate(&self) -> Result<(), BackendError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn error(&self, _plugin: &str, message: &str) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_owned());
    }
}

/// API surface recording every call it receives.
pub struct ScriptedApi {
    script: Script,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedApi {
    fn new(script: Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, member: &str, payload: Value) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((member.to_owned(), payload));
    }

    /// Calls received so far as `(member, payload)`.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of the members called so far.
    pub fn called(&self) -> Vec<String> {
        self.calls().into_iter().map(|(member, _)| member).collect()
    }
}

#[async_trait]
impl PluginApi for ScriptedApi {
    fn exposes(&self, member: ApiMember) -> bool {
        self.script.members.contains(&member)
    }

    fn has_function(&self, function: &str) -> bool {
        self.script.functions.contains(function)
            || function
                .parse::<ApiMember>()
                .is_ok_and(|member| self.exposes(member))
    }

    async fn setup(&self) -> Result<(), BackendError> {
        self.record("setup", Value::Null);
        if let Some(gate) = &self.script.setup_gate {
            gate.notified().await;
        }
        match &self.script.setup_error {
            Some(reason) => Err(BackendError::new(reason.clone())),
            None => Ok(()),
        }
    }

    async fn resume(&self) -> Result<(), BackendError> {
        self.record("resume", Value::Null);
        Ok(())
    }

    async fn run(&self, payload: Value) -> Result<Value, BackendError> {
        self.record("run", payload.clone());
        if let Some(reason) = &self.script.run_error {
            return Err(BackendError::new(reason.clone()));
        }
        Ok(self.script.run_result.clone().unwrap_or(payload))
    }

    async fn update(&self, payload: Value) -> Result<Value, BackendError> {
        self.record("update", payload);
        Ok(Value::Null)
    }

    async fn call(&self, function: &str, mut args: Vec<Value>) -> Result<Value, BackendError> {
        let payload = if args.is_empty() {
            Value::Null
        } else {
            args.swap_remove(0)
        };
        if self.script.functions.contains(function) {
            self.record(function, payload.clone());
            return Ok(json!({"function": function, "payload": payload}));
        }
        match function.parse::<ApiMember>() {
            Ok(ApiMember::Run) => self.run(payload).await,
            Ok(ApiMember::Update) => self.update(payload).await,
            Ok(ApiMember::Setup) => self.setup().await.map(|()| Value::Null),
            _ => Err(BackendError::new(format!("no function named {function}"))),
        }
    }
}
