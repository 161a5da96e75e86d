//! Live plugin instances.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use strum::{AsRefStr, Display};
use tracing::{debug, warn};

use crate::backend::{PluginApi, PluginKind, SandboxBackend};
use crate::engine::{EngineBinding, RunningStatus};
use crate::parser::PluginConfig;

const INSTANCE_TARGET: &str = "joinery_host::lifecycle";

/// Position of an instance in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum InstanceState {
    /// Sandbox created, not yet connected.
    Instantiated,
    /// Backend signalled readiness.
    Connected,
    /// Capabilities published.
    Registered,
    /// `setup()` or `resume()` completed.
    Running,
    /// The backend reported a failure.
    Failed,
    /// The sandbox was stopped.
    Terminated,
}

/// One live copy of a plugin.
pub struct PluginInstance {
    id: String,
    name: String,
    config: PluginConfig,
    kind: Option<PluginKind>,
    sandbox: Arc<dyn SandboxBackend>,
    proxy: Option<Arc<dyn PluginApi>>,
    binding: EngineBinding,
    state: Mutex<InstanceState>,
    unloaded: AtomicBool,
    terminated: AtomicBool,
    update_available: AtomicBool,
    log_history: Mutex<Vec<String>>,
    ops: Mutex<BTreeSet<String>>,
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl PluginInstance {
    /// Wraps a freshly instantiated sandbox.
    pub(crate) fn new(config: PluginConfig, sandbox: Arc<dyn SandboxBackend>, binding: EngineBinding) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            kind: config.plugin_kind(),
            config,
            sandbox,
            proxy: None,
            binding,
            state: Mutex::new(InstanceState::Instantiated),
            unloaded: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            update_available: AtomicBool::new(false),
            log_history: Mutex::new(Vec::new()),
            ops: Mutex::new(BTreeSet::new()),
        }
    }

    /// Serves the API through `proxy` instead of the sandbox's own surface.
    #[must_use]
    pub(crate) fn with_proxy(mut self, proxy: Arc<dyn PluginApi>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Runtime id.
    #[must_use]
    pub const fn id(&self) -> &str {
        self.id.as_str()
    }

    /// Plugin name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Normalised config the instance was created from.
    #[must_use]
    pub const fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Execution kind, when the declared type is known.
    #[must_use]
    pub const fn kind(&self) -> Option<PluginKind> {
        self.kind
    }

    /// Selected variant tag.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.config.tag.as_deref()
    }

    /// Sandbox hosting the instance.
    #[must_use]
    pub const fn sandbox(&self) -> &Arc<dyn SandboxBackend> {
        &self.sandbox
    }

    /// Engine bound at load time.
    #[must_use]
    pub const fn binding(&self) -> &EngineBinding {
        &self.binding
    }

    /// API surface; `None` until the sandbox connects.
    #[must_use]
    pub fn api(&self) -> Option<Arc<dyn PluginApi>> {
        self.proxy.clone().or_else(|| self.sandbox.api())
    }

    /// Returns `true` for preview instances served through a proxy.
    #[must_use]
    pub const fn is_preview(&self) -> bool {
        self.proxy.is_some()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> InstanceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, next: InstanceState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == InstanceState::Terminated {
            return;
        }
        debug!(target: INSTANCE_TARGET, plugin = %self.name, from = %*state, to = %next, "state change");
        *state = next;
    }

    /// Marks the instance as unloaded; an in-flight load then self-terminates.
    pub fn mark_unloaded(&self) {
        self.unloaded.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once the instance was unloaded.
    #[must_use]
    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::SeqCst)
    }

    /// Returns `true` once [`Self::terminate`] ran.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Returns `true` when the sandbox lost its engine.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.sandbox.is_disconnected()
    }

    /// Returns `true` while the sandbox has not connected.
    #[must_use]
    pub fn is_initializing(&self) -> bool {
        self.state() == InstanceState::Instantiated
    }

    /// Snapshot used by engine resynchronisation.
    #[must_use]
    pub fn running_status(&self) -> RunningStatus {
        RunningStatus {
            has_engine: self.binding.engine().is_some(),
            disconnected: self.is_disconnected(),
            initializing: self.is_initializing(),
        }
    }

    /// Stops the sandbox. Only the first call reaches the backend.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(InstanceState::Terminated);
        if let Err(error) = self.sandbox.terminate().await {
            warn!(target: INSTANCE_TARGET, plugin = %self.name, %error, "failed to terminate sandbox");
        }
    }

    /// Appends a line to the instance log.
    pub fn push_log(&self, line: impl Into<String>) {
        let entry = line.into();
        self.sandbox.log(&self.name, &entry);
        self.log_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Lines logged on behalf of the instance.
    #[must_use]
    pub fn log_history(&self) -> Vec<String> {
        self.log_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record_op(&self, op_name: &str) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op_name.to_owned());
    }

    pub(crate) fn forget_op(&self, op_name: &str) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(op_name);
    }

    /// Names of the operations the instance currently owns.
    #[must_use]
    pub fn ops(&self) -> Vec<String> {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Flags a newer source in the plugin's origin.
    pub fn set_update_available(&self, available: bool) {
        self.update_available.store(available, Ordering::SeqCst);
    }

    /// Returns `true` when a newer source was found.
    #[must_use]
    pub fn update_available(&self) -> bool {
        self.update_available.load(Ordering::SeqCst)
    }
}
