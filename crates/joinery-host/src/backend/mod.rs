//! Sandbox backend contract.
//!
//! The host never runs plugin code itself. A [`BackendFactory`] per
//! [`PluginKind`] instantiates a [`SandboxBackend`] from an
//! [`InstanceSpec`] and hands back a [`ConnectionSignal`] that resolves
//! once the sandbox is connected or has failed. The connected sandbox
//! exposes its entry points through [`PluginApi`].

mod connection;

use std::any::Any;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{error, info};

use crate::api::HostApi;
use crate::parser::PluginConfig;
use crate::window::WindowCallbacks;

pub use self::connection::{ConnectionNotifier, ConnectionSignal, connection_channel};

const BACKEND_TARGET: &str = "joinery_host::backend";

/// Execution kind of a plugin, selected by its `type` field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PluginKind {
    /// Renders into a host window.
    Window,
    /// Runs in a dedicated worker.
    WebWorker,
    /// Runs in an isolated frame.
    Iframe,
    /// Runs Python in the page.
    WebPython,
    /// In-page Python with a window.
    WebPythonWindow,
    /// Runs Python on a remote engine.
    NativePython,
    /// A container of other plugins; never instantiated.
    Collection,
}

impl PluginKind {
    /// Returns `true` for kinds that render into a window.
    #[must_use]
    pub const fn is_window(self) -> bool {
        matches!(self, Self::Window | Self::WebPythonWindow)
    }

    /// Returns `true` for kinds executed by a remote engine.
    #[must_use]
    pub const fn is_native(self) -> bool {
        matches!(self, Self::NativePython)
    }

    /// Tag attached to workflow nodes produced by plugins of this kind.
    #[must_use]
    pub const fn workflow_tag(self) -> &'static str {
        match self {
            Self::NativePython => "python",
            Self::WebPython | Self::WebPythonWindow => "web-python",
            Self::WebWorker => "web-worker",
            Self::Iframe => "iframe",
            Self::Window => "window",
            Self::Collection => "collection",
        }
    }
}

/// Failure reported by a sandbox backend.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl BackendError {
    /// Creates an error with a message and no underlying cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error wrapping an underlying cause.
    #[must_use]
    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Human-readable description.
    #[must_use]
    pub const fn message(&self) -> &str {
        self.message.as_str()
    }
}

/// Lifecycle entry points a connected sandbox may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ApiMember {
    /// One-time initialisation after connecting.
    Setup,
    /// Re-attachment to a previously suspended instance.
    Resume,
    /// Main entry point.
    Run,
    /// Incremental update entry point.
    Update,
}

/// API surface of a connected sandbox.
#[async_trait]
pub trait PluginApi: Send + Sync {
    /// Returns `true` when the sandbox implements `member`.
    fn exposes(&self, member: ApiMember) -> bool;

    /// Returns `true` when `function` can be invoked through [`Self::call`].
    fn has_function(&self, function: &str) -> bool {
        function
            .parse::<ApiMember>()
            .is_ok_and(|member| self.exposes(member))
    }

    /// Calls `setup()`.
    async fn setup(&self) -> Result<(), BackendError>;

    /// Calls `resume()`.
    async fn resume(&self) -> Result<(), BackendError>;

    /// Calls `run(payload)`; `Value::Null` means no result.
    async fn run(&self, payload: Value) -> Result<Value, BackendError>;

    /// Calls `update(payload)`.
    async fn update(&self, payload: Value) -> Result<Value, BackendError>;

    /// Calls an arbitrary exported function.
    async fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, BackendError>;
}

/// A live sandbox hosting one plugin instance.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// API of the connected sandbox; `None` before connecting.
    fn api(&self) -> Option<Arc<dyn PluginApi>>;

    /// Stops the sandbox. Calling it more than once must be harmless.
    async fn terminate(&self) -> Result<(), BackendError>;

    /// Returns `true` when the sandbox lost its execution engine.
    fn is_disconnected(&self) -> bool {
        false
    }

    /// Records a log line emitted on behalf of the plugin.
    fn log(&self, plugin: &str, message: &str) {
        info!(target: BACKEND_TARGET, plugin, "{message}");
    }

    /// Records an error emitted on behalf of the plugin.
    fn error(&self, plugin: &str, message: &str) {
        error!(target: BACKEND_TARGET, plugin, "{message}");
    }

    /// Reports progress in the range `0.0..=100.0`.
    fn progress(&self, plugin: &str, value: f64) {
        info!(target: BACKEND_TARGET, plugin, progress = value, "progress");
    }
}

/// Opaque handle onto the embedder's file-system collaborator.
pub type FileSystemHandle = Arc<dyn Any + Send + Sync>;

/// Variables exposed to the plugin alongside its API surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceContext {
    /// Selected variant tag.
    pub tag: Option<String>,
    /// Name of the open workspace.
    pub workspace: String,
    /// URL of the bound engine, for native kinds.
    pub engine_url: Option<String>,
}

/// Everything a backend needs to start a sandbox.
pub struct InstanceSpec {
    /// Normalised plugin config, including the runtime id.
    pub config: PluginConfig,
    /// Host API surface bound to the new instance.
    pub api: HostApi,
    /// Interface variables.
    pub context: InstanceContext,
    /// File-system collaborator, if configured.
    pub fs: Option<FileSystemHandle>,
    /// Whether only a preview proxy is requested.
    pub preview: bool,
    /// Window adapter for window kinds.
    pub window: Option<Arc<dyn WindowCallbacks>>,
}

impl fmt::Debug for InstanceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceSpec")
            .field("plugin", &self.config.name)
            .field("id", &self.config.id)
            .field("context", &self.context)
            .field("preview", &self.preview)
            .finish_non_exhaustive()
    }
}

/// A freshly created sandbox and its pending connection outcome.
pub struct Instantiation {
    /// The sandbox handle.
    pub sandbox: Arc<dyn SandboxBackend>,
    /// Resolves once the sandbox is connected or has failed.
    pub ready: ConnectionSignal,
}

/// Creates sandboxes for one execution kind.
pub trait BackendFactory: Send + Sync {
    /// Starts a sandbox for `spec`.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when the sandbox cannot be created.
    fn instantiate(&self, spec: InstanceSpec) -> Result<Instantiation, BackendError>;
}

/// Backend factories keyed by execution kind.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<PluginKind, Arc<dyn BackendFactory>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: PluginKind, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(kind, factory);
    }

    /// Builder-style variant of [`Self::register`].
    #[must_use]
    pub fn with(mut self, kind: PluginKind, factory: Arc<dyn BackendFactory>) -> Self {
        self.register(kind, factory);
        self
    }

    /// Returns `true` when the declared `type` can be handled.
    ///
    /// Collections are always supported because they are never instantiated.
    #[must_use]
    pub fn supports(&self, kind: &str) -> bool {
        match kind.parse::<PluginKind>() {
            Ok(PluginKind::Collection) => true,
            Ok(parsed) => self.factories.contains_key(&parsed),
            Err(_) => false,
        }
    }

    /// Factory for `kind`.
    #[must_use]
    pub fn factory(&self, kind: PluginKind) -> Option<Arc<dyn BackendFactory>> {
        self.factories.get(&kind).cloned()
    }
}

#[cfg(test)]
mod tests;
