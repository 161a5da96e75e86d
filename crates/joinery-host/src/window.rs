//! Window manager contract.
//!
//! Rendering is owned by the embedder. The host asks the [`WindowManager`]
//! to add windows, to provide the callbacks a window plugin uses to drive
//! its own window, and to publish input loaders for registered operations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::BoxFuture;
use crate::error::HostError;
use crate::lifecycle::PluginInstance;
use crate::schema::CompiledSchema;

/// Prefix of window types rendered by the window manager itself.
pub const BUILTIN_WINDOW_PREFIX: &str = "imjoy/";

/// Window type used when a result names none.
pub const GENERIC_WINDOW_TYPE: &str = "imjoy/generic";

/// Failure reported by the window manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("window error: {message}")]
pub struct WindowError {
    message: String,
}

impl WindowError {
    /// Creates an error with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Request to open a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window title.
    #[serde(default)]
    pub name: String,
    /// Window type: a built-in `imjoy/*` type or a registered window name.
    #[serde(rename = "type", default)]
    pub window_type: String,
    /// Window id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Variant tag of the serving plugin.
    #[serde(default)]
    pub tag: Option<String>,
    /// Payload displayed by the window.
    #[serde(default)]
    pub data: Value,
    /// Window configuration.
    #[serde(default)]
    pub config: Value,
    /// Panel description.
    #[serde(default)]
    pub panel: Option<Value>,
    /// Container to render into instead of a new window.
    #[serde(default)]
    pub window_container: Option<String>,
    /// Whether the window lives outside the workspace layout.
    #[serde(default)]
    pub standalone: bool,
    /// Further fields passed through to the window manager.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WindowConfig {
    /// Returns `true` for types rendered by the window manager itself.
    #[must_use]
    pub fn is_builtin(&self) -> bool {
        self.window_type.starts_with(BUILTIN_WINDOW_PREFIX)
    }
}

/// Deferred action run when a window closes.
pub type CloseHandler = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Callbacks a window plugin uses to drive the window that hosts it.
pub trait WindowCallbacks: Send + Sync {
    /// Brings the window to the front.
    fn focus(&self);
    /// Closes the window.
    fn close(&self);
    /// Re-renders the window.
    fn refresh(&self);
    /// Recomputes the window size.
    fn resize(&self);
    /// Registers `handler` to run once the window closes.
    fn on_close(&self, handler: CloseHandler);
}

/// Describes the input an operation's loader accepts.
#[derive(Debug, Clone)]
pub struct InputLoaderDescriptor {
    /// Operation key the loader belongs to.
    pub loader_key: String,
    /// Operation name.
    pub op_name: String,
    /// Owning plugin name.
    pub plugin_name: String,
    /// Compiled input schema.
    pub schema: CompiledSchema,
}

/// Loads a target payload into an operation and displays the result.
pub type InputLoader = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), HostError>> + Send + Sync>;

/// Window rendering collaborator.
#[async_trait]
pub trait WindowManager: Send + Sync {
    /// Adds a window and returns its id.
    async fn add_window(&self, config: &WindowConfig) -> Result<String, WindowError>;

    /// Creates the callbacks bound to the window described by `config`.
    fn setup_callbacks(&self, config: &WindowConfig) -> Arc<dyn WindowCallbacks>;

    /// Publishes an input loader under `key`.
    fn register_input_loader(&self, key: &str, descriptor: &InputLoaderDescriptor, loader: InputLoader);

    /// Withdraws the input loader under `key`, if any.
    fn unregister_input_loader(&self, key: &str);

    /// Asks the user to fill in `ui` for `plugin` and returns the answers.
    async fn prompt_config(&self, plugin: &str, ui: &Value) -> Result<Value, WindowError>;
}

/// An opened window.
#[derive(Clone)]
pub struct WindowHandle {
    /// Window id.
    pub id: String,
    /// Callbacks bound to the window.
    pub callbacks: Arc<dyn WindowCallbacks>,
    /// Instance rendering the window, for plugin-served types.
    pub plugin: Option<Arc<PluginInstance>>,
}

impl fmt::Debug for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowHandle")
            .field("id", &self.id)
            .field("plugin", &self.plugin.as_ref().map(|plugin| plugin.id()))
            .finish_non_exhaustive()
    }
}
