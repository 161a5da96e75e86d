//! Domain errors raised by the plugin host.
//!
//! Every failure is a plain descriptive value. [`HostError::user_message`]
//! produces the short text shown through the message channel, while the
//! `Display` form carries full detail for the developer log.

use thiserror::Error;

use crate::backend::BackendError;
use crate::engine::EngineError;
use crate::fetch::FetchError;
use crate::parser::ParseError;
use crate::store::StoreError;
use crate::window::WindowError;
use crate::workflow::GraphError;

/// Errors arising from host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// A plugin reference could not be mapped to a source location.
    #[error("{message}")]
    Resolution {
        /// Reference supplied by the caller.
        reference: String,
        /// Human-readable description of the failure.
        message: String,
    },

    /// A manifest or plugin source could not be downloaded.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The plugin source could not be parsed or failed validation.
    #[error("Failed to parse the plugin file, error: {0}")]
    Parse(#[from] ParseError),

    /// The plugin name contains a path separator.
    #[error("Plugin name should not contain '/': {name}")]
    InvalidName {
        /// Offending plugin name.
        name: String,
    },

    /// No execution backend exists for the declared plugin type.
    #[error("Unsupported plugin type: {kind}")]
    UnsupportedType {
        /// Declared `type` field.
        kind: String,
    },

    /// A dependency failed to install or load.
    #[error("Failed to install dependencies for {plugin}: {source}")]
    Dependency {
        /// Plugin whose dependency chain failed.
        plugin: String,
        /// Error raised while processing the dependency.
        #[source]
        source: Box<HostError>,
    },

    /// A dependency chain refers back to a plugin already being resolved.
    #[error("dependency cycle detected: {}", chain.join(" -> "))]
    DependencyCycle {
        /// Names in resolution order, ending with the repeated name.
        chain: Vec<String>,
    },

    /// The sandbox backend failed to instantiate, connect or respond.
    #[error("<{plugin}>: {source}")]
    Backend {
        /// Plugin being driven when the backend failed.
        plugin: String,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// The connected backend does not expose `setup()`.
    #[error("No \"setup()\" function is defined in plugin \"{plugin}\".")]
    MissingSetup {
        /// Plugin name.
        plugin: String,
    },

    /// A runnable window plugin does not expose `run()`.
    #[error(
        "You must define a `run` function for {plugin} or set its `runnable` field to false."
    )]
    MissingRun {
        /// Plugin name.
        plugin: String,
    },

    /// The instance was unloaded before it finished loading.
    #[error("plugin '{plugin}' was unloaded before it finished loading")]
    Superseded {
        /// Plugin name.
        plugin: String,
    },

    /// Persistent storage failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// An operation key is owned by a different live instance.
    #[error("operation '{key}' is already registered by instance '{owner}'")]
    RegistrationConflict {
        /// Operation key that collided.
        key: String,
        /// Instance id owning the existing registration.
        owner: String,
    },

    /// A capability descriptor is malformed.
    #[error("invalid registration for '{name}': {message}")]
    InvalidDescriptor {
        /// Descriptor name.
        name: String,
        /// Description of the problem.
        message: String,
    },

    /// No live instance exists under the requested name.
    #[error("plugin with type {name} not found.")]
    PluginNotFound {
        /// Requested plugin name.
        name: String,
    },

    /// The target instance does not expose the requested function.
    #[error("function \"{function}\" of {plugin} is not available.")]
    FunctionUnavailable {
        /// Target plugin name.
        plugin: String,
        /// Requested function.
        function: String,
    },

    /// No plugin serves the requested window type.
    #[error("no plugin registered for window type: {window_type}")]
    WindowTypeNotRegistered {
        /// Requested window type.
        window_type: String,
    },

    /// A window type is served by a plugin that is not a window kind.
    #[error("Window plugin must be with type \"window\": {window_type}")]
    NotAWindowPlugin {
        /// Requested window type.
        window_type: String,
    },

    /// The window collaborator failed.
    #[error(transparent)]
    Window(#[from] WindowError),

    /// The workflow graph rejected a node.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// An engine file operation failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A plugin tried to write a field defined in its config block.
    #[error("'{field}' is a readonly field defined in <config> block, please avoid using it")]
    ReadonlyConfigField {
        /// Field name without the leading underscore.
        field: String,
    },

    /// A repository operation was rejected.
    #[error("{message}")]
    Repository {
        /// Human-readable description of the failure.
        message: String,
    },

    /// A required collaborator was not supplied to the host builder.
    #[error("plugin host is missing its {collaborator} collaborator")]
    MissingCollaborator {
        /// Builder method that was not called.
        collaborator: &'static str,
    },

    /// No workspace store is open.
    #[error("no workspace has been loaded")]
    NoWorkspace,

    /// A host API call referenced an instance that no longer exists.
    #[error("source plugin is not available.")]
    CallerUnavailable,
}

impl HostError {
    /// Builds a `Resolution` error.
    pub(crate) fn resolution(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Builds a `Repository` error.
    pub(crate) fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            message: message.into(),
        }
    }

    /// Wraps a backend failure for the named plugin.
    pub(crate) fn backend(plugin: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            plugin: plugin.into(),
            source,
        }
    }

    /// Wraps a dependency failure raised while processing `plugin`.
    pub(crate) fn dependency(plugin: impl Into<String>, source: Self) -> Self {
        Self::Dependency {
            plugin: plugin.into(),
            source: Box::new(source),
        }
    }

    /// Returns the innermost error of a dependency chain.
    ///
    /// Non-dependency errors return themselves.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        let mut current = self;
        while let Self::Dependency { source, .. } = current {
            current = source;
        }
        current
    }

    /// Short text suitable for the user-facing message channel.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Fetch(_) => {
                "Failed to download, if you download from github, please use the url to the raw file"
                    .to_owned()
            }
            Self::Engine(EngineError::Disconnected) => {
                "Please connect to the Plugin Engine.".to_owned()
            }
            Self::Storage(_) => "Failed to access the plugin database.".to_owned(),
            other => other.to_string(),
        }
    }

    /// Returns `true` when the error reports a superseded load.
    #[must_use]
    pub const fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }
}
