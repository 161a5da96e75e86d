//! Remote execution engines and engine affinity.
//!
//! Plugins of the native kind execute on an external engine. The
//! [`EngineRegistry`] collaborator tracks connected engines; this module
//! decides which engine an instance binds to and which installed plugins
//! must be reloaded or unloaded when an engine connects or disconnects.

mod affinity;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use self::affinity::{
    BindingMode, DisconnectAction, EngineBinding, EngineMode, ReloadGuard, ReloadGuards,
    RunningStatus, disconnect_action, should_reload,
};

/// Errors raised by engine lookups and remote file operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// No engine was given or found.
    #[error("Please specify an engine")]
    NoEngine,

    /// The engine exists but is not connected.
    #[error("Please connect to the Plugin Engine.")]
    Disconnected,

    /// The request was malformed.
    #[error("{message}")]
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },

    /// The engine reported a failed file operation.
    #[error("{message}")]
    FileOperation {
        /// Message including the engine's error text.
        message: String,
    },

    /// The request could not reach the engine.
    #[error("engine request failed: {message}")]
    Transport {
        /// Transport failure description.
        message: String,
    },
}

/// Outcome of a remote file operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOpResponse {
    /// Whether the operation succeeded.
    #[serde(default)]
    pub success: bool,
    /// Resulting URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Resulting path.
    #[serde(default)]
    pub path: Option<String>,
    /// Engine-provided error text.
    #[serde(default)]
    pub error: Option<String>,
}

/// An independently connected execution provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine identifier.
    fn id(&self) -> String;

    /// Engine URL.
    fn url(&self) -> String;

    /// Whether the engine is currently connected.
    fn is_connected(&self) -> bool;

    /// Requests a URL serving the file described by `request`.
    async fn get_file_url(&self, request: Value) -> Result<FileOpResponse, EngineError>;

    /// Requests the local path of the URL described by `request`.
    async fn get_file_path(&self, request: Value) -> Result<FileOpResponse, EngineError>;

    /// Requests an upload URL.
    async fn request_upload_url(&self, request: Value) -> Result<FileOpResponse, EngineError>;
}

/// Engine lookup collaborator.
pub trait EngineRegistry: Send + Sync {
    /// Engine selected by `mode` (`auto` or an engine id).
    fn get_engine(&self, mode: &str) -> Option<Arc<dyn Engine>>;

    /// Engine served from `url`.
    fn get_engine_by_url(&self, url: &str) -> Option<Arc<dyn Engine>>;
}

/// A fixed, ordered set of engines.
///
/// `auto` selects the first connected engine.
#[derive(Clone, Default)]
pub struct EngineList {
    engines: Vec<Arc<dyn Engine>>,
}

impl EngineList {
    /// Creates a list over `engines`.
    #[must_use]
    pub fn new(engines: Vec<Arc<dyn Engine>>) -> Self {
        Self { engines }
    }
}

impl EngineRegistry for EngineList {
    fn get_engine(&self, mode: &str) -> Option<Arc<dyn Engine>> {
        if mode == affinity::AUTO_MODE {
            return self.engines.iter().find(|engine| engine.is_connected()).cloned();
        }
        self.engines.iter().find(|engine| engine.id() == mode).cloned()
    }

    fn get_engine_by_url(&self, url: &str) -> Option<Arc<dyn Engine>> {
        self.engines.iter().find(|engine| engine.url() == url).cloned()
    }
}

/// Remote file operations offered to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    /// Serve a file path as a URL.
    FileUrl,
    /// Map a URL back to a file path.
    FilePath,
    /// Obtain an upload URL.
    UploadUrl,
}

impl FileOperation {
    const fn required_key(self) -> Option<&'static str> {
        match self {
            Self::FileUrl => Some("path"),
            Self::FilePath => Some("url"),
            Self::UploadUrl => None,
        }
    }

    fn failure(self, request: &Value, error: &str) -> String {
        let field = |key: &str| {
            request
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        match self {
            Self::FileUrl => format!("Failed to get file url for {} {error}", field("path")),
            Self::FilePath => format!("Failed to get file path for {} {error}", field("url")),
            Self::UploadUrl => format!("Failed to request file url, Error: {error}"),
        }
    }
}

/// Runs `operation` on `engine`, returning the resulting URL or path.
///
/// # Errors
///
/// Returns [`EngineError::InvalidRequest`] when `request` lacks the required
/// key, [`EngineError::NoEngine`] or [`EngineError::Disconnected`] when no
/// usable engine is given, and [`EngineError::FileOperation`] when the engine
/// reports failure.
pub async fn perform_file_operation(
    engine: Option<&Arc<dyn Engine>>,
    operation: FileOperation,
    request: Value,
) -> Result<String, EngineError> {
    if let Some(key) = operation.required_key() {
        if request.get(key).is_none() {
            return Err(EngineError::InvalidRequest {
                message: format!("You must pass an object contains keys named `{key}` and `engine`"),
            });
        }
    }
    let target = engine.ok_or(EngineError::NoEngine)?;
    if !target.is_connected() {
        return Err(EngineError::Disconnected);
    }
    let response = match operation {
        FileOperation::FileUrl => target.get_file_url(request.clone()).await?,
        FileOperation::FilePath => target.get_file_path(request.clone()).await?,
        FileOperation::UploadUrl => target.request_upload_url(request.clone()).await?,
    };
    let location = match operation {
        FileOperation::FilePath => response.path,
        FileOperation::FileUrl | FileOperation::UploadUrl => response.url,
    };
    match location {
        Some(value) if response.success => Ok(value),
        _ => {
            let default_error = if operation == FileOperation::UploadUrl {
                "UNKNOWN"
            } else {
                ""
            };
            let error = response.error.as_deref().unwrap_or(default_error);
            Err(EngineError::FileOperation {
                message: operation.failure(&request, error),
            })
        }
    }
}
