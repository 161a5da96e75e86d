//! Plugin host lifecycle controller.
//!
//! `joinery-host` resolves plugin identifiers against remote repositories,
//! parses multi-variant plugin sources, installs declared dependency graphs in
//! order, and drives every plugin instance through its
//! load/connect/setup/terminate state machine. Capabilities published by a
//! running instance are exposed to an external workflow graph as callable
//! operations, window types and input loaders.
//!
//! # Architecture
//!
//! Everything that actually executes plugin code lives behind collaborator
//! traits supplied by the embedder:
//!
//! - [`backend::BackendFactory`] instantiates sandboxes per [`PluginKind`].
//! - [`store::KeyValueStore`] persists repositories, workspaces and plugins.
//! - [`window::WindowManager`] owns window rendering.
//! - [`engine::EngineRegistry`] tracks remote execution engines.
//! - [`workflow::WorkflowGraph`] receives operation nodes.
//! - [`fetch::SourceFetcher`] downloads manifests and plugin sources.
//!
//! [`PluginHost`] wires these together. Instances are owned by an
//! [`lifecycle::InstanceIndex`] held by the host rather than by a global, so
//! several hosts can coexist in one process.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use joinery_config::Config;
//! use joinery_host::backend::BackendRegistry;
//! use joinery_host::store::{MemoryStore, MemoryWorkspaceStores};
//! use joinery_host::PluginHost;
//!
//! # async fn demo(
//! #     windows: Arc<dyn joinery_host::window::WindowManager>,
//! #     engines: Arc<dyn joinery_host::engine::EngineRegistry>,
//! #     graph: Arc<dyn joinery_host::workflow::WorkflowGraph>,
//! # ) -> Result<(), joinery_host::HostError> {
//! let config = Config::default();
//! let host = PluginHost::builder(config)
//!     .config_store(Arc::new(MemoryStore::new()))
//!     .workspace_stores(Arc::new(MemoryWorkspaceStores::new()))
//!     .backends(BackendRegistry::new())
//!     .windows(windows)
//!     .engines(engines)
//!     .graph(graph)
//!     .build()?;
//! host.init().await?;
//! host.install("oeway/ImJoy-Plugins:Image Window", None, false).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod api;
pub mod backend;
pub mod bridge;
pub mod capability;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch;
pub mod host;
mod ids;
pub mod installer;
pub mod lifecycle;
pub mod messages;
pub mod parser;
pub mod reference;
pub mod repository;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod window;
pub mod workflow;
pub mod workspace;

#[cfg(test)]
mod tests;

/// Boxed, sendable future used at trait seams that must stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use self::api::HostApi;
pub use self::backend::{BackendError, PluginKind};
pub use self::bridge::{PluginCall, Provenance, WorkflowNode};
pub use self::error::HostError;
pub use self::events::HostEvent;
pub use self::host::{PluginHost, PluginHostBuilder};
pub use self::lifecycle::{InstanceState, PluginInstance};
pub use self::parser::{ParseError, ParseOverrides, PluginConfig};
pub use self::repository::{Manifest, ManifestEntry, Repository};
pub use self::workspace::{InstalledPlugin, PluginRecord, WorkflowRecord};
