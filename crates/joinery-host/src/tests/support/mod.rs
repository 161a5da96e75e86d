//! Shared fixtures for unit and behavioural tests.

mod backend;
mod collaborators;
mod host;
mod world;

pub use backend::{ConnectMode, Script};
pub use collaborators::{RecordingMessages, engine_url, mock_engine, serving_engine};
pub use host::{PluginSource, TestHost, source_uri};
pub use world::{TestWorld, world};
