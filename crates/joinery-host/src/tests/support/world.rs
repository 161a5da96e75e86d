//! BDD test world: a wired host plus the outcome of the last step.

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;

use super::host::{PluginSource, TestHost};
use crate::error::HostError;
use crate::events::HostEvent;
use crate::lifecycle::PluginInstance;

/// Scenario world shared across BDD steps.
pub struct TestWorld {
    runtime: Runtime,
    pub host: TestHost,
    events: Receiver<HostEvent>,
    pub last_error: Option<HostError>,
    pub pending: Option<JoinHandle<Result<Arc<PluginInstance>, HostError>>>,
}

impl TestWorld {
    /// Builds a world around a fresh host with the default workspace open.
    #[must_use]
    pub fn new() -> Self {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("test runtime should build");
        let host = TestHost::new();
        let events = host.host.subscribe();
        let world = Self {
            runtime,
            host,
            events,
            last_error: None,
            pending: None,
        };
        world.block_on(world.host.start());
        world
    }

    /// Drives `future` to completion on the world's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Spawns `future` on the world's runtime; it progresses during [`Self::block_on`].
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Serves a GitHub-style manifest for `repository` listing `plugins`.
    pub fn publish(&self, repository: &str, plugins: &[PluginSource]) {
        self.host.publish(repository, plugins);
    }

    /// Serves a standalone plugin source at its source URI.
    pub fn serve(&self, plugin: &PluginSource) -> String {
        let name = plugin.config().name;
        self.host.serve(&name, plugin)
    }

    /// Keeps the error of `result`, if any.
    pub fn remember<T>(&mut self, result: Result<T, HostError>) {
        self.last_error = result.err();
    }

    /// Events emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixture constructor used by every behavioural suite.
#[must_use]
pub fn world() -> RefCell<TestWorld> {
    RefCell::new(TestWorld::new())
}
