//! Host event broadcast.

use tokio::sync::broadcast;
use tracing::trace;

const EVENT_TARGET: &str = "joinery_host::events";
const EVENT_CAPACITY: usize = 64;

/// Notifications emitted as plugins and workspaces change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// An instance finished loading.
    PluginLoaded {
        /// Runtime instance id.
        id: String,
        /// Plugin name.
        name: String,
    },
    /// Every instance under a name was unloaded.
    PluginUnloaded {
        /// Plugin name.
        name: String,
    },
    /// A plugin document was written to the workspace.
    PluginInstalled {
        /// Plugin name.
        name: String,
    },
    /// A plugin document was deleted from the workspace.
    PluginRemoved {
        /// Plugin name.
        name: String,
    },
    /// An operation was published to the workflow graph.
    OperationRegistered {
        /// Operation key.
        key: String,
        /// Owning instance id.
        plugin_id: String,
    },
    /// The workspace list changed or a workspace was opened.
    WorkspaceListUpdated {
        /// Known workspace names.
        workspaces: Vec<String>,
    },
}

/// Cloneable handle onto the host's event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HostEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Subscribes to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }

    /// Publishes `event` to current subscribers.
    pub fn emit(&self, event: HostEvent) {
        if self.sender.send(event).is_err() {
            trace!(target: EVENT_TARGET, "event dropped: no subscribers");
        }
    }
}
