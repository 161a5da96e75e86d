//! Engine binding and resynchronisation rules.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use super::{Engine, EngineRegistry};

pub(super) const AUTO_MODE: &str = "auto";

const ENGINE_TARGET: &str = "joinery_host::engine";

/// Saved engine affinity of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EngineMode {
    /// Any connected engine.
    Auto,
    /// The engine with this id.
    Explicit(String),
}

impl EngineMode {
    /// Reads a stored `engine_mode`; unset and `auto` both mean [`Self::Auto`].
    #[must_use]
    pub fn from_setting(setting: Option<&str>) -> Self {
        match setting {
            None | Some("" | AUTO_MODE) => Self::Auto,
            Some(id) => Self::Explicit(id.to_owned()),
        }
    }

    /// Value passed to [`EngineRegistry::get_engine`].
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::Auto => AUTO_MODE,
            Self::Explicit(id) => id.as_str(),
        }
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an instance came to be bound to its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    /// The plugin named a specific engine.
    Explicit,
    /// The registry picked a connected engine.
    Auto,
    /// The instance re-attached to a suspended session.
    Resumed,
}

/// Engine bound to an instance at load time.
#[derive(Clone)]
pub struct EngineBinding {
    engine: Option<Arc<dyn Engine>>,
    requested: EngineMode,
    mode: BindingMode,
}

impl fmt::Debug for EngineBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBinding")
            .field("engine", &self.engine_id())
            .field("requested", &self.requested)
            .field("mode", &self.mode)
            .finish()
    }
}

impl EngineBinding {
    /// A binding with no engine, used for non-native kinds.
    #[must_use]
    pub const fn unbound(requested: EngineMode) -> Self {
        Self {
            engine: None,
            requested,
            mode: BindingMode::Auto,
        }
    }

    /// Binds to the engine `requested` selects, if it is connected.
    ///
    /// An unavailable engine leaves the instance unbound; the backend is
    /// responsible for refusing execution.
    #[must_use]
    pub fn resolve(registry: &dyn EngineRegistry, requested: EngineMode, resumed: bool) -> Self {
        let engine = registry
            .get_engine(requested.as_str())
            .filter(|engine| engine.is_connected());
        if engine.is_none() {
            warn!(target: ENGINE_TARGET, mode = %requested, "Please connect to the Plugin Engine.");
        }
        let mode = match (&requested, resumed) {
            (_, true) => BindingMode::Resumed,
            (EngineMode::Auto, false) => BindingMode::Auto,
            (EngineMode::Explicit(_), false) => BindingMode::Explicit,
        };
        Self {
            engine,
            requested,
            mode,
        }
    }

    /// Bound engine, if any.
    #[must_use]
    pub fn engine(&self) -> Option<&Arc<dyn Engine>> {
        self.engine.as_ref()
    }

    /// Id of the bound engine.
    #[must_use]
    pub fn engine_id(&self) -> Option<String> {
        self.engine.as_ref().map(|engine| engine.id())
    }

    /// URL of the bound engine.
    #[must_use]
    pub fn engine_url(&self) -> Option<String> {
        self.engine.as_ref().map(|engine| engine.url())
    }

    /// Saved affinity.
    #[must_use]
    pub const fn requested(&self) -> &EngineMode {
        &self.requested
    }

    /// How the binding was made.
    #[must_use]
    pub const fn mode(&self) -> BindingMode {
        self.mode
    }

    /// Returns `true` when bound to the engine with id `engine_id`.
    #[must_use]
    pub fn is_bound_to(&self, engine_id: &str) -> bool {
        self.engine_id().as_deref() == Some(engine_id)
    }
}

/// Observed state of the running instance for a plugin name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunningStatus {
    /// The instance is bound to an engine.
    pub has_engine: bool,
    /// The instance lost its engine.
    pub disconnected: bool,
    /// The instance has not connected yet.
    pub initializing: bool,
}

/// Decides whether an installed native plugin is reloaded when `engine_id` connects.
#[must_use]
pub fn should_reload(mode: &EngineMode, engine_id: &str, running: Option<RunningStatus>) -> bool {
    match mode {
        EngineMode::Explicit(id) => id == engine_id,
        EngineMode::Auto => running.is_none_or(|status| {
            !status.has_engine || (status.disconnected && !status.initializing)
        }),
    }
}

/// What happens to a live instance when its engine disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectAction {
    /// Reload so the instance can reconnect elsewhere.
    Reload,
    /// Unload the instance.
    Unload,
}

/// Chooses the [`DisconnectAction`] for an instance bound to a lost engine.
#[must_use]
pub fn disconnect_action(mode: &EngineMode, disconnected: bool, has_code: bool) -> DisconnectAction {
    if *mode == EngineMode::Auto && disconnected && has_code {
        DisconnectAction::Reload
    } else {
        DisconnectAction::Unload
    }
}

/// Per-name guard against overlapping resynchronisation reloads.
#[derive(Debug, Clone, Default)]
pub struct ReloadGuards {
    names: Arc<Mutex<HashSet<String>>>,
}

impl ReloadGuards {
    /// Creates an empty guard set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` as reloading; `None` if a reload is already in flight.
    #[must_use]
    pub fn begin(&self, name: &str) -> Option<ReloadGuard> {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        if !names.insert(name.to_owned()) {
            return None;
        }
        Some(ReloadGuard {
            names: Arc::clone(&self.names),
            name: name.to_owned(),
        })
    }

    /// Returns `true` while a reload of `name` is in flight.
    #[must_use]
    pub fn is_reloading(&self, name: &str) -> bool {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// Releases the in-flight mark for one name when dropped.
#[derive(Debug)]
pub struct ReloadGuard {
    names: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for ReloadGuard {
    fn drop(&mut self) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}
