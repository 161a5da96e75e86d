//! Id and name indices over live instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::PluginInstance;

#[derive(Debug, Default)]
struct Indices {
    by_id: HashMap<String, Arc<PluginInstance>>,
    by_name: HashMap<String, Arc<PluginInstance>>,
}

/// Live instances keyed by runtime id and by plugin name.
///
/// Every mutation is visible to the next lookup; nothing is deferred.
#[derive(Debug, Default)]
pub struct InstanceIndex {
    indices: Mutex<Indices>,
}

impl InstanceIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Indices> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `instance` under its id and name.
    pub fn insert(&self, instance: Arc<PluginInstance>) {
        let mut indices = self.lock();
        indices
            .by_id
            .insert(instance.id().to_owned(), Arc::clone(&instance));
        indices.by_name.insert(instance.name().to_owned(), instance);
    }

    /// Instance with runtime id `id`.
    #[must_use]
    pub fn by_id(&self, id: &str) -> Option<Arc<PluginInstance>> {
        self.lock().by_id.get(id).cloned()
    }

    /// Most recently loaded instance named `name`.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.lock().by_name.get(name).cloned()
    }

    /// Every instance whose name is `name`, including superseded ones.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<Arc<PluginInstance>> {
        self.lock()
            .by_id
            .values()
            .filter(|instance| instance.name() == name)
            .cloned()
            .collect()
    }

    /// Removes `instance` from both indices.
    ///
    /// The name entry is only dropped while it still points at `instance`.
    pub fn remove(&self, instance: &PluginInstance) {
        let mut indices = self.lock();
        indices.by_id.remove(instance.id());
        let current = indices
            .by_name
            .get(instance.name())
            .is_some_and(|entry| entry.id() == instance.id());
        if current {
            indices.by_name.remove(instance.name());
        }
    }

    /// Removes every instance named `name` and returns them.
    pub fn remove_named(&self, name: &str) -> Vec<Arc<PluginInstance>> {
        let mut indices = self.lock();
        let ids: Vec<String> = indices
            .by_id
            .values()
            .filter(|instance| instance.name() == name)
            .map(|instance| instance.id().to_owned())
            .collect();
        indices.by_name.remove(name);
        ids.iter()
            .filter_map(|id| indices.by_id.remove(id))
            .collect()
    }

    /// Every live instance.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<PluginInstance>> {
        self.lock().by_id.values().cloned().collect()
    }

    /// Empties both indices and returns what they held.
    pub fn clear(&self) -> Vec<Arc<PluginInstance>> {
        let mut indices = self.lock();
        indices.by_name.clear();
        indices.by_id.drain().map(|(_, instance)| instance).collect()
    }

    /// Number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    /// Returns `true` when no instance is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().by_id.is_empty()
    }
}
