//! Key-value storage contract for configuration and workspace documents.
//!
//! Documents are JSON objects keyed by their `_id` field. "Not found" is a
//! distinguished error kind so callers can fall back to defaults without
//! masking genuine storage failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Field holding a document's key.
pub const ID_FIELD: &str = "_id";

/// Errors reported by [`KeyValueStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No document exists under the key.
    #[error("document '{key}' not found")]
    NotFound {
        /// Requested key.
        key: String,
    },

    /// A document without an `_id` string was written.
    #[error("document has no '_id' field")]
    MissingId,

    /// The storage backend failed.
    #[error("storage failure: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Returns `true` for the distinguished "not found" kind.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Document store used for configuration and per-workspace data.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the key is absent.
    async fn get(&self, key: &str) -> Result<Value, StoreError>;

    /// Writes `doc`, replacing any document with the same `_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingId`] when `doc` has no `_id`.
    async fn put(&self, doc: Value) -> Result<(), StoreError>;

    /// Deletes the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the key is absent.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Returns every document, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the store cannot be read.
    async fn all_docs(&self) -> Result<Vec<Value>, StoreError>;
}

/// Opens the document store backing a named workspace.
pub trait WorkspaceStores: Send + Sync {
    /// Returns the store for `workspace`, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the store cannot be opened.
    fn open(&self, workspace: &str) -> Result<Arc<dyn KeyValueStore>, StoreError>;
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when no documents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_owned(),
            })
    }

    async fn put(&self, doc: Value) -> Result<(), StoreError> {
        let key = doc
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .ok_or(StoreError::MissingId)?
            .to_owned();
        self.lock().insert(key, doc);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_owned(),
            })
    }

    async fn all_docs(&self) -> Result<Vec<Value>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }
}

/// In-memory [`WorkspaceStores`]; reopening a workspace yields the same store.
#[derive(Debug, Default)]
pub struct MemoryWorkspaceStores {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryWorkspaceStores {
    /// Creates an empty set of workspace stores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the concrete store for `workspace`, creating it when absent.
    #[must_use]
    pub fn store(&self, workspace: &str) -> Arc<MemoryStore> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            stores
                .entry(workspace.to_owned())
                .or_insert_with(|| Arc::new(MemoryStore::new())),
        )
    }
}

impl WorkspaceStores for MemoryWorkspaceStores {
    fn open(&self, workspace: &str) -> Result<Arc<dyn KeyValueStore>, StoreError> {
        let store: Arc<dyn KeyValueStore> = self.store(workspace);
        Ok(store)
    }
}

/// Content hash recorded on stored plugin documents.
#[must_use]
pub fn content_hash(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

#[cfg(test)]
mod tests;
