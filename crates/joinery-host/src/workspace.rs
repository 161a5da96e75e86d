//! Workspaces and the documents stored in them.
//!
//! The workspace list lives in the configuration store. Each workspace has
//! its own document store holding plugin records keyed by durable id and
//! workflow records keyed by `<name>_workflow`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

use crate::backend::PluginKind;
use crate::error::HostError;
use crate::events::{EventBus, HostEvent};
use crate::messages::MessageSink;
use crate::parser::{PluginConfig, first_docs};
use crate::store::{KeyValueStore, WorkspaceStores, content_hash};

/// Key of the workspace list document in the configuration store.
pub const WORKSPACE_LIST_KEY: &str = "workspace_list";

/// Workspace created when none is stored.
pub const DEFAULT_WORKSPACE: &str = "default";

const WORKSPACE_TARGET: &str = "joinery_host::workspace";
const WORKFLOW_SUFFIX: &str = "_workflow";
const NOTICE: Duration = Duration::from_secs(5);

/// A plugin document persisted in a workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Durable id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Plugin name.
    #[serde(default)]
    pub name: String,
    /// Declared execution kind.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Full plugin source.
    #[serde(default)]
    pub code: String,
    /// Content hash of `code` taken when the record was saved.
    #[serde(default)]
    pub hash: Option<String>,
    /// Selected variant tag.
    #[serde(default)]
    pub tag: Option<String>,
    /// Reference the plugin was installed from.
    #[serde(default)]
    pub origin: Option<String>,
    /// Declared version.
    #[serde(default)]
    pub version: Option<String>,
    /// Declared description.
    #[serde(default)]
    pub description: Option<String>,
    /// Saved engine affinity.
    #[serde(default)]
    pub engine_mode: Option<String>,
    /// Declared dependencies.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PluginRecord {
    /// Builds the record saved for `config`, hashing its source.
    #[must_use]
    pub fn from_config(config: &PluginConfig) -> Self {
        Self {
            id: config.durable_id.clone(),
            name: config.name.clone(),
            kind: config.kind.clone(),
            hash: Some(content_hash(&config.code)),
            code: config.code.clone(),
            tag: config.tag.clone(),
            origin: config.origin.clone(),
            version: config.version.clone(),
            description: config.description.clone(),
            engine_mode: config.engine_mode.clone(),
            dependencies: config.dependencies.clone(),
        }
    }

    /// Execution kind, when the declared type is known.
    #[must_use]
    pub fn plugin_kind(&self) -> Option<PluginKind> {
        self.kind.parse().ok()
    }

    /// Returns `true` unless a recorded hash disagrees with the source.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.hash
            .as_deref()
            .is_none_or(|hash| hash.is_empty() || hash == content_hash(&self.code))
    }
}

/// A plugin listed in the open workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledPlugin {
    /// Stored document.
    pub record: PluginRecord,
    /// `false` when the stored hash does not match the source.
    pub verified: bool,
}

/// A saved workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Durable id, `<name>_workflow`.
    #[serde(rename = "_id")]
    pub id: String,
    /// Workflow name.
    pub name: String,
    /// Serialised graph.
    pub workflow: String,
}

impl WorkflowRecord {
    /// Serialises `graph` under `name`.
    #[must_use]
    pub fn new(name: &str, graph: &Value) -> Self {
        Self {
            id: format!("{name}{WORKFLOW_SUFFIX}"),
            name: name.to_owned(),
            workflow: graph.to_string(),
        }
    }
}

#[derive(Default)]
struct WorkspaceState {
    list: Vec<String>,
    selected: Option<String>,
    store: Option<Arc<dyn KeyValueStore>>,
    installed: Vec<InstalledPlugin>,
    workflows: Vec<WorkflowRecord>,
}

/// Tracks the workspace list and the documents of the open workspace.
pub struct WorkspaceManager {
    config_store: Arc<dyn KeyValueStore>,
    stores: Arc<dyn WorkspaceStores>,
    events: EventBus,
    messages: Arc<dyn MessageSink>,
    state: Mutex<WorkspaceState>,
}

impl WorkspaceManager {
    /// Creates a manager with no workspace open.
    #[must_use]
    pub fn new(
        config_store: Arc<dyn KeyValueStore>,
        stores: Arc<dyn WorkspaceStores>,
        events: EventBus,
        messages: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            config_store,
            stores,
            events,
            messages,
            state: Mutex::new(WorkspaceState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkspaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Known workspace names.
    #[must_use]
    pub fn workspaces(&self) -> Vec<String> {
        self.lock().list.clone()
    }

    /// Name of the open workspace.
    #[must_use]
    pub fn selected(&self) -> Option<String> {
        self.lock().selected.clone()
    }

    /// Store of the open workspace.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] before a workspace is opened.
    pub fn store(&self) -> Result<Arc<dyn KeyValueStore>, HostError> {
        self.lock().store.clone().ok_or(HostError::NoWorkspace)
    }

    /// Plugins listed by the last [`Self::reload_documents`].
    #[must_use]
    pub fn installed(&self) -> Vec<InstalledPlugin> {
        self.lock().installed.clone()
    }

    /// Workflows listed by the last [`Self::reload_documents`].
    #[must_use]
    pub fn workflows(&self) -> Vec<WorkflowRecord> {
        self.lock().workflows.clone()
    }

    /// Reads the workspace list, creating `["default"]` when none is stored.
    ///
    /// The first listed workspace becomes the selected one.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Storage`] when the default list cannot be written.
    pub async fn load_workspace_list(&self) -> Result<Vec<String>, HostError> {
        let stored = match self.config_store.get(WORKSPACE_LIST_KEY).await {
            Ok(doc) => doc
                .get("list")
                .cloned()
                .and_then(|list| serde_json::from_value::<Vec<String>>(list).ok())
                .filter(|list| !list.is_empty()),
            Err(error) => {
                if !error.is_not_found() {
                    error!(target: WORKSPACE_TARGET, %error, "Database Error");
                }
                None
            }
        };
        let list = match stored {
            Some(list) => list,
            None => {
                let list = vec![DEFAULT_WORKSPACE.to_owned()];
                self.write_list(&list).await?;
                list
            }
        };
        let mut state = self.lock();
        state.list.clone_from(&list);
        state.selected = list.first().cloned();
        Ok(list)
    }

    async fn write_list(&self, list: &[String]) -> Result<(), HostError> {
        self.config_store
            .put(json!({
                "_id": WORKSPACE_LIST_KEY,
                "list": list,
                "default": DEFAULT_WORKSPACE,
            }))
            .await?;
        Ok(())
    }

    /// Persists the current workspace list.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Storage`] when the write fails.
    pub async fn save_workspace_list(&self) -> Result<(), HostError> {
        let list = self.workspaces();
        self.write_list(&list).await
    }

    /// Opens `requested`, or the selected workspace when `None`.
    ///
    /// Unknown names are appended to the list and persisted first.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] when nothing is selected and
    /// storage failures.
    pub async fn load_workspace(&self, requested: Option<&str>) -> Result<String, HostError> {
        let name = match requested {
            Some(workspace) => workspace.to_owned(),
            None => self.selected().ok_or(HostError::NoWorkspace)?,
        };
        let added = {
            let mut state = self.lock();
            if state.list.contains(&name) {
                false
            } else {
                state.list.push(name.clone());
                true
            }
        };
        if added {
            self.save_workspace_list().await?;
        }
        self.events.emit(HostEvent::WorkspaceListUpdated {
            workspaces: self.workspaces(),
        });
        let store = self.stores.open(&name)?;
        {
            let mut state = self.lock();
            state.store = Some(store);
            state.selected = Some(name.clone());
            state.installed.clear();
            state.workflows.clear();
        }
        info!(target: WORKSPACE_TARGET, workspace = %name, "workspace opened");
        Ok(name)
    }

    /// Drops `name` from the list and persists it. Unknown names are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Storage`] when the list cannot be written.
    pub async fn remove_workspace(&self, name: &str) -> Result<(), HostError> {
        let removed = {
            let mut state = self.lock();
            let before = state.list.len();
            state.list.retain(|workspace| workspace != name);
            state.list.len() != before
        };
        if !removed {
            return Ok(());
        }
        self.save_workspace_list().await?;
        let mut state = self.lock();
        if state.selected.as_deref() == Some(name) {
            state.selected = None;
            state.store = None;
        }
        Ok(())
    }

    /// Reads every document of the open workspace.
    ///
    /// Documents with a `workflow` field are workflows; the rest are plugin
    /// records, sorted by name. A record whose hash does not match its
    /// source is listed with `verified = false`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures.
    pub async fn reload_documents(&self) -> Result<Vec<InstalledPlugin>, HostError> {
        let store = self.store()?;
        let mut plugins = Vec::new();
        let mut workflows = Vec::new();
        for doc in store.all_docs().await? {
            if doc.get("workflow").is_some() {
                match serde_json::from_value::<WorkflowRecord>(doc) {
                    Ok(workflow) => workflows.push(workflow),
                    Err(error) => warn!(target: WORKSPACE_TARGET, %error, "skipping malformed workflow"),
                }
                continue;
            }
            let record = match serde_json::from_value::<PluginRecord>(doc) {
                Ok(record) => record,
                Err(error) => {
                    warn!(target: WORKSPACE_TARGET, %error, "skipping malformed plugin document");
                    continue;
                }
            };
            let verified = record.is_verified();
            if !verified {
                error!(
                    target: WORKSPACE_TARGET,
                    plugin = %record.name,
                    "Plugin source code signature mismatch, skip loading plugin"
                );
            }
            plugins.push(InstalledPlugin { record, verified });
        }
        plugins.sort_by(|left, right| left.record.name.cmp(&right.record.name));
        workflows.sort_by(|left, right| left.name.cmp(&right.name));
        let mut state = self.lock();
        state.installed.clone_from(&plugins);
        state.workflows = workflows;
        Ok(plugins)
    }

    /// Writes `record` and lists it as installed, replacing any entry with the same name.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures.
    pub async fn save_plugin(&self, record: PluginRecord) -> Result<(), HostError> {
        let store = self.store()?;
        let doc = serde_json::to_value(&record).unwrap_or_else(|_| Value::Object(Map::new()));
        if let Err(error) = store.put(doc).await {
            self.messages
                .show_message("Failed to save the plugin.", Some(Duration::from_secs(15)));
            return Err(error.into());
        }
        self.messages.show_message(
            &format!("{} has been successfully saved.", record.name),
            Some(NOTICE),
        );
        let mut state = self.lock();
        state.installed.retain(|entry| entry.record.name != record.name);
        state.installed.push(InstalledPlugin {
            record,
            verified: true,
        });
        Ok(())
    }

    /// Deletes the document of `record` and drops it from the installed list.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures.
    pub async fn remove_plugin(&self, record: &PluginRecord) -> Result<(), HostError> {
        let store = self.store()?;
        store.remove(&record.id).await?;
        self.lock()
            .installed
            .retain(|entry| entry.record.name != record.name);
        Ok(())
    }

    /// Stored source of the plugin with durable id `id`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures.
    pub async fn plugin_source(&self, id: &str) -> Result<String, HostError> {
        let doc = self.store()?.get(id).await?;
        Ok(doc
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned())
    }

    /// First `<docs>` block of the stored source of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures.
    pub async fn plugin_docs(&self, id: &str) -> Result<Option<String>, HostError> {
        let code = self.plugin_source(id).await?;
        Ok(first_docs(&code))
    }

    /// Saves `graph` as the workflow `name`, replacing one with the same name.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures.
    pub async fn save_workflow(&self, name: &str, graph: &Value) -> Result<WorkflowRecord, HostError> {
        let store = self.store()?;
        let record = WorkflowRecord::new(name, graph);
        let doc = serde_json::to_value(&record).unwrap_or_else(|_| Value::Object(Map::new()));
        if let Err(error) = store.put(doc).await {
            self.messages.show_message("Failed to save the workflow.", Some(NOTICE));
            return Err(error.into());
        }
        {
            let mut state = self.lock();
            state.workflows.retain(|workflow| workflow.id != record.id);
            state.workflows.push(record.clone());
        }
        self.messages.show_message(
            &format!("Workflow \"{name}\" has been successfully saved."),
            Some(NOTICE),
        );
        Ok(record)
    }

    /// Deletes a saved workflow.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::NoWorkspace`] or storage failures.
    pub async fn remove_workflow(&self, workflow: &WorkflowRecord) -> Result<(), HostError> {
        let store = self.store()?;
        if let Err(error) = store.remove(&workflow.id).await {
            self.messages.show_message("Failed to remove the workflow.", Some(NOTICE));
            return Err(error.into());
        }
        self.lock()
            .workflows
            .retain(|entry| entry.id != workflow.id);
        self.messages.show_message(
            &format!("Workflow \"{}\" has been successfully removed.", workflow.name),
            Some(NOTICE),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::store::{MemoryStore, MemoryWorkspaceStores};
    use crate::tests::support::RecordingMessages;

    struct Fixture {
        config_store: Arc<MemoryStore>,
        stores: Arc<MemoryWorkspaceStores>,
        manager: WorkspaceManager,
    }

    fn fixture() -> Fixture {
        let config_store = Arc::new(MemoryStore::new());
        let stores = Arc::new(MemoryWorkspaceStores::new());
        let manager = WorkspaceManager::new(
            config_store.clone(),
            stores.clone(),
            EventBus::new(),
            Arc::new(RecordingMessages::default()),
        );
        Fixture {
            config_store,
            stores,
            manager,
        }
    }

    fn record(name: &str, code: &str, hash: Option<&str>) -> Value {
        json!({"_id": name, "name": name, "type": "web-worker", "code": code, "hash": hash})
    }

    #[tokio::test]
    async fn missing_workspace_list_is_created() {
        let fx = fixture();
        let list = fx.manager.load_workspace_list().await.expect("list");
        assert_eq!(list, vec![DEFAULT_WORKSPACE.to_owned()]);
        let stored = fx.config_store.get(WORKSPACE_LIST_KEY).await.expect("stored");
        assert_eq!(stored["list"], json!(["default"]));
        assert_eq!(fx.manager.selected().as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn unknown_workspace_is_added_on_open() {
        let fx = fixture();
        fx.manager.load_workspace_list().await.expect("list");
        fx.manager.load_workspace(Some("lab")).await.expect("open");
        assert_eq!(fx.manager.workspaces(), vec!["default".to_owned(), "lab".to_owned()]);
        let stored = fx.config_store.get(WORKSPACE_LIST_KEY).await.expect("stored");
        assert_eq!(stored["list"], json!(["default", "lab"]));
        assert_eq!(fx.manager.selected().as_deref(), Some("lab"));
    }

    #[tokio::test]
    async fn removing_the_open_workspace_closes_it() {
        let fx = fixture();
        fx.manager.load_workspace_list().await.expect("list");
        fx.manager.load_workspace(Some("lab")).await.expect("open");
        fx.manager.remove_workspace("lab").await.expect("remove");
        assert!(fx.manager.selected().is_none());
        assert!(matches!(fx.manager.store(), Err(HostError::NoWorkspace)));
    }

    #[tokio::test]
    async fn mismatched_hash_stays_listed_but_unverified() {
        let fx = fixture();
        fx.manager.load_workspace_list().await.expect("list");
        fx.manager.load_workspace(None).await.expect("open");
        let store = fx.stores.store("default");
        store.put(record("Good", "code", Some(content_hash("code").as_str()))).await.expect("put");
        store.put(record("Bad", "code", Some("xyz"))).await.expect("put");
        store
            .put(json!({"_id": "Flow_workflow", "name": "Flow", "workflow": "{}"}))
            .await
            .expect("put");

        let plugins = fx.manager.reload_documents().await.expect("reload");
        let listed: Vec<_> = plugins
            .iter()
            .map(|plugin| (plugin.record.name.as_str(), plugin.verified))
            .collect();
        assert_eq!(listed, vec![("Bad", false), ("Good", true)]);
        assert_eq!(fx.manager.workflows().len(), 1);
    }

    #[rstest]
    #[case(None, true)]
    #[case(Some(""), true)]
    #[case(Some("xyz"), false)]
    fn records_without_a_matching_hash_are_unverified(#[case] hash: Option<&str>, #[case] verified: bool) {
        let record = PluginRecord {
            code: "abc".into(),
            hash: hash.map(str::to_owned),
            ..PluginRecord::default()
        };
        assert_eq!(record.is_verified(), verified);
    }

    #[tokio::test]
    async fn workflows_are_saved_and_removed() {
        let fx = fixture();
        fx.manager.load_workspace_list().await.expect("list");
        fx.manager.load_workspace(None).await.expect("open");
        let saved = fx
            .manager
            .save_workflow("Segment", &json!({"nodes": []}))
            .await
            .expect("save");
        assert_eq!(saved.id, "Segment_workflow");
        assert_eq!(fx.manager.workflows(), vec![saved.clone()]);
        fx.manager.remove_workflow(&saved).await.expect("remove");
        assert!(fx.manager.workflows().is_empty());
        assert!(fx.stores.store("default").is_empty());
    }

    #[tokio::test]
    async fn plugin_docs_come_from_the_stored_source() {
        let fx = fixture();
        fx.manager.load_workspace_list().await.expect("list");
        fx.manager.load_workspace(None).await.expect("open");
        fx.stores
            .store("default")
            .put(record("Doc", "<docs>Read me</docs>", None))
            .await
            .expect("put");
        let docs = fx.manager.plugin_docs("Doc").await.expect("docs");
        assert_eq!(docs.as_deref(), Some("Read me"));
    }
}
