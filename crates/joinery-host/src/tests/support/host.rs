//! A fully wired host over in-memory collaborators.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use joinery_config::Config;

use super::backend::ScriptedFactory;
use super::collaborators::{RecordingGraph, RecordingMessages, RecordingWindowManager, no_engines};
use crate::backend::{BackendRegistry, PluginKind};
use crate::engine::EngineRegistry;
use crate::fetch::MemoryFetcher;
use crate::host::PluginHost;
use crate::lifecycle::LifecycleController;
use crate::parser::{ParseOverrides, PluginConfig, parse_plugin_source};
use crate::store::{MemoryStore, MemoryWorkspaceStores};

/// Base URL plugin sources are served from.
pub const SOURCE_ROOT: &str = "https://plugins.example.org/repository";

/// Kinds the scripted factory is registered for.
pub const SANDBOX_KINDS: [PluginKind; 6] = [
    PluginKind::Window,
    PluginKind::WebWorker,
    PluginKind::Iframe,
    PluginKind::WebPython,
    PluginKind::WebPythonWindow,
    PluginKind::NativePython,
];

/// Source URI of the plugin called `name`.
pub fn source_uri(name: &str) -> String {
    format!("{SOURCE_ROOT}/{name}.imjoy.html")
}

/// Raw manifest URL of a GitHub shorthand repository.
pub fn manifest_url(repository: &str) -> String {
    format!("https://raw.githubusercontent.com/{repository}/master/manifest.imjoy.json")
}

/// Builds plugin source text.
#[derive(Debug, Clone)]
pub struct PluginSource {
    fields: Map<String, Value>,
    docs: Option<String>,
}

impl PluginSource {
    pub fn new(name: &str, kind: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(name));
        fields.insert("type".into(), json!(kind));
        fields.insert("version".into(), json!("0.1.0"));
        fields.insert("api_version".into(), json!("0.1.8"));
        fields.insert("description".into(), json!(format!("{name} test plugin")));
        Self { fields, docs: None }
    }

    /// Sets a config field.
    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_owned(), value);
        self
    }

    pub fn version(self, version: &str) -> Self {
        self.field("version", json!(version))
    }

    pub fn dependencies(self, dependencies: &[&str]) -> Self {
        self.field("dependencies", json!(dependencies))
    }

    pub fn docs(mut self, docs: &str) -> Self {
        self.docs = Some(docs.to_owned());
        self
    }

    /// Renders the plugin file.
    pub fn render(&self) -> String {
        let config = Value::Object(self.fields.clone());
        let docs = self
            .docs
            .as_deref()
            .map(|docs| format!("<docs lang=\"markdown\">{docs}</docs>\n"))
            .unwrap_or_default();
        format!(
            "{docs}<config lang=\"json\">\n{config}\n</config>\n<script lang=\"javascript\">\nclass Plugin {{ async setup() {{}} }}\n</script>\n"
        )
    }

    /// Parses the rendered source.
    pub fn config(&self) -> PluginConfig {
        parse_plugin_source(&self.render(), &ParseOverrides::default())
            .expect("test plugin source should parse")
    }
}

/// A [`PluginHost`] wired to recording collaborators.
pub struct TestHost {
    pub host: PluginHost,
    pub fetcher: Arc<MemoryFetcher>,
    pub config_store: Arc<MemoryStore>,
    pub stores: Arc<MemoryWorkspaceStores>,
    pub factory: Arc<ScriptedFactory>,
    pub windows: Arc<RecordingWindowManager>,
    pub graph: Arc<RecordingGraph>,
    pub messages: Arc<RecordingMessages>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_engines(no_engines())
    }

    pub fn with_engines(engines: Arc<dyn EngineRegistry>) -> Self {
        let fetcher = Arc::new(MemoryFetcher::new());
        let config_store = Arc::new(MemoryStore::new());
        let stores = Arc::new(MemoryWorkspaceStores::new());
        let factory = ScriptedFactory::new();
        let windows = Arc::new(RecordingWindowManager::default());
        let graph = Arc::new(RecordingGraph::default());
        let messages = Arc::new(RecordingMessages::default());
        let backends = SANDBOX_KINDS
            .into_iter()
            .fold(BackendRegistry::new(), |registry, kind| {
                registry.with(kind, factory.clone())
            });
        let host = PluginHost::builder(Config::default())
            .config_store(config_store.clone())
            .workspace_stores(stores.clone())
            .backends(backends)
            .windows(windows.clone())
            .engines(engines)
            .graph(graph.clone())
            .fetcher(fetcher.clone())
            .messages(messages.clone())
            .build()
            .expect("test host should build");
        Self {
            host,
            fetcher,
            config_store,
            stores,
            factory,
            windows,
            graph,
            messages,
        }
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        self.host.controller()
    }

    /// Serves `source` under the source URI of `name` and returns that URI.
    pub fn serve(&self, name: &str, source: &PluginSource) -> String {
        let uri = source_uri(name);
        self.fetcher.insert(uri.clone(), source.render());
        uri
    }

    /// Serves a GitHub-style manifest for `repository` listing `plugins`.
    pub fn publish(&self, repository: &str, plugins: &[PluginSource]) {
        let entries: Vec<Value> = plugins
            .iter()
            .map(|plugin| {
                let name = plugin.config().name;
                let uri = self.serve(&name, plugin);
                json!({"name": name, "uri": uri})
            })
            .collect();
        let manifest = json!({
            "name": repository,
            "description": format!("{repository} plugins"),
            "uri_root": "",
            "plugins": entries,
        });
        self.fetcher.insert(manifest_url(repository), manifest.to_string());
    }

    /// Opens the default workspace, starting whatever it holds.
    pub async fn start(&self) {
        self.host.init().await.expect("host should initialise");
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}
