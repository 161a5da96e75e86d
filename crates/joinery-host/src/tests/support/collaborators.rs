//! Recording stand-ins for the host's embedder-side collaborators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::{Engine, EngineList, FileOpResponse, MockEngine};
use crate::messages::MessageSink;
use crate::window::{
    CloseHandler, InputLoader, InputLoaderDescriptor, WindowCallbacks, WindowConfig, WindowError,
    WindowManager,
};
use crate::workflow::{GraphError, NodeHandlers, NodeTemplate, WorkflowGraph};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Message sink keeping every notice in order.
#[derive(Default)]
pub struct RecordingMessages {
    messages: Mutex<Vec<(String, Option<Duration>)>>,
}

impl RecordingMessages {
    /// Texts shown so far.
    pub fn texts(&self) -> Vec<String> {
        lock(&self.messages)
            .iter()
            .map(|(text, _)| text.clone())
            .collect()
    }

    /// Returns `true` when some notice contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.texts().iter().any(|text| text.contains(needle))
    }

    /// Duration attached to the first notice containing `needle`.
    pub fn duration_of(&self, needle: &str) -> Option<Duration> {
        lock(&self.messages)
            .iter()
            .find(|(text, _)| text.contains(needle))
            .and_then(|(_, duration)| *duration)
    }
}

impl MessageSink for RecordingMessages {
    fn show_message(&self, text: &str, duration: Option<Duration>) {
        lock(&self.messages).push((text.to_owned(), duration));
    }
}

/// Window callbacks counting what the host asked of them.
#[derive(Default)]
pub struct RecordingCallbacks {
    pub window_id: String,
    focused: AtomicUsize,
    refreshed: AtomicUsize,
    closed: AtomicUsize,
    close_handlers: Mutex<Vec<CloseHandler>>,
}

impl RecordingCallbacks {
    fn for_window(window_id: &str) -> Self {
        Self {
            window_id: window_id.to_owned(),
            ..Self::default()
        }
    }

    pub fn focus_count(&self) -> usize {
        self.focused.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshed.load(Ordering::SeqCst)
    }

    pub fn close_handler_count(&self) -> usize {
        lock(&self.close_handlers).len()
    }

    /// Simulates the user closing the window.
    pub async fn fire_close(&self) {
        let handlers: Vec<CloseHandler> = lock(&self.close_handlers).drain(..).collect();
        for handler in handlers {
            handler().await;
        }
    }
}

impl WindowCallbacks for RecordingCallbacks {
    fn focus(&self) {
        self.focused.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn refresh(&self) {
        self.refreshed.fetch_add(1, Ordering::SeqCst);
    }

    fn resize(&self) {}

    fn on_close(&self, handler: CloseHandler) {
        lock(&self.close_handlers).push(handler);
    }
}

#[derive(Default)]
struct WindowState {
    windows: Vec<WindowConfig>,
    callbacks: Vec<Arc<RecordingCallbacks>>,
    loaders: BTreeMap<String, (InputLoaderDescriptor, InputLoader)>,
    unregistered: Vec<String>,
    prompts: Vec<String>,
    prompt_answer: Value,
}

/// Window manager recording windows, callbacks and input loaders.
#[derive(Default)]
pub struct RecordingWindowManager {
    state: Mutex<WindowState>,
}

impl RecordingWindowManager {
    /// Windows added so far.
    pub fn windows(&self) -> Vec<WindowConfig> {
        lock(&self.state).windows.clone()
    }

    /// Callbacks created for window `id`.
    pub fn callbacks_for(&self, id: &str) -> Option<Arc<RecordingCallbacks>> {
        lock(&self.state)
            .callbacks
            .iter()
            .find(|callbacks| callbacks.window_id == id)
            .cloned()
    }

    /// Published input loader under `key`.
    pub fn loader(&self, key: &str) -> Option<InputLoader> {
        lock(&self.state)
            .loaders
            .get(key)
            .map(|(_, loader)| Arc::clone(loader))
    }

    /// Keys of the published input loaders.
    pub fn loader_keys(&self) -> Vec<String> {
        lock(&self.state).loaders.keys().cloned().collect()
    }

    /// Keys withdrawn so far, in order.
    pub fn unregistered(&self) -> Vec<String> {
        lock(&self.state).unregistered.clone()
    }

    /// Plugins the user was prompted for.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.state).prompts.clone()
    }

    /// Sets the answer returned by every prompt.
    pub fn answer_prompts_with(&self, answer: Value) {
        lock(&self.state).prompt_answer = answer;
    }
}

#[async_trait]
impl WindowManager for RecordingWindowManager {
    async fn add_window(&self, config: &WindowConfig) -> Result<String, WindowError> {
        let mut state = lock(&self.state);
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("window_{}", state.windows.len()));
        state.windows.push(config.clone());
        Ok(id)
    }

    fn setup_callbacks(&self, config: &WindowConfig) -> Arc<dyn WindowCallbacks> {
        let callbacks = Arc::new(RecordingCallbacks::for_window(
            config.id.as_deref().unwrap_or_default(),
        ));
        lock(&self.state).callbacks.push(Arc::clone(&callbacks));
        callbacks
    }

    fn register_input_loader(&self, key: &str, descriptor: &InputLoaderDescriptor, loader: InputLoader) {
        lock(&self.state)
            .loaders
            .insert(key.to_owned(), (descriptor.clone(), loader));
    }

    fn unregister_input_loader(&self, key: &str) {
        let mut state = lock(&self.state);
        state.loaders.remove(key);
        state.unregistered.push(key.to_owned());
    }

    async fn prompt_config(&self, plugin: &str, _ui: &Value) -> Result<Value, WindowError> {
        let mut state = lock(&self.state);
        state.prompts.push(plugin.to_owned());
        Ok(state.prompt_answer.clone())
    }
}

#[derive(Default)]
struct GraphState {
    nodes: BTreeMap<String, (NodeTemplate, NodeHandlers)>,
    removed: Vec<String>,
    reject: Option<String>,
}

/// Workflow graph keeping published nodes by key.
#[derive(Default)]
pub struct RecordingGraph {
    state: Mutex<GraphState>,
}

impl RecordingGraph {
    /// Template published under `key`.
    pub fn template(&self, key: &str) -> Option<NodeTemplate> {
        lock(&self.state).nodes.get(key).map(|(template, _)| template.clone())
    }

    /// Handlers published under `key`.
    pub fn handlers(&self, key: &str) -> Option<NodeHandlers> {
        lock(&self.state).nodes.get(key).map(|(_, handlers)| handlers.clone())
    }

    /// Published keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.state).nodes.keys().cloned().collect()
    }

    /// Keys withdrawn so far, in order.
    pub fn removed(&self) -> Vec<String> {
        lock(&self.state).removed.clone()
    }

    /// Makes the graph reject nodes published under `key`.
    pub fn reject(&self, key: &str) {
        lock(&self.state).reject = Some(key.to_owned());
    }
}

impl WorkflowGraph for RecordingGraph {
    fn add_node(&self, template: NodeTemplate, handlers: NodeHandlers) -> Result<(), GraphError> {
        let mut state = lock(&self.state);
        if state.reject.as_deref() == Some(template.op_key.as_str()) {
            return Err(GraphError {
                key: template.op_key,
                message: "duplicate node type".to_owned(),
            });
        }
        state
            .nodes
            .insert(template.op_key.clone(), (template, handlers));
        Ok(())
    }

    fn remove_node(&self, op_key: &str) {
        let mut state = lock(&self.state);
        state.nodes.remove(op_key);
        state.removed.push(op_key.to_owned());
    }
}

/// Mock engine reachable at `http://{id}:9527`.
pub fn mock_engine(id: &str, connected: bool) -> MockEngine {
    let mut engine = MockEngine::new();
    let engine_id = id.to_owned();
    engine.expect_id().returning(move || engine_id.clone());
    let url = engine_url(id);
    engine.expect_url().returning(move || url.clone());
    engine.expect_is_connected().return_const(connected);
    engine
}

/// URL served by [`mock_engine`] for `id`.
pub fn engine_url(id: &str) -> String {
    format!("http://{id}:9527")
}

/// Connected mock engine answering file-url requests with a fixed URL.
pub fn serving_engine(id: &str) -> Arc<dyn Engine> {
    let mut engine = mock_engine(id, true);
    let served = format!("{}/file/served", engine_url(id));
    engine.expect_get_file_url().returning(move |request| {
        Ok(FileOpResponse {
            success: request.get("path").is_some(),
            url: Some(served.clone()),
            ..FileOpResponse::default()
        })
    });
    Arc::new(engine)
}

/// An engine list with no engines.
pub fn no_engines() -> Arc<EngineList> {
    Arc::new(EngineList::new(Vec::new()))
}

