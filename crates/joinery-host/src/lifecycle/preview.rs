//! Proxy API served by preloaded window plugins.

use std::sync::Weak;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::LifecycleController;
use crate::backend::{ApiMember, BackendError, PluginApi};
use crate::parser::PluginConfig;
use crate::repository::is_truthy;
use crate::window::WindowConfig;

/// Stands in for a window plugin until one of its windows is opened.
///
/// `setup` does nothing; `run` opens a window of the plugin's own type
/// seeded from the plugin's `defaults`.
pub(super) struct PreviewApi {
    controller: Weak<LifecycleController>,
    template: PluginConfig,
}

impl PreviewApi {
    pub(super) const fn new(controller: Weak<LifecycleController>, template: PluginConfig) -> Self {
        Self {
            controller,
            template,
        }
    }

    fn window_for(&self, payload: &Value) -> WindowConfig {
        let mut window: WindowConfig = self
            .template
            .defaults
            .clone()
            .filter(Value::is_object)
            .and_then(|defaults| serde_json::from_value(defaults).ok())
            .unwrap_or_default();
        window.window_type.clone_from(&self.template.name);
        window.name.clone_from(&self.template.name);
        window.tag.clone_from(&self.template.tag);
        let field = |key: &str| {
            payload
                .get(key)
                .filter(|value| is_truthy(value))
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()))
        };
        window.data = field("data");
        window.config = field("config");
        window.id = payload.get("id").and_then(Value::as_str).map(str::to_owned);
        window
    }
}

#[async_trait]
impl PluginApi for PreviewApi {
    fn exposes(&self, member: ApiMember) -> bool {
        matches!(member, ApiMember::Setup | ApiMember::Run)
    }

    async fn setup(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), BackendError> {
        Err(BackendError::new("resume() is not available on a window preview"))
    }

    async fn run(&self, payload: Value) -> Result<Value, BackendError> {
        let controller = self
            .controller
            .upgrade()
            .ok_or_else(|| BackendError::new("plugin host has shut down"))?;
        let handle = controller
            .create_window(None, self.window_for(&payload))
            .await
            .map_err(|error| BackendError::with_source(error.to_string(), error))?;
        Ok(json!({ "id": handle.id }))
    }

    async fn update(&self, _payload: Value) -> Result<Value, BackendError> {
        Err(BackendError::new("update() is not available on a window preview"))
    }

    async fn call(&self, function: &str, mut args: Vec<Value>) -> Result<Value, BackendError> {
        match function.parse::<ApiMember>() {
            Ok(ApiMember::Setup) => self.setup().await.map(|()| Value::Null),
            Ok(ApiMember::Run) => {
                let payload = if args.is_empty() {
                    Value::Null
                } else {
                    args.swap_remove(0)
                };
                self.run(payload).await
            }
            _ => Err(BackendError::new(format!(
                "function \"{function}\" of {} is not available.",
                self.template.name
            ))),
        }
    }
}
