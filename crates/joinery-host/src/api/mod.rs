//! Host API surface handed to every sandbox.
//!
//! A [`HostApi`] is created before its sandbox and bound to the resulting
//! [`PluginInstance`] once it exists. Every call is made on behalf of that
//! instance; calls after the instance or its host were dropped fail with
//! [`HostError::CallerUnavailable`].

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::backend::PluginApi;
use crate::capability::OperationDescriptor;
use crate::engine::{Engine, FileOperation, perform_file_operation};
use crate::error::HostError;
use crate::lifecycle::{LifecycleController, PluginInstance};
use crate::repository::is_truthy;
use crate::window::{WindowConfig, WindowHandle};

const API_TARGET: &str = "joinery_host::api";

/// Operations a plugin may invoke on its host.
#[derive(Clone)]
pub struct HostApi {
    controller: Weak<LifecycleController>,
    caller: Arc<OnceLock<Weak<PluginInstance>>>,
}

impl fmt::Debug for HostApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let caller = self
            .caller
            .get()
            .and_then(Weak::upgrade)
            .map(|instance| instance.id().to_owned());
        f.debug_struct("HostApi").field("caller", &caller).finish()
    }
}

impl HostApi {
    pub(crate) fn new(controller: Weak<LifecycleController>) -> Self {
        Self {
            controller,
            caller: Arc::new(OnceLock::new()),
        }
    }

    /// Binds the API to the instance it serves. Later calls are ignored.
    pub(crate) fn bind(&self, instance: &Arc<PluginInstance>) {
        if self.caller.set(Arc::downgrade(instance)).is_err() {
            warn!(target: API_TARGET, plugin = %instance.name(), "host api already bound");
        }
    }

    fn controller(&self) -> Result<Arc<LifecycleController>, HostError> {
        self.controller.upgrade().ok_or(HostError::CallerUnavailable)
    }

    /// The instance this API serves.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::CallerUnavailable`] once the instance is gone.
    pub fn caller(&self) -> Result<Arc<PluginInstance>, HostError> {
        self.caller
            .get()
            .and_then(Weak::upgrade)
            .ok_or(HostError::CallerUnavailable)
    }

    /// Publishes an operation.
    ///
    /// # Errors
    ///
    /// See [`crate::capability::CapabilityRegistry::register`].
    pub fn register(&self, descriptor: OperationDescriptor) -> Result<String, HostError> {
        let caller = self.caller()?;
        self.controller()?.capabilities().register(&caller, descriptor)
    }

    /// Withdraws one operation, or all of them when `op_name` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::CallerUnavailable`] once the instance is gone.
    pub fn unregister(&self, op_name: Option<&str>) -> Result<(), HostError> {
        let caller = self.caller()?;
        self.controller()?
            .capabilities()
            .unregister(&caller, op_name);
        Ok(())
    }

    /// Opens a window on behalf of the caller.
    ///
    /// # Errors
    ///
    /// See [`LifecycleController::create_window`].
    pub async fn create_window(&self, config: WindowConfig) -> Result<WindowHandle, HostError> {
        let caller = self.caller().ok();
        self.controller()?.create_window(caller, config).await
    }

    fn target(&self, plugin_name: &str) -> Result<Arc<PluginInstance>, HostError> {
        self.controller()?
            .index()
            .by_name(plugin_name)
            .ok_or_else(|| HostError::PluginNotFound {
                name: plugin_name.to_owned(),
            })
    }

    /// Calls `function` exported by the live instance named `plugin_name`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::PluginNotFound`],
    /// [`HostError::FunctionUnavailable`] or the target's own failure.
    pub async fn call_plugin(
        &self,
        plugin_name: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, HostError> {
        let target = self.target(plugin_name)?;
        let api = target
            .api()
            .filter(|api| api.has_function(function))
            .ok_or_else(|| HostError::FunctionUnavailable {
                plugin: plugin_name.to_owned(),
                function: function.to_owned(),
            })?;
        api.call(function, args)
            .await
            .map_err(|source| HostError::backend(plugin_name, source))
    }

    /// API of the live instance named `plugin_name`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::PluginNotFound`] when no instance is live or
    /// it has not connected yet.
    pub fn get_plugin(&self, plugin_name: &str) -> Result<Arc<dyn PluginApi>, HostError> {
        self.target(plugin_name)?
            .api()
            .ok_or_else(|| HostError::PluginNotFound {
                name: plugin_name.to_owned(),
            })
    }

    /// Runs the live instance named `plugin_name` with `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::CallerUnavailable`] when the caller is gone,
    /// [`HostError::PluginNotFound`] or the target's own failure.
    pub async fn run_plugin(&self, plugin_name: &str, payload: Value) -> Result<Value, HostError> {
        self.caller()?;
        let api = self.get_plugin(plugin_name)?;
        let body = if payload.is_null() { json!({}) } else { payload };
        api.run(body)
            .await
            .map_err(|source| HostError::backend(plugin_name, source))
    }

    /// Asks an engine for a URL serving `request.path`.
    ///
    /// # Errors
    ///
    /// See [`perform_file_operation`].
    pub async fn get_file_url(&self, request: Value) -> Result<String, HostError> {
        self.file_operation(FileOperation::FileUrl, request).await
    }

    /// Asks an engine for the local path behind `request.url`.
    ///
    /// # Errors
    ///
    /// See [`perform_file_operation`].
    pub async fn get_file_path(&self, request: Value) -> Result<String, HostError> {
        self.file_operation(FileOperation::FilePath, request).await
    }

    /// Asks an engine for an upload URL.
    ///
    /// # Errors
    ///
    /// See [`perform_file_operation`].
    pub async fn request_upload_url(&self, request: Value) -> Result<String, HostError> {
        self.file_operation(FileOperation::UploadUrl, request).await
    }

    /// Runs a file operation on the engine named by `request.engine`, or on
    /// the caller's own engine.
    async fn file_operation(&self, operation: FileOperation, mut request: Value) -> Result<String, HostError> {
        let controller = self.controller()?;
        let caller = self.caller().ok();
        let named = request
            .as_object_mut()
            .and_then(|map| map.remove("engine"))
            .and_then(|engine| engine.as_str().map(str::to_owned));
        let engine: Option<Arc<dyn Engine>> = match named {
            Some(url) => controller.engines().get_engine_by_url(&url),
            None => caller
                .as_ref()
                .and_then(|instance| instance.binding().engine().cloned()),
        };
        match perform_file_operation(engine.as_ref(), operation, request).await {
            Ok(value) => {
                if let Some(instance) = &caller {
                    instance.push_log(format!("File operation {operation:?} succeeded: {value}"));
                }
                Ok(value)
            }
            Err(failure) => {
                let error = HostError::Engine(failure);
                controller
                    .messages()
                    .show_message(&error.user_message(), None);
                Err(error)
            }
        }
    }

    /// Stores a per-plugin setting; a falsy value deletes it.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::ReadonlyConfigField`] for `_field` names that
    /// shadow a config field, and storage failures.
    pub async fn set_config(&self, name: &str, value: Value) -> Result<(), HostError> {
        let caller = self.caller()?;
        if let Some(field) = readonly_field(&caller, name) {
            return Err(HostError::ReadonlyConfigField {
                field: field.to_owned(),
            });
        }
        let controller = self.controller()?;
        let key = config_key(caller.name(), name);
        let store = controller.config_store();
        if is_truthy(&value) {
            store.put(json!({"_id": key, "value": value})).await?;
        } else if let Err(error) = store.remove(&key).await {
            if !error.is_not_found() {
                return Err(error.into());
            }
        }
        Ok(())
    }

    /// Reads a per-plugin setting, or a config field for `_field` names.
    ///
    /// # Errors
    ///
    /// Returns storage failures other than a missing setting.
    pub async fn get_config(&self, name: &str) -> Result<Option<Value>, HostError> {
        let caller = self.caller()?;
        if let Some(field) = readonly_field(&caller, name) {
            let config = serde_json::to_value(caller.config()).unwrap_or_default();
            return Ok(config.get(field).cloned());
        }
        let key = config_key(caller.name(), name);
        match self.controller()?.config_store().get(&key).await {
            Ok(doc) => Ok(doc.get("value").cloned()),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Content of the attachment block named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::CallerUnavailable`] once the instance is gone.
    pub fn get_attachment(&self, name: &str) -> Result<Option<String>, HostError> {
        Ok(self
            .caller()?
            .config()
            .attachment(name)
            .map(str::to_owned))
    }

    /// Shows `text` on the user-facing message channel.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::CallerUnavailable`] once the host is gone.
    pub fn show_message(&self, text: &str, duration: Option<Duration>) -> Result<(), HostError> {
        self.controller()?.messages().show_message(text, duration);
        Ok(())
    }

    /// Logs on behalf of the caller.
    pub fn log(&self, message: &str) {
        match self.caller() {
            Ok(instance) => instance.push_log(message),
            Err(_) => info!(target: API_TARGET, "{message}"),
        }
    }

    /// Reports an error on behalf of the caller.
    pub fn error(&self, message: &str) {
        match self.caller() {
            Ok(instance) => instance.sandbox().error(instance.name(), message),
            Err(_) => warn!(target: API_TARGET, "{message}"),
        }
    }

    /// Reports progress on behalf of the caller.
    pub fn progress(&self, value: f64) {
        if let Ok(instance) = self.caller() {
            instance.sandbox().progress(instance.name(), value);
        }
    }
}

/// Storage key of a per-plugin setting.
#[must_use]
pub fn config_key(plugin: &str, name: &str) -> String {
    format!("config_{plugin}_{name}")
}

/// Config field shadowed by a `_field` setting name, if the config defines it.
fn readonly_field<'a>(instance: &PluginInstance, name: &'a str) -> Option<&'a str> {
    let field = name.strip_prefix('_')?;
    let config = serde_json::to_value(instance.config()).ok()?;
    config.get(field).is_some().then_some(field)
}

#[cfg(test)]
mod tests;
