//! Capability descriptors and their normalisation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::HostError;
use crate::parser::PluginConfig;
use crate::repository::is_truthy;
use crate::schema::validate_descriptor;

/// An operation a plugin offers to the workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Operation name; defaults to the plugin name.
    #[serde(default)]
    pub name: String,
    /// Execution kind of the serving plugin.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// UI description as a string, a list of lines or a list of mappings.
    #[serde(default)]
    pub ui: Value,
    /// Input schema.
    #[serde(default)]
    pub inputs: Option<Value>,
    /// Output schema.
    #[serde(default)]
    pub outputs: Option<Value>,
    /// Whether the operation panel opens on registration.
    #[serde(default)]
    pub show_panel: bool,
    /// Exported function invoked instead of `run`.
    #[serde(default)]
    pub run: Option<String>,
    /// Exported function invoked instead of `update`.
    #[serde(default)]
    pub update: Option<String>,
    /// Further descriptor fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OperationDescriptor {
    /// Descriptor with only a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The self-named descriptor derived from a plugin's own config.
    #[must_use]
    pub fn for_plugin(config: &PluginConfig) -> Self {
        Self {
            name: config.name.clone(),
            kind: Some(config.kind.clone()),
            ui: config.ui.clone().unwrap_or(Value::Null),
            inputs: config.inputs.clone(),
            outputs: config.outputs.clone(),
            ..Self::default()
        }
    }
}

/// A descriptor after defaults, UI flattening and validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct NormalizedDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub ui: String,
    pub inputs: Option<Value>,
    pub outputs: Option<Value>,
    pub show_panel: bool,
    pub run: Option<String>,
    pub update: Option<String>,
}

impl NormalizedDescriptor {
    /// Applies registration defaults for a descriptor published by `plugin`.
    pub(crate) fn new(descriptor: OperationDescriptor, plugin: &PluginConfig) -> Result<Self, HostError> {
        let name = if descriptor.name.is_empty() {
            plugin.name.clone()
        } else {
            descriptor.name
        };
        let label = name.clone();
        let invalid = |message: String| HostError::InvalidDescriptor {
            name: label.clone(),
            message,
        };
        let mut ui = normalize_ui(&descriptor.ui).map_err(invalid)?;
        if name == plugin.name && ui.is_empty() {
            ui = plugin.description.clone().unwrap_or_default();
        }
        let normalized = Self {
            name,
            kind: descriptor.kind,
            ui,
            inputs: descriptor.inputs.filter(is_truthy),
            outputs: descriptor.outputs.filter(is_truthy),
            show_panel: descriptor.show_panel,
            run: descriptor.run,
            update: descriptor.update,
        };
        let document = serde_json::to_value(&normalized)
            .map_err(|error| invalid(error.to_string()))?;
        validate_descriptor(&document).map_err(|errors| invalid(errors.join("; ")))?;
        Ok(normalized)
    }
}

/// Flattens a UI description into a display string.
///
/// # Errors
///
/// Returns a message when `ui` is a mapping.
pub fn normalize_ui(ui: &Value) -> Result<String, String> {
    if !is_truthy(ui) {
        return Ok(String::new());
    }
    match ui {
        Value::Array(items) => Ok(items.iter().map(ui_line).collect()),
        Value::Object(_) => Err("ui can not be an object, you can only use a string or an array.".to_owned()),
        Value::String(text) => Ok(text.trim().to_owned()),
        _ => Ok(String::new()),
    }
}

fn ui_line(item: &Value) -> String {
    match item {
        Value::String(text) => format!("{text}<br>"),
        Value::Object(entries) => entries
            .iter()
            .map(|(key, value)| match value {
                Value::String(text) => format!("{key}: {text}<br>"),
                other => format!("{key}: {other}<br>"),
            })
            .collect(),
        other => format!("{other}<br>"),
    }
}

/// Wraps a bare property map as an object schema and marks every property required.
///
/// Array schemas with `items` are accepted as-is when `allow_array` is set.
///
/// # Errors
///
/// Returns a message when `schema` is neither a schema nor a property map.
pub fn wrap_schema(schema: Value, allow_array: bool) -> Result<Value, String> {
    let kind = schema.get("type").and_then(Value::as_str);
    let object_schema = kind == Some("object") && schema.get("properties").is_some();
    let array_schema = allow_array && kind == Some("array") && schema.get("items").is_some();
    let mut wrapped = if object_schema || array_schema {
        schema
    } else if schema.is_object() {
        json!({"type": "object", "properties": schema})
    } else {
        return Err("inputs schema must be an object.".to_owned());
    };

    if let Value::Object(map) = &mut wrapped {
        let is_object = map.get("type").and_then(Value::as_str) == Some("object");
        let property_names: Option<Vec<Value>> = map
            .get("properties")
            .and_then(Value::as_object)
            .map(|properties| properties.keys().cloned().map(Value::String).collect());
        if let (true, Some(required), false) = (is_object, property_names, map.contains_key("required")) {
            map.insert("required".into(), Value::Array(required));
        }
    }
    Ok(wrapped)
}
