//! JSON Schema compilation and the built-in plugin schemas.

use std::fmt;
use std::sync::Arc;

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::{Value, json};

/// A compiled JSON Schema together with its source document.
#[derive(Clone)]
pub struct CompiledSchema {
    schema: Value,
    compiled: Arc<JSONSchema>,
}

impl CompiledSchema {
    /// Compiles `schema`.
    ///
    /// # Errors
    ///
    /// Returns the compiler's message when `schema` is not a valid schema.
    pub fn compile(schema: Value) -> Result<Self, String> {
        let compiled = JSONSchema::compile(&schema).map_err(|error| error.to_string())?;
        Ok(Self {
            schema,
            compiled: Arc::new(compiled),
        })
    }

    /// Source document of the schema.
    #[must_use]
    pub const fn schema(&self) -> &Value {
        &self.schema
    }

    /// Validates `instance`, returning one message per violation.
    ///
    /// # Errors
    ///
    /// Returns every violation as `"<instance path>: <message>"`.
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<String>> {
        self.compiled.validate(instance).map_err(|errors| {
            errors
                .map(|error| format!("{}: {error}", error.instance_path))
                .collect()
        })
    }

    /// Returns `true` when `instance` satisfies the schema.
    #[must_use]
    pub fn is_valid(&self, instance: &Value) -> bool {
        self.compiled.is_valid(instance)
    }
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

const OPTIONAL_TEXT: [&str; 2] = ["string", "null"];
const SCHEMA_SLOT: [&str; 4] = ["object", "array", "string", "null"];

fn plugin_schema() -> Value {
    json!({
        "type": "object",
        "required": ["name"],
        "properties": {
            "name": {"type": "string", "minLength": 1},
            "type": {"type": "string"},
            "tags": {"type": ["array", "null"], "items": {"type": "string"}},
            "tag": {"type": OPTIONAL_TEXT},
            "version": {"type": OPTIONAL_TEXT},
            "api_version": {"type": OPTIONAL_TEXT},
            "description": {"type": OPTIONAL_TEXT},
            "ui": {"type": ["string", "array", "null"]},
            "icon": {"type": OPTIONAL_TEXT},
            "cover": {"type": ["string", "array", "null"]},
            "inputs": {"type": SCHEMA_SLOT},
            "outputs": {"type": SCHEMA_SLOT},
            "flags": {"type": ["array", "null"], "items": {"type": "string"}},
            "env": {"type": ["string", "array", "null"]},
            "requirements": {"type": ["array", "string", "null"]},
            "dependencies": {"type": ["array", "null"], "items": {"type": "string"}},
            "runnable": {"type": "boolean"},
            "lang": {"type": "string"}
        }
    })
}

fn descriptor_schema() -> Value {
    json!({
        "type": "object",
        "required": ["name"],
        "properties": {
            "name": {"type": "string", "minLength": 1},
            "type": {"type": OPTIONAL_TEXT},
            "ui": {"type": OPTIONAL_TEXT},
            "inputs": {"type": SCHEMA_SLOT},
            "outputs": {"type": SCHEMA_SLOT},
            "run": {"type": OPTIONAL_TEXT},
            "update": {"type": OPTIONAL_TEXT}
        }
    })
}

static PLUGIN_SCHEMA: Lazy<Result<CompiledSchema, String>> =
    Lazy::new(|| CompiledSchema::compile(plugin_schema()));

static DESCRIPTOR_SCHEMA: Lazy<Result<CompiledSchema, String>> =
    Lazy::new(|| CompiledSchema::compile(descriptor_schema()));

/// Validates a normalised plugin config document.
///
/// # Errors
///
/// Returns the list of violations.
pub fn validate_plugin_config(config: &Value) -> Result<(), Vec<String>> {
    match PLUGIN_SCHEMA.as_ref() {
        Ok(schema) => schema.validate(config),
        Err(message) => Err(vec![message.clone()]),
    }
}

/// Validates a capability descriptor after normalisation.
///
/// # Errors
///
/// Returns the list of violations.
pub fn validate_descriptor(descriptor: &Value) -> Result<(), Vec<String>> {
    match DESCRIPTOR_SCHEMA.as_ref() {
        Ok(schema) => schema.validate(descriptor),
        Err(message) => Err(vec![message.clone()]),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::minimal(json!({"name": "Demo"}), true)]
    #[case::missing_name(json!({"type": "window"}), false)]
    #[case::numeric_name(json!({"name": 3}), false)]
    #[case::bad_dependencies(json!({"name": "Demo", "dependencies": "A"}), false)]
    fn plugin_schema_checks_shape(#[case] config: Value, #[case] valid: bool) {
        assert_eq!(validate_plugin_config(&config).is_ok(), valid);
    }

    #[test]
    fn violations_carry_instance_paths() {
        let errors = validate_plugin_config(&json!({"name": "Demo", "runnable": "yes"}))
            .expect_err("runnable must be boolean");
        assert!(errors.iter().any(|e| e.starts_with("/runnable")));
    }

    #[test]
    fn compiled_schema_checks_instances() {
        let schema = CompiledSchema::compile(json!({
            "type": "object",
            "properties": {"size": {"type": "number"}},
            "required": ["size"]
        }))
        .expect("compile");
        assert!(schema.is_valid(&json!({"size": 3})));
        assert!(!schema.is_valid(&json!({})));
    }

    #[test]
    fn invalid_schema_fails_to_compile() {
        assert!(CompiledSchema::compile(json!({"type": 12})).is_err());
    }
}
