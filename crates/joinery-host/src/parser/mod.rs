//! Plugin source parsing.
//!
//! A plugin source carries a `<config>` block (JSON or YAML) and one or more
//! `<script>` blocks, each optionally tagged with a variant name. Parsing
//! resolves the variant tag, collapses tag-keyed configuration fields,
//! selects the matching script, applies the legacy API upgrade and validates
//! the result against the plugin schema.
//!
//! # Example
//!
//! ```
//! use joinery_host::parser::{ParseOverrides, parse_plugin_source};
//!
//! let source = r#"<config lang="json">{"name": "Demo", "type": "web-worker", "tags": ["fast"]}</config>
//! <script lang="javascript">api.export({});</script>"#;
//! let config = parse_plugin_source(source, &ParseOverrides::default()).expect("valid source");
//! assert_eq!(config.name, "Demo");
//! assert_eq!(config.tag.as_deref(), Some("fast"));
//! ```

mod blocks;
mod version;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::backend::PluginKind;
use crate::ids::{durable_key, instance_id};
use crate::schema::validate_plugin_config;

pub use self::blocks::Block;
pub use self::version::compare_versions;

const PARSER_TARGET: &str = "joinery_host::parser";

/// Fields that may hold a tag-keyed map of variants.
pub const CONFIGURABLE_FIELDS: [&str; 8] = [
    "env",
    "requirements",
    "dependencies",
    "icon",
    "ui",
    "type",
    "flags",
    "cover",
];

const DEFAULT_LANG: &str = "javascript";
const LEGACY_UPGRADE_BELOW: &str = "0.1.2";
const LANG_ATTRIBUTE_REQUIRED_ABOVE: &str = "0.1.5";

/// Errors raised while parsing a plugin source.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The source has no `<config>` block.
    #[error("no <config> block found in plugin source")]
    MissingConfig,

    /// The `<config>` block has no usable `lang` for its API version.
    #[error("Unsupported config language {lang}, please set lang=\"json\" or lang=\"yaml\"")]
    UnsupportedLanguage {
        /// Declared language, empty when absent.
        lang: String,
    },

    /// The YAML config block is malformed.
    #[error("invalid YAML in <config> block: {message}")]
    Yaml {
        /// Parser message.
        message: String,
    },

    /// The JSON config block is malformed or does not fit the config type.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The config block is not a mapping.
    #[error("the <config> block must contain a mapping")]
    NotAMapping,

    /// A tag-keyed field was found but no tag could be resolved.
    #[error("You must use 'tags' with configurable fields.")]
    MissingTag {
        /// Field holding the variant map.
        field: String,
    },

    /// The normalised config failed schema validation.
    #[error("Invalid plugin config: {name}: {}", errors.join("; "))]
    Schema {
        /// Plugin name, if any.
        name: String,
        /// One entry per violation.
        errors: Vec<String>,
    },
}

/// Values applied on top of the parsed config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseOverrides {
    /// Variant tag to select instead of the first declared tag.
    pub tag: Option<String>,
    /// Origin reference the source was resolved from.
    pub origin: Option<String>,
    /// Source URI.
    pub uri: Option<String>,
    /// Durable storage key.
    #[serde(rename = "_id")]
    pub durable_id: Option<String>,
    /// Engine affinity (`auto` or an engine id).
    pub engine_mode: Option<String>,
    /// Content hash of a stored record.
    pub hash: Option<String>,
}

/// A normalised plugin configuration.
///
/// Produced fresh by every parse; `id` is a new runtime identifier each time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugin name.
    pub name: String,
    /// Execution kind as declared (`window`, `web-worker`, ...).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Declared variant tags.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
    /// Resolved variant tag.
    #[serde(default)]
    pub tag: Option<String>,
    /// Plugin version.
    #[serde(default)]
    pub version: Option<String>,
    /// Host API version the plugin targets.
    #[serde(default)]
    pub api_version: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Plugin references to install before this plugin.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub dependencies: Vec<String>,
    /// Runtime requirements; shape depends on the kind.
    #[serde(default = "empty_requirements")]
    pub requirements: Value,
    /// Input schema.
    #[serde(default)]
    pub inputs: Option<Value>,
    /// Output schema.
    #[serde(default)]
    pub outputs: Option<Value>,
    /// UI description.
    #[serde(default)]
    pub ui: Option<Value>,
    /// Declared environment (e.g. a conda environment file).
    #[serde(default)]
    pub env: Option<Value>,
    /// Icon.
    #[serde(default)]
    pub icon: Option<Value>,
    /// Cover images.
    #[serde(default)]
    pub cover: Option<Value>,
    /// Behaviour flags.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub flags: Vec<String>,
    /// File extensions handled by the plugin.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub extensions: Vec<String>,
    /// Default window config used by window kinds.
    #[serde(default)]
    pub defaults: Option<Value>,
    /// Whether the plugin exposes a runnable entry point.
    #[serde(default = "default_runnable")]
    pub runnable: bool,
    /// Whether a suspended instance should be resumed instead of set up.
    #[serde(default)]
    pub resumed: bool,
    /// Script language.
    #[serde(default)]
    pub lang: String,
    /// Selected script body.
    #[serde(default)]
    pub script: String,
    /// Every script block in source order.
    #[serde(default)]
    pub scripts: Vec<Block>,
    /// `<link>` blocks.
    #[serde(default)]
    pub links: Vec<Block>,
    /// `<window>` blocks.
    #[serde(default)]
    pub windows: Vec<Block>,
    /// `<style>` blocks.
    #[serde(default)]
    pub styles: Vec<Block>,
    /// `<docs>` blocks.
    #[serde(default)]
    pub docs: Vec<Block>,
    /// `<attachment>` blocks.
    #[serde(default)]
    pub attachments: Vec<Block>,
    /// Full source text.
    #[serde(default)]
    pub code: String,
    /// Content hash of the stored record, if known.
    #[serde(default)]
    pub hash: Option<String>,
    /// Durable storage key.
    #[serde(rename = "_id", default)]
    pub durable_id: String,
    /// Runtime instance id.
    #[serde(default)]
    pub id: String,
    /// Reference the source was resolved from.
    #[serde(default)]
    pub origin: Option<String>,
    /// Source URI.
    #[serde(default)]
    pub uri: Option<String>,
    /// Engine affinity.
    #[serde(default)]
    pub engine_mode: Option<String>,
    /// Any further config fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn empty_requirements() -> Value {
    Value::Array(Vec::new())
}

/// Reads an optional list, treating an explicit `null` as empty.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

const fn default_runnable() -> bool {
    true
}

impl PluginConfig {
    /// Parses the declared kind, if it names a known execution kind.
    #[must_use]
    pub fn plugin_kind(&self) -> Option<PluginKind> {
        self.kind.parse().ok()
    }

    /// Returns `true` when the plugin declares `flag`.
    #[must_use]
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|declared| declared == flag)
    }

    /// Returns the attachment named `name`.
    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<&str> {
        self.attachments
            .iter()
            .find(|block| block.attr("name") == Some(name))
            .map(|block| block.content.as_str())
    }
}

/// Parses `code` into a normalised [`PluginConfig`].
///
/// # Errors
///
/// Returns a [`ParseError`] when the source has no config block, the config
/// cannot be decoded, a tag-keyed field has no resolvable tag, or the result
/// fails schema validation.
pub fn parse_plugin_source(code: &str, overrides: &ParseOverrides) -> Result<PluginConfig, ParseError> {
    let components = blocks::parse_components(code);
    let config_block = components.config.first().ok_or(ParseError::MissingConfig)?;
    let mut fields = decode_config_block(config_block)?;
    stringify_number(&mut fields, "version");
    stringify_number(&mut fields, "api_version");

    let tag = overrides.tag.clone().filter(|tag| !tag.is_empty()).or_else(|| {
        fields
            .get("tags")
            .and_then(Value::as_array)
            .and_then(|tags| tags.first())
            .and_then(Value::as_str)
            .map(str::to_owned)
    });

    if !fields.contains_key("script") {
        if let Some(first) = components.script.first() {
            fields.insert("script".into(), Value::String(first.content.clone()));
            if let Some(lang) = first.attr("lang") {
                fields.insert("lang".into(), Value::String(lang.to_owned()));
            }
        }
    }
    if let Some(tagged) = components
        .script
        .iter()
        .find(|block| tag.is_some() && block.attr("tag") == tag.as_deref())
    {
        fields.insert("script".into(), Value::String(tagged.content.clone()));
    }

    select_variants(&mut fields, tag.as_deref())?;

    let name = fields
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let durable_id = overrides.durable_id.clone().unwrap_or_else(|| durable_key(&name));
    fields.insert("tag".into(), tag.map_or(Value::Null, Value::String));
    fields.insert("_id".into(), Value::String(durable_id));
    fields.insert("id".into(), Value::String(instance_id(&name)));
    fields.insert("code".into(), Value::String(code.to_owned()));
    insert_optional(&mut fields, "uri", overrides.uri.as_ref());
    insert_optional(&mut fields, "origin", overrides.origin.as_ref());
    insert_optional(&mut fields, "engine_mode", overrides.engine_mode.as_ref());
    insert_optional(&mut fields, "hash", overrides.hash.as_ref());
    let runnable = !matches!(fields.get("runnable"), Some(Value::Bool(false)));
    fields.insert("runnable".into(), Value::Bool(runnable));
    if fields.get("requirements").is_none_or(Value::is_null) {
        fields.insert("requirements".into(), empty_requirements());
    }
    if fields.get("lang").and_then(Value::as_str).is_none_or(str::is_empty) {
        fields.insert("lang".into(), Value::String(DEFAULT_LANG.to_owned()));
    }

    upgrade_legacy_api(&mut fields);

    let document = Value::Object(fields);
    validate_plugin_config(&document).map_err(|errors| ParseError::Schema {
        name: name.clone(),
        errors,
    })?;

    let mut config: PluginConfig = serde_json::from_value(document)?;
    config.scripts = components.script;
    config.links = components.link;
    config.windows = components.window;
    config.styles = components.style;
    config.docs = components.docs;
    config.attachments = components.attachment;
    Ok(config)
}

/// Content of the first `<docs>` block of `code`.
#[must_use]
pub fn first_docs(code: &str) -> Option<String> {
    blocks::parse_components(code)
        .docs
        .into_iter()
        .next()
        .map(|block| block.content)
}

fn decode_config_block(block: &Block) -> Result<Map<String, Value>, ParseError> {
    let lang = block.attr("lang");
    let decoded: Value = match lang {
        Some("yaml") => serde_saphyr::from_str(&block.content).map_err(|error| ParseError::Yaml {
            message: error.to_string(),
        })?,
        Some("json") => serde_json::from_str(&block.content)?,
        other => {
            let decoded: Value = serde_json::from_str(&block.content)?;
            let api_version = decoded.get("api_version").map(version_text).unwrap_or_default();
            if compare_versions(&api_version, LANG_ATTRIBUTE_REQUIRED_ABOVE).is_gt() {
                return Err(ParseError::UnsupportedLanguage {
                    lang: other.unwrap_or_default().to_owned(),
                });
            }
            decoded
        }
    };
    match decoded {
        Value::Object(fields) => Ok(fields),
        _ => Err(ParseError::NotAMapping),
    }
}

fn version_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    }
}

fn stringify_number(fields: &mut Map<String, Value>, key: &str) {
    if let Some(value) = fields.get_mut(key) {
        if value.is_number() {
            *value = Value::String(version_text(value));
        }
    }
}

fn insert_optional(fields: &mut Map<String, Value>, key: &str, value: Option<&String>) {
    if let Some(text) = value {
        fields.insert(key.to_owned(), Value::String(text.clone()));
    }
}

/// Replaces every tag-keyed configurable field with its variant for `tag`.
fn select_variants(fields: &mut Map<String, Value>, tag: Option<&str>) -> Result<(), ParseError> {
    for field in CONFIGURABLE_FIELDS {
        let Some(Value::Object(variants)) = fields.get(field) else {
            continue;
        };
        let Some(selected_tag) = tag else {
            return Err(ParseError::MissingTag {
                field: field.to_owned(),
            });
        };
        match variants.get(selected_tag).cloned() {
            Some(selected) => {
                fields.insert(field.to_owned(), selected);
            }
            None => {
                warn!(
                    target: PARSER_TARGET,
                    field,
                    tag = selected_tag,
                    "configurable field does not contain the selected tag"
                );
                fields.remove(field);
            }
        }
    }
    Ok(())
}

/// Renames the execution kinds used before API 0.1.2.
fn upgrade_legacy_api(fields: &mut Map<String, Value>) {
    let api_version = fields.get("api_version").map(version_text).unwrap_or_default();
    if !compare_versions(&api_version, LEGACY_UPGRADE_BELOW).is_lt() {
        return;
    }
    let Some(Value::String(kind)) = fields.get_mut("type") else {
        return;
    };
    let renamed = match kind.as_str() {
        "python" => "native-python",
        "webworker" => "web-worker",
        "webpython" => "web-python",
        _ => return,
    };
    *kind = renamed.to_owned();
}
