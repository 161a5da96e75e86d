//! Plugin repositories and their manifests.
//!
//! A repository is a named, URL-keyed source of plugins. Its manifest lists
//! the plugins it offers; [`RepositoryResolver`] keeps the persisted
//! repository list, fetches manifests on demand and maintains the
//! `available` projection of the currently selected repository.

mod github;
mod resolver;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HostError;
use crate::fetch::SourceFetcher;
use crate::ids::durable_key;

pub use self::github::{
    MANIFEST_FILE, ManifestLocation, github_raw_url, normalize_repository_url,
    resolve_manifest_url,
};
pub use self::resolver::{REPOSITORY_LIST_KEY, RepositoryResolver};

/// A named plugin repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Display name, unique within the list.
    pub name: String,
    /// Shorthand (`owner/repo`), hosting URL or literal manifest URL.
    pub url: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

impl Repository {
    /// Builds a repository entry.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            description: description.into(),
        }
    }

    /// Builds an entry whose name and description are the URL itself.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        Self::new(url, url, url)
    }
}

/// Repositories that are always present in the list.
#[must_use]
pub fn default_repositories() -> Vec<Repository> {
    vec![
        Repository::new(
            "ImJoy Repository",
            "oeway/ImJoy-Plugins",
            "The official plugin repository provided by ImJoy.io.",
        ),
        Repository::new(
            "ImJoy Demos",
            "oeway/ImJoy-Demo-Plugins",
            "A set of demo plugins provided by ImJoy.io",
        ),
    ]
}

/// A repository manifest after normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Repository display name.
    #[serde(default)]
    pub name: String,
    /// Repository description.
    #[serde(default)]
    pub description: String,
    /// Absolute URL plugin URIs are resolved against.
    #[serde(default)]
    pub uri_root: String,
    /// Enabled plugin entries.
    #[serde(default)]
    pub plugins: Vec<ManifestEntry>,
    /// Any further manifest fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A plugin listed by a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Plugin name.
    pub name: String,
    /// Absolute source URI.
    #[serde(default)]
    pub uri: String,
    /// `<repo-origin>:<plugin-name>`.
    #[serde(default)]
    pub origin: String,
    /// Durable storage key.
    #[serde(rename = "_id", default)]
    pub durable_id: String,
    /// Whether the plugin is installed in the current workspace.
    #[serde(default)]
    pub installed: bool,
    /// Tag of the installed variant, if any.
    #[serde(default)]
    pub tag: Option<String>,
    /// Remaining manifest fields (version, description, tags, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManifestEntry {
    /// Builds an entry with only a name and URI, as used in scoped lookups.
    #[must_use]
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        let entry_name = name.into();
        Self {
            durable_id: durable_key(&entry_name),
            name: entry_name,
            uri: uri.into(),
            origin: String::new(),
            installed: false,
            tag: None,
            extra: Map::new(),
        }
    }
}

/// JavaScript-style truthiness for loosely typed manifest flags.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Fetches and normalises the manifest of `url`, optionally at `tag`.
///
/// # Errors
///
/// Returns [`HostError::Fetch`] when the manifest cannot be downloaded and
/// [`HostError::Resolution`] when it does not list any plugins.
pub async fn fetch_manifest(
    fetcher: &dyn SourceFetcher,
    url: &str,
    tag: Option<&str>,
) -> Result<Manifest, HostError> {
    let location = resolve_manifest_url(url, tag);
    let raw = fetcher.fetch_json(&location.url).await?;
    normalise_manifest(raw, &location)
}

/// Applies manifest normalisation rules to a raw manifest document.
///
/// Disabled entries are dropped, a relative `uri_root` is resolved against
/// the manifest URL, and every entry receives an absolute `uri`, an `origin`
/// and a durable id.
///
/// # Errors
///
/// Returns [`HostError::Resolution`] when the document has no `plugins` list
/// or cannot be decoded.
pub fn normalise_manifest(raw: Value, location: &ManifestLocation) -> Result<Manifest, HostError> {
    let failed = || HostError::resolution(&location.url, format!("failed to load url: {}", location.url));
    let Value::Object(mut fields) = raw else {
        return Err(failed());
    };
    let Some(Value::Array(entries)) = fields.remove("plugins") else {
        return Err(failed());
    };
    let enabled: Vec<Value> = entries
        .into_iter()
        .filter(|entry| !entry.get("disabled").is_some_and(is_truthy))
        .collect();
    let mut manifest: Manifest =
        serde_json::from_value(Value::Object(fields)).map_err(|_| failed())?;

    if !manifest.uri_root.starts_with("http") {
        let trimmed = manifest.uri_root.trim_matches('/');
        manifest.uri_root = location
            .url
            .strip_suffix(MANIFEST_FILE)
            .map_or_else(|| location.url.clone(), |base| format!("{base}{trimmed}"));
    }

    manifest.plugins = enabled
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<ManifestEntry>(entry).ok())
        .map(|entry| normalise_entry(entry, &manifest.uri_root, &location.origin))
        .collect();
    Ok(manifest)
}

fn normalise_entry(mut entry: ManifestEntry, uri_root: &str, origin: &str) -> ManifestEntry {
    if entry.uri.is_empty() {
        entry.uri = format!("{}.imjoy.html", entry.name);
    }
    entry.origin = format!("{origin}:{}", entry.name);
    if !entry.uri.starts_with(uri_root) && !entry.uri.starts_with("http") {
        entry.uri = format!("{uri_root}/{}", entry.uri);
    }
    if entry.durable_id.is_empty() {
        entry.durable_id = durable_key(&entry.name);
    }
    entry
}
