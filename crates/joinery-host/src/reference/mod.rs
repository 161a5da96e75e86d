//! Plugin reference resolution.
//!
//! A reference names a plugin in one of three ways:
//!
//! - `owner/repo[@tag]:Plugin Name[@variant]` looks the plugin up in that
//!   repository's manifest;
//! - `Plugin Name[@variant]` looks it up in the caller's scope, the plugin
//!   list of the manifest currently in use;
//! - anything that parses as a URL is fetched directly, with an optional
//!   `@variant` after the source suffix.
//!
//! The resolved URI must point at a plugin source file.

use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::error::HostError;
use crate::fetch::{FetchError, SourceFetcher};
use crate::ids::rand_id;
use crate::repository::{ManifestEntry, fetch_manifest, github_raw_url};

/// Suffix every plugin source URI must carry.
pub const PLUGIN_SUFFIX: &str = ".imjoy.html";

const RAW_CONTENT_HOSTS: [&str; 2] = [
    "https://raw.githubusercontent.com",
    "https://gist.githubusercontent.com",
];

const REFERENCE_TARGET: &str = "joinery_host::reference";

/// A parsed plugin reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginReference {
    /// A plugin inside a named repository's manifest.
    Scoped {
        /// Repository shorthand or URL.
        repository: String,
        /// Manifest revision.
        repository_tag: Option<String>,
        /// Plugin name inside the manifest.
        plugin: String,
        /// Requested config variant.
        tag: Option<String>,
    },
    /// A plugin looked up by name in the current scope.
    Named {
        /// Plugin name.
        name: String,
        /// Requested config variant.
        tag: Option<String>,
    },
    /// A direct source URI.
    Uri {
        /// Source URI.
        uri: String,
        /// Requested config variant.
        tag: Option<String>,
    },
}

fn split_tag(text: &str) -> (String, Option<String>) {
    match text.split_once('@') {
        Some((head, tag)) => (head.trim().to_owned(), Some(tag.trim().to_owned()).filter(|tag| !tag.is_empty())),
        None => (text.trim().to_owned(), None),
    }
}

fn is_url(text: &str) -> bool {
    Url::parse(text).is_ok_and(|url| matches!(url.scheme(), "http" | "https" | "ftp"))
}

impl FromStr for PluginReference {
    type Err = HostError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let trimmed = text.trim();
        let reference = if trimmed.contains("github") && trimmed.contains("/blob/") {
            github_raw_url(trimmed).unwrap_or_else(|| trimmed.to_owned())
        } else {
            trimmed.to_owned()
        };

        if !reference.starts_with("http") && reference.contains('/') && reference.contains(':') {
            let (repository_part, plugin_part) = reference.split_once(':').unwrap_or((reference.as_str(), ""));
            let (repository, repository_tag) = split_tag(repository_part);
            let (plugin, tag) = split_tag(plugin_part);
            if repository.is_empty() || plugin.is_empty() {
                return Err(HostError::resolution(
                    &reference,
                    "Wrong URI format, it must be \"REPO_NAME:PLUGIN_NAME\"",
                ));
            }
            return Ok(Self::Scoped {
                repository,
                repository_tag,
                plugin,
                tag,
            });
        }

        if !is_url(&reference) {
            let (name, tag) = split_tag(&reference);
            return Ok(Self::Named { name, tag });
        }

        let marker = format!("{PLUGIN_SUFFIX}@");
        let (uri, tag) = match reference.split_once(&marker) {
            Some((head, tag)) => (
                format!("{head}{PLUGIN_SUFFIX}"),
                Some(tag.to_owned()).filter(|suffix| !suffix.is_empty()),
            ),
            None => (reference, None),
        };
        Ok(Self::Uri { uri, tag })
    }
}

/// Source text fetched for a reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    /// Plugin source.
    pub code: String,
    /// URI the source was fetched from, without any cache-busting query.
    pub uri: String,
    /// Config variant requested by the reference.
    pub tag: Option<String>,
    /// Plugin list dependencies of this plugin are resolved against.
    pub scope: Vec<ManifestEntry>,
}

/// Maps plugin references to their source text.
#[derive(Clone)]
pub struct ReferenceResolver {
    fetcher: Arc<dyn SourceFetcher>,
}

impl std::fmt::Debug for ReferenceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceResolver").finish_non_exhaustive()
    }
}

impl ReferenceResolver {
    /// Creates a resolver fetching through `fetcher`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self { fetcher }
    }

    /// Resolves `reference` against `scope` and fetches the source.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Resolution`] when the plugin cannot be found or
    /// the URI is not a plugin source, and [`HostError::Fetch`] when the
    /// source cannot be downloaded or is empty.
    pub async fn resolve(&self, reference: &str, scope: &[ManifestEntry]) -> Result<ResolvedSource, HostError> {
        let parsed: PluginReference = reference.parse()?;
        let (uri, tag, dependency_scope) = match parsed {
            PluginReference::Scoped {
                repository,
                repository_tag,
                plugin,
                tag,
            } => {
                let manifest =
                    fetch_manifest(self.fetcher.as_ref(), &repository, repository_tag.as_deref()).await?;
                let entry = manifest
                    .plugins
                    .iter()
                    .find(|entry| entry.name == plugin)
                    .ok_or_else(|| {
                        HostError::resolution(reference, format!("plugin not found {repository}:{plugin}"))
                    })?;
                (entry.uri.clone(), tag, manifest.plugins.clone())
            }
            PluginReference::Named { name, tag } => {
                let entry = scope
                    .iter()
                    .find(|entry| !name.is_empty() && entry.name == name)
                    .ok_or_else(|| {
                        HostError::resolution(
                            reference,
                            format!("Plugin \"{name}\" cannot be found in the repository."),
                        )
                    })?;
                (entry.uri.clone(), tag, scope.to_vec())
            }
            PluginReference::Uri { uri, tag } => (uri, tag, scope.to_vec()),
        };

        let path = uri.split('?').next().unwrap_or_default();
        if !path.ends_with(PLUGIN_SUFFIX) {
            return Err(HostError::resolution(
                reference,
                format!("Plugin url must be ends with \"{PLUGIN_SUFFIX}\""),
            ));
        }
        let fetch_url = cache_busted(&uri);
        debug!(target: REFERENCE_TARGET, %reference, uri = %fetch_url, "fetching plugin source");
        let code = self.fetcher.fetch_text(&fetch_url).await?;
        if code.trim().is_empty() {
            return Err(FetchError::Empty { url: uri }.into());
        }
        Ok(ResolvedSource {
            code,
            uri,
            tag,
            scope: dependency_scope,
        })
    }
}

/// Adds a random query to raw-content URLs that carry none.
#[must_use]
pub fn cache_busted(uri: &str) -> String {
    let raw = RAW_CONTENT_HOSTS.iter().any(|host| uri.starts_with(host));
    if raw && !uri.contains('?') {
        format!("{uri}?{}", rand_id())
    } else {
        uri.to_owned()
    }
}

#[cfg(test)]
mod tests;
