//! Persisted repository list and the `available` projection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;
use tracing::{info, warn};

use super::{Manifest, ManifestEntry, Repository, default_repositories, fetch_manifest, normalize_repository_url};
use crate::error::HostError;
use crate::fetch::SourceFetcher;
use crate::messages::MessageSink;
use crate::store::KeyValueStore;

/// Key of the repository list document in the configuration store.
pub const REPOSITORY_LIST_KEY: &str = "repository_list";

const REPOSITORY_TARGET: &str = "joinery_host::repository";

#[derive(Debug, Default)]
struct RepositoryState {
    repositories: Vec<Repository>,
    available: Vec<ManifestEntry>,
    selected: Option<Repository>,
    installed_tags: HashMap<String, Option<String>>,
}

/// Maintains the ordered repository list and the selected repository's plugins.
pub struct RepositoryResolver {
    fetcher: Arc<dyn SourceFetcher>,
    config_store: Arc<dyn KeyValueStore>,
    messages: Arc<dyn MessageSink>,
    state: Mutex<RepositoryState>,
}

impl RepositoryResolver {
    /// Builds a resolver with an empty list.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        config_store: Arc<dyn KeyValueStore>,
        messages: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            fetcher,
            config_store,
            messages,
            state: Mutex::new(RepositoryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RepositoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current repository list.
    #[must_use]
    pub fn repositories(&self) -> Vec<Repository> {
        self.lock().repositories.clone()
    }

    /// Plugins offered by the selected repository.
    #[must_use]
    pub fn available(&self) -> Vec<ManifestEntry> {
        self.lock().available.clone()
    }

    /// Repository whose manifest backs [`Self::available`].
    #[must_use]
    pub fn selected(&self) -> Option<Repository> {
        self.lock().selected.clone()
    }

    /// Fetcher used for manifests.
    #[must_use]
    pub fn fetcher(&self) -> &dyn SourceFetcher {
        self.fetcher.as_ref()
    }

    /// Loads the persisted list, re-adding any default repository missing from it.
    ///
    /// When no list has been persisted the defaults are stored as-is. A
    /// default repository whose manifest cannot be fetched is logged and
    /// skipped; it does not abort initialisation.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Storage`] when the list can neither be read nor
    /// written.
    pub async fn load_repository_list(&self) -> Result<Vec<Repository>, HostError> {
        match self.config_store.get(REPOSITORY_LIST_KEY).await {
            Ok(doc) => {
                let stored: Vec<Repository> = doc
                    .get("list")
                    .cloned()
                    .and_then(|list| serde_json::from_value(list).ok())
                    .unwrap_or_default();
                self.lock().repositories = stored.clone();
                for default in default_repositories() {
                    let present = stored
                        .iter()
                        .any(|repo| repo.url == default.url && repo.name == default.name);
                    if present {
                        continue;
                    }
                    if let Err(error) = self.add_repository(default.clone()).await {
                        warn!(
                            target: REPOSITORY_TARGET,
                            repository = %default.name,
                            %error,
                            "failed to restore default repository"
                        );
                    }
                }
            }
            Err(error) => {
                if error.is_not_found() {
                    info!(target: REPOSITORY_TARGET, "no repository list stored, using defaults");
                } else {
                    warn!(target: REPOSITORY_TARGET, %error, "failed to read repository list");
                }
                self.lock().repositories = default_repositories();
                self.save_repository_list().await?;
            }
        }
        Ok(self.repositories())
    }

    /// Persists the current list.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Storage`] when the write fails.
    pub async fn save_repository_list(&self) -> Result<(), HostError> {
        let list = self.repositories();
        let doc = json!({ "_id": REPOSITORY_LIST_KEY, "list": list });
        if let Err(error) = self.config_store.put(doc).await {
            self.messages.show_message(
                &format!("Failed to save repository, database Error: {error}"),
                None,
            );
            return Err(error.into());
        }
        Ok(())
    }

    /// Fetches `repository`'s manifest and makes it the selected repository.
    ///
    /// Entries already installed in the workspace are marked with their tag.
    ///
    /// # Errors
    ///
    /// Returns the fetch or resolution error of the manifest.
    pub async fn reload_repository(&self, repository: &Repository) -> Result<Manifest, HostError> {
        let manifest = fetch_manifest(self.fetcher.as_ref(), &repository.url, None).await?;
        let mut state = self.lock();
        let available: Vec<ManifestEntry> = manifest
            .plugins
            .iter()
            .cloned()
            .map(|mut entry| {
                if let Some(tag) = state.installed_tags.get(&entry.name) {
                    entry.installed = true;
                    entry.tag.clone_from(tag);
                }
                entry
            })
            .collect();
        state.available = available;
        state.selected = Some(repository.clone());
        Ok(manifest)
    }

    /// Adds a repository after fetching its manifest.
    ///
    /// An existing entry with the same normalised URL is replaced and a name
    /// collision renames the new entry to its normalised URL.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Repository`] when the name or URL is empty or the
    /// manifest cannot be loaded, and [`HostError::Storage`] when the list
    /// cannot be saved.
    pub async fn add_repository(&self, mut repository: Repository) -> Result<Repository, HostError> {
        if repository.name.is_empty() || repository.url.is_empty() {
            return Err(HostError::repository("You need to provide name and url"));
        }
        let manifest = match self.reload_repository(&repository).await {
            Ok(manifest) => manifest,
            Err(error) => {
                warn!(target: REPOSITORY_TARGET, url = %repository.url, %error, "failed to load repository");
                let message = format!("Failed to load repository from: {}", repository.url);
                self.messages.show_message(&message, None);
                return Err(HostError::repository(message));
            }
        };

        if !manifest.name.is_empty() {
            repository.name.clone_from(&manifest.name);
        }
        if !manifest.description.is_empty() {
            repository.description.clone_from(&manifest.description);
        }
        let normalized = normalize_repository_url(&repository.url);

        let replaced = {
            let mut state = self.lock();
            let before = state.repositories.len();
            state
                .repositories
                .retain(|existing| normalize_repository_url(&existing.url) != normalized);
            let dropped = state.repositories.len() != before;
            if state.repositories.iter().any(|existing| existing.name == repository.name) {
                repository.name = normalized;
            }
            state.repositories.push(repository.clone());
            dropped
        };
        if replaced {
            self.messages
                .show_message("Repository with the same url already exists.", None);
        }
        self.save_repository_list().await?;
        Ok(repository)
    }

    /// Removes the entry matching `repository` by URL or by name.
    ///
    /// When several entries match, the last one is removed.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Repository`] when no entry matches or the name or
    /// URL is empty, and [`HostError::Storage`] when the list cannot be saved.
    pub async fn remove_repository(&self, repository: &Repository) -> Result<(), HostError> {
        if repository.name.is_empty() || repository.url.is_empty() {
            return Err(HostError::repository("You need to provide name and url"));
        }
        let removed = {
            let mut state = self.lock();
            let position = state
                .repositories
                .iter()
                .rposition(|existing| existing.url == repository.url || existing.name == repository.name);
            position.map(|index| state.repositories.remove(index))
        };
        if removed.is_none() {
            return Err(HostError::repository(format!(
                "Repository not found: {}",
                repository.name
            )));
        }
        if let Err(error) = self.save_repository_list().await {
            self.messages
                .show_message("Error occured when removing repository.", None);
            return Err(error);
        }
        self.messages.show_message("Repository has been deleted.", None);
        Ok(())
    }

    /// Records `name` as installed with `tag` and marks matching available entries.
    pub fn mark_installed(&self, name: &str, tag: Option<&str>) {
        let mut state = self.lock();
        state
            .installed_tags
            .insert(name.to_owned(), tag.map(str::to_owned));
        for entry in state.available.iter_mut().filter(|entry| entry.name == name) {
            entry.installed = true;
            entry.tag = tag.map(str::to_owned);
        }
    }

    /// Clears the installed mark for `name`.
    pub fn mark_removed(&self, name: &str) {
        let mut state = self.lock();
        state.installed_tags.remove(name);
        for entry in state.available.iter_mut().filter(|entry| entry.name == name) {
            entry.installed = false;
            entry.tag = None;
        }
    }

    /// Replaces the set of installed names, e.g. after a bulk reload.
    pub fn sync_installed<'a>(&self, installed: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) {
        let mut state = self.lock();
        state.installed_tags = installed
            .into_iter()
            .map(|(name, tag)| (name.to_owned(), tag.map(str::to_owned)))
            .collect();
        let RepositoryState {
            available,
            installed_tags,
            ..
        } = &mut *state;
        for entry in available.iter_mut() {
            match installed_tags.get(&entry.name) {
                Some(tag) => {
                    entry.installed = true;
                    entry.tag.clone_from(tag);
                }
                None => {
                    entry.installed = false;
                    entry.tag = None;
                }
            }
        }
    }
}
