//! Remote text retrieval for manifests and plugin sources.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const FETCH_TARGET: &str = "joinery_host::fetch";

/// Errors reported by [`SourceFetcher`] implementations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The remote answered with a non-success status.
    #[error("failed to fetch '{url}': HTTP {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The request could not be completed.
    #[error("failed to fetch '{url}': {message}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Transport failure description.
        message: String,
    },

    /// The remote returned an empty body.
    #[error("failed to get plugin code from {url}")]
    Empty {
        /// Requested URL.
        url: String,
    },

    /// The body was not valid JSON.
    #[error("failed to decode JSON from '{url}': {message}")]
    Decode {
        /// Requested URL.
        url: String,
        /// Parser failure description.
        message: String,
    },

    /// No such document is known to an offline fetcher.
    #[error("no document available at '{url}'")]
    NotFound {
        /// Requested URL.
        url: String,
    },
}

/// Retrieves remote documents by URL.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetches the body at `url` as text.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] when the document cannot be retrieved.
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;

    /// Fetches the body at `url` and decodes it as JSON.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] when the document cannot be retrieved or is
    /// not valid JSON.
    async fn fetch_json(&self, url: &str) -> Result<Value, FetchError> {
        let text = self.fetch_text(url).await?;
        serde_json::from_str(&text).map_err(|error| FetchError::Decode {
            url: url.to_owned(),
            message: error.to_string(),
        })
    }
}

/// Production fetcher backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds a fetcher whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Transport`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| FetchError::Transport {
                url: String::new(),
                message: error.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        debug!(target: FETCH_TARGET, %url, "fetching document");
        let transport = |error: reqwest::Error| FetchError::Transport {
            url: url.to_owned(),
            message: error.to_string(),
        };
        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(transport)
    }
}

/// Offline fetcher serving documents from memory.
///
/// Lookups first try the exact URL and then the URL without its query
/// string, so cache-busting parameters do not defeat the table. Every
/// requested URL is recorded.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    documents: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryFetcher {
    /// Creates an empty fetcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `body` for `url`.
    pub fn insert(&self, url: impl Into<String>, body: impl Into<String>) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), body.into());
    }

    /// URLs requested so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SourceFetcher for MemoryFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_owned());
        let documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        let without_query = url.split_once('?').map_or(url, |(base, _)| base);
        documents
            .get(url)
            .or_else(|| documents.get(without_query))
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                url: url.to_owned(),
            })
    }
}
