//! Rebuilding an empty registry from the published catalog.
//!
//! When the local registry is empty or unreadable, the authoritative list of
//! published items is fetched and turned back into `done` entries. Public
//! titles are decorated ("Dune by Frank Herbert | Full Summary"), so the
//! work item is recovered with a fixed rule:
//!
//! 1. drop trailing `| ...`, `[...]` and `(...)` decorations
//! 2. split on the last ` by ` into title and author
//! 3. strip surrounding quotes from both parts
//!
//! Any failure of the source degrades to an empty registry with a warning.

use super::{DuplicateRegistry, RegistryEntry, WorkItem};
use crate::config::{resolve, SyncSourceConfig};
use crate::errors::{ClipflowError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

/// One published item as listed by the authoritative source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedItem {
    /// External id of the published output.
    pub external_ref: String,
    /// Public title.
    pub public_title: String,
}

impl PublishedItem {
    /// Creates a published item.
    #[must_use]
    pub fn new(external_ref: impl Into<String>, public_title: impl Into<String>) -> Self {
        Self {
            external_ref: external_ref.into(),
            public_title: public_title.into(),
        }
    }
}

/// Authoritative list of published items.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Fetches every published item.
    async fn fetch_published(&self) -> Result<Vec<PublishedItem>>;
}

fn decoration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // `|` starts a decoration anywhere; brackets only at the end.
        Regex::new(r"\s*(?:\|.*|\[[^\]]*\]|\([^)]*\))\s*$").expect("decoration pattern is valid")
    })
}

fn strip_quotes(value: &str) -> &str {
    const QUOTES: &[char] = &['"', '\'', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}'];
    value.trim().trim_matches(QUOTES).trim()
}

/// Recovers the work item from a public title.
///
/// Returns `None` when nothing usable is left of the title.
#[must_use]
pub fn extract_work_item(public_title: &str) -> Option<WorkItem> {
    let mut rest = public_title.trim().to_string();
    loop {
        let stripped = decoration_pattern().replace(&rest, "").into_owned();
        if stripped == rest {
            break;
        }
        rest = stripped;
    }

    // ASCII lowercasing keeps byte offsets aligned with `rest`.
    let lowered = rest.to_ascii_lowercase();
    let (title, author) = match lowered.rfind(" by ") {
        Some(index) => (&rest[..index], Some(&rest[index + 4..])),
        None => (rest.as_str(), None),
    };

    let title = strip_quotes(title);
    if title.is_empty() {
        return None;
    }
    let author = author.map(strip_quotes).filter(|a| !a.is_empty());
    Some(WorkItem::new(title, author))
}

/// Reads published items from a JSON file (an array of [`PublishedItem`]).
#[derive(Debug, Clone)]
pub struct FileCatalogSource {
    path: PathBuf,
}

impl FileCatalogSource {
    /// Creates a file source.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RegistrySource for FileCatalogSource {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn fetch_published(&self) -> Result<Vec<PublishedItem>> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| ClipflowError::Sync(format!("{}: {e}", self.path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ClipflowError::Sync(format!("{}: {e}", self.path.display())))
    }
}

/// Fetches published items from an HTTP endpoint returning the same JSON.
#[cfg(feature = "remote-sync")]
#[derive(Debug, Clone)]
pub struct HttpCatalogSource {
    client: reqwest::Client,
    url: String,
}

#[cfg(feature = "remote-sync")]
impl HttpCatalogSource {
    /// Creates an HTTP source with a request timeout.
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClipflowError::Sync(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[cfg(feature = "remote-sync")]
#[async_trait]
impl RegistrySource for HttpCatalogSource {
    fn describe(&self) -> String {
        format!("http {}", self.url)
    }

    async fn fetch_published(&self) -> Result<Vec<PublishedItem>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ClipflowError::Sync(format!("{}: {e}", self.url)))?;
        response
            .json::<Vec<PublishedItem>>()
            .await
            .map_err(|e| ClipflowError::Sync(format!("{}: {e}", self.url)))
    }
}

/// Builds the configured source, resolving file paths against `root`.
pub fn source_from_config(config: &SyncSourceConfig, root: &Path) -> Result<Box<dyn RegistrySource>> {
    match config {
        SyncSourceConfig::File { path } => Ok(Box::new(FileCatalogSource::new(resolve(root, path)))),
        #[cfg(feature = "remote-sync")]
        SyncSourceConfig::Http {
            url,
            timeout_seconds,
        } => Ok(Box::new(HttpCatalogSource::new(
            url.clone(),
            std::time::Duration::from_secs(*timeout_seconds),
        )?)),
        #[cfg(not(feature = "remote-sync"))]
        SyncSourceConfig::Http { .. } => Err(crate::config::ConfigError::Invalid(
            "http sync requires the `remote-sync` feature".into(),
        )
        .into()),
    }
}

/// Rebuilds `registry` from `source` if it is empty or unreadable.
///
/// Returns the number of entries added. Never fails: source errors leave the
/// registry empty.
pub async fn rebuild_if_empty(registry: &mut DuplicateRegistry, source: &dyn RegistrySource) -> usize {
    if !(registry.is_empty() || registry.is_unreadable()) {
        return 0;
    }

    let published = match source.fetch_published().await {
        Ok(items) => items,
        Err(e) => {
            warn!(source = %source.describe(), error = %e, "Registry sync failed; continuing with an empty registry");
            return 0;
        }
    };

    let entries: Vec<RegistryEntry> = published
        .iter()
        .filter_map(|p| match extract_work_item(&p.public_title) {
            Some(_) if p.external_ref.trim().is_empty() => {
                warn!(title = %p.public_title, "Skipping published item with a blank external ref");
                None
            }
            Some(item) => Some(RegistryEntry::published(&item, p.external_ref.trim())),
            None => {
                warn!(title = %p.public_title, "Skipping published item with no recoverable title");
                None
            }
        })
        .collect();

    match registry.import(entries) {
        Ok(added) => {
            info!(source = %source.describe(), added, "Rebuilt registry from published catalog");
            added
        }
        Err(e) => {
            warn!(error = %e, "Failed to persist rebuilt registry");
            0
        }
    }
}
