//! Batch-level duplicate registry.
//!
//! One JSON document (`registry.json`) records every work item that has
//! started or finished production. Matching is case-insensitive on the
//! normalized title; authors are compared only when both sides have one.
//!
//! The registry is read-check-then-write without locking. Two processes
//! sharing it can both decide to produce the same item; the document
//! converges on the last writer.

pub mod sync;

use crate::artifacts::MANIFEST_FILE;
use crate::errors::{ClipflowError, Result};
use crate::utils::{iso_timestamp, read_json_lenient, write_json_atomic};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lowercase, trimmed, internal whitespace collapsed.
#[must_use]
pub fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn authors_match(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// A unit of batch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Title as given.
    pub title: String,
    /// Author as given, if any.
    #[serde(default)]
    pub author: Option<String>,
}

impl WorkItem {
    /// Creates a work item. A blank author counts as no author.
    #[must_use]
    pub fn new(title: impl Into<String>, author: Option<&str>) -> Self {
        Self {
            title: title.into(),
            author: author
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string),
        }
    }

    /// Normalized title key.
    #[must_use]
    pub fn key_title(&self) -> String {
        normalize(&self.title)
    }

    /// Normalized author key.
    #[must_use]
    pub fn key_author(&self) -> Option<String> {
        self.author.as_deref().map(normalize)
    }

    /// Returns true if `entry` refers to this item.
    #[must_use]
    pub fn matches(&self, entry: &RegistryEntry) -> bool {
        entry.key_title == self.key_title()
            && authors_match(self.key_author().as_deref(), entry.key_author.as_deref())
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.author {
            Some(author) => write!(f, "{} by {author}", self.title),
            None => write!(f, "{}", self.title),
        }
    }
}

/// Production status of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStatus {
    /// Work started; the run may be resumable.
    Processing,
    /// Published; `external_refs` is non-empty.
    Done,
}

/// One produced or in-progress work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Normalized title.
    pub key_title: String,
    /// Normalized author.
    #[serde(default)]
    pub key_author: Option<String>,
    /// Status.
    pub status: RegistryStatus,
    /// Published ids.
    #[serde(default)]
    pub external_refs: Vec<String>,
    /// Run directory of the producing run.
    #[serde(default)]
    pub run_folder: Option<PathBuf>,
    /// Creation time (ISO 8601).
    pub created_at: String,
    /// Last update time (ISO 8601).
    pub updated_at: String,
}

impl RegistryEntry {
    fn new(item: &WorkItem, status: RegistryStatus) -> Self {
        let now = iso_timestamp();
        Self {
            key_title: item.key_title(),
            key_author: item.key_author(),
            status,
            external_refs: Vec::new(),
            run_folder: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Creates a done entry, as rebuilt from a published catalog.
    #[must_use]
    pub fn published(item: &WorkItem, external_ref: impl Into<String>) -> Self {
        let mut entry = Self::new(item, RegistryStatus::Done);
        entry.external_refs.push(external_ref.into());
        entry
    }

    /// Returns true if the entry is done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == RegistryStatus::Done
    }

    /// Returns true if both entries name the same item with the same keys.
    fn same_key(&self, other: &Self) -> bool {
        self.key_title == other.key_title && self.key_author == other.key_author
    }
}

/// On-disk shape of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDocument {
    /// All entries.
    #[serde(default)]
    pub entries: Vec<RegistryEntry>,
}

/// The file-backed duplicate registry.
#[derive(Debug, Clone)]
pub struct DuplicateRegistry {
    path: PathBuf,
    document: RegistryDocument,
    unreadable: bool,
}

impl DuplicateRegistry {
    /// Opens the registry at `path`. A missing or malformed file opens empty.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (document, unreadable) = Self::read(&path);
        Self {
            path,
            document,
            unreadable,
        }
    }

    fn read(path: &Path) -> (RegistryDocument, bool) {
        match read_json_lenient::<RegistryDocument>(path) {
            Some(document) => {
                debug!(path = %path.display(), entries = document.entries.len(), "Loaded registry");
                (document, false)
            }
            None => (RegistryDocument::default(), path.exists()),
        }
    }

    /// Re-reads the document from disk.
    pub fn reload(&mut self) {
        let (document, unreadable) = Self::read(&self.path);
        self.document = document;
        self.unreadable = unreadable;
    }

    /// Returns the registry path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns every entry.
    #[must_use]
    pub fn entries(&self) -> &[RegistryEntry] {
        &self.document.entries
    }

    /// Returns true if the registry has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document.entries.is_empty()
    }

    /// Returns true if the file exists but could not be read or parsed.
    #[must_use]
    pub fn is_unreadable(&self) -> bool {
        self.unreadable
    }

    /// Finds the entry for `item`, preferring a done entry.
    #[must_use]
    pub fn lookup(&self, item: &WorkItem) -> Option<&RegistryEntry> {
        let mut matches = self.document.entries.iter().filter(|e| item.matches(e));
        let first = matches.next()?;
        if first.is_done() {
            return Some(first);
        }
        matches.find(|e| e.is_done()).or(Some(first))
    }

    /// Records that real work on `item` has begun in `run_folder`.
    ///
    /// Rejected if the item is already done or already in progress, so an
    /// existing entry's run folder is never taken over.
    pub fn create(&mut self, item: &WorkItem, run_folder: &Path) -> Result<&RegistryEntry> {
        if let Some(existing) = self.lookup(item) {
            let reason = if existing.is_done() {
                format!("already published ({})", existing.external_refs.join(", "))
            } else {
                let folder = existing
                    .run_folder
                    .as_ref()
                    .map_or_else(|| "an unknown folder".to_string(), |f| f.display().to_string());
                format!("already in progress in {folder}")
            };
            return Err(ClipflowError::Registry(format!("'{item}' is {reason}")));
        }

        let mut entry = RegistryEntry::new(item, RegistryStatus::Processing);
        entry.run_folder = Some(run_folder.to_path_buf());
        self.document.entries.push(entry);
        self.persist()?;
        info!(item = %item, run_folder = %run_folder.display(), "Registered work item as processing");
        Ok(&self.document.entries[self.document.entries.len() - 1])
    }

    /// Marks `item` done with its published refs.
    ///
    /// `refs` must be non-empty. Creates the entry if none exists.
    pub fn set_done(&mut self, item: &WorkItem, refs: Vec<String>) -> Result<()> {
        if refs.iter().all(|r| r.trim().is_empty()) {
            return Err(ClipflowError::Registry(format!(
                "refusing to mark '{item}' done without external refs"
            )));
        }

        let position = self
            .document
            .entries
            .iter()
            .position(|e| item.matches(e) && !e.is_done())
            .or_else(|| self.document.entries.iter().position(|e| item.matches(e)));
        let entry = match position {
            Some(index) => &mut self.document.entries[index],
            None => {
                self.document
                    .entries
                    .push(RegistryEntry::new(item, RegistryStatus::Processing));
                let last = self.document.entries.len() - 1;
                &mut self.document.entries[last]
            }
        };

        entry.status = RegistryStatus::Done;
        for r in refs.into_iter().filter(|r| !r.trim().is_empty()) {
            if !entry.external_refs.contains(&r) {
                entry.external_refs.push(r);
            }
        }
        entry.updated_at = iso_timestamp();
        self.persist()?;
        info!(item = %item, "Marked work item done");
        Ok(())
    }

    /// Removes every entry matching `item`. Returns true if any was removed.
    pub fn remove(&mut self, item: &WorkItem) -> Result<bool> {
        let before = self.document.entries.len();
        self.document.entries.retain(|e| !item.matches(e));
        let removed = self.document.entries.len() != before;
        if removed {
            self.persist()?;
            debug!(item = %item, "Removed registry entry");
        }
        Ok(removed)
    }

    /// Adds entries whose key is not yet present. Returns how many were added.
    ///
    /// A done entry without a non-blank external ref is rejected.
    pub fn import(&mut self, entries: Vec<RegistryEntry>) -> Result<usize> {
        if let Some(bad) = entries
            .iter()
            .find(|e| e.is_done() && e.external_refs.iter().all(|r| r.trim().is_empty()))
        {
            return Err(ClipflowError::Registry(format!(
                "refusing to import done entry '{}' without external refs",
                bad.key_title
            )));
        }

        let mut added = 0;
        for entry in entries {
            if self.document.entries.iter().any(|e| e.same_key(&entry)) {
                continue;
            }
            self.document.entries.push(entry);
            added += 1;
        }
        if added > 0 {
            self.persist()?;
        }
        self.unreadable = false;
        Ok(added)
    }

    fn persist(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.document)
    }
}

/// Identity file written into every run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    /// The run id.
    pub run_id: Uuid,
    /// Normalized title of the work item.
    pub key_title: String,
    /// Normalized author of the work item.
    #[serde(default)]
    pub key_author: Option<String>,
    /// Creation time (ISO 8601).
    pub created_at: String,
}

impl RunManifest {
    /// Creates a manifest for `item`.
    #[must_use]
    pub fn new(run_id: Uuid, item: &WorkItem) -> Self {
        Self {
            run_id,
            key_title: item.key_title(),
            key_author: item.key_author(),
            created_at: iso_timestamp(),
        }
    }

    /// Writes `run.json` into `run_dir`.
    pub fn write(&self, run_dir: &Path) -> Result<()> {
        write_json_atomic(&run_dir.join(MANIFEST_FILE), self)
    }

    /// Reads `run.json` from `run_dir`.
    #[must_use]
    pub fn read(run_dir: &Path) -> Option<Self> {
        read_json_lenient(&run_dir.join(MANIFEST_FILE))
    }

    /// Returns true if the manifest belongs to `item`.
    #[must_use]
    pub fn matches(&self, item: &WorkItem) -> bool {
        self.key_title == item.key_title()
            && authors_match(item.key_author().as_deref(), self.key_author.as_deref())
    }

    /// Finds the newest run directory under `runs_dir` whose manifest matches `item`.
    #[must_use]
    pub fn scan(runs_dir: &Path, item: &WorkItem) -> Option<(PathBuf, Self)> {
        let dirs = match std::fs::read_dir(runs_dir) {
            Ok(dirs) => dirs,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(runs_dir = %runs_dir.display(), error = %e, "Failed to scan runs directory");
                }
                return None;
            }
        };

        dirs.filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter_map(|path| Self::read(&path).map(|m| (path, m)))
            .filter(|(_, manifest)| manifest.matches(item))
            .max_by(|(_, a), (_, b)| a.created_at.cmp(&b.created_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> DuplicateRegistry {
        DuplicateRegistry::open(dir.path().join("registry.json"))
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  The   Left Hand\tof Darkness "), "the left hand of darkness");
    }

    #[test]
    fn test_matching_is_case_insensitive_and_author_lenient() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);
        reg.set_done(&WorkItem::new("Dune", Some("Frank Herbert")), vec!["vid-1".into()])
            .unwrap();

        assert!(reg.lookup(&WorkItem::new("  DUNE ", None)).is_some());
        assert!(reg.lookup(&WorkItem::new("dune", Some("frank  herbert"))).is_some());
        assert!(reg.lookup(&WorkItem::new("Dune", Some("Someone Else"))).is_none());
        assert!(reg.lookup(&WorkItem::new("Dune Messiah", None)).is_none());
    }

    #[test]
    fn test_entry_without_author_matches_any_author() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);
        reg.set_done(&WorkItem::new("Emma", None), vec!["vid-2".into()]).unwrap();
        assert!(reg.lookup(&WorkItem::new("Emma", Some("Jane Austen"))).is_some());
    }

    #[test]
    fn test_create_then_done_persists() {
        let dir = TempDir::new().unwrap();
        let item = WorkItem::new("Dune", Some("Frank Herbert"));
        let run_folder = dir.path().join("runs").join("dune");

        let mut reg = registry(&dir);
        let entry = reg.create(&item, &run_folder).unwrap();
        assert_eq!(entry.status, RegistryStatus::Processing);
        assert_eq!(entry.run_folder.as_deref(), Some(run_folder.as_path()));

        reg.set_done(&item, vec!["vid-9".into(), "vid-9".into(), "short-3".into()])
            .unwrap();

        let reloaded = registry(&dir);
        assert_eq!(reloaded.entries().len(), 1);
        let entry = reloaded.lookup(&item).unwrap();
        assert!(entry.is_done());
        assert_eq!(entry.external_refs, vec!["vid-9", "short-3"]);
        assert_eq!(entry.run_folder.as_deref(), Some(run_folder.as_path()));
    }

    #[test]
    fn test_set_done_rejects_empty_refs() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);
        let item = WorkItem::new("Dune", None);
        assert!(reg.set_done(&item, vec![]).is_err());
        assert!(reg.set_done(&item, vec!["  ".into()]).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_create_refuses_done_item() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);
        let item = WorkItem::new("Dune", None);
        reg.set_done(&item, vec!["vid-1".into()]).unwrap();
        assert!(matches!(reg.create(&item, dir.path()), Err(ClipflowError::Registry(_))));
    }

    #[test]
    fn test_create_keeps_foreign_run_folder() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);
        let item = WorkItem::new("Dune", None);
        reg.create(&item, &dir.path().join("other-machine")).unwrap();

        let err = reg.create(&item, &dir.path().join("mine")).unwrap_err();
        assert!(err.to_string().contains("already in progress"));
        assert_eq!(reg.entries().len(), 1);
        assert_eq!(
            registry(&dir).entries()[0].run_folder,
            Some(dir.path().join("other-machine"))
        );
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);
        let item = WorkItem::new("Dune", None);
        reg.create(&item, dir.path()).unwrap();
        assert!(reg.remove(&item).unwrap());
        assert!(!reg.remove(&item).unwrap());
        assert!(registry(&dir).is_empty());
    }

    #[test]
    fn test_corrupt_registry_opens_empty_and_unreadable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("registry.json"), b"not json").unwrap();
        let reg = registry(&dir);
        assert!(reg.is_empty());
        assert!(reg.is_unreadable());

        let missing = DuplicateRegistry::open(dir.path().join("other.json"));
        assert!(missing.is_empty());
        assert!(!missing.is_unreadable());
    }

    #[test]
    fn test_reload_sees_external_writes() {
        let dir = TempDir::new().unwrap();
        let mut reader = registry(&dir);
        let mut writer = registry(&dir);
        writer.set_done(&WorkItem::new("Dune", None), vec!["v".into()]).unwrap();

        assert!(reader.is_empty());
        reader.reload();
        assert_eq!(reader.entries().len(), 1);
    }

    #[test]
    fn test_import_skips_known_keys() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);
        let dune = WorkItem::new("Dune", None);
        let added = reg
            .import(vec![
                RegistryEntry::published(&dune, "v1"),
                RegistryEntry::published(&dune, "v2"),
                RegistryEntry::published(&WorkItem::new("Emma", None), "v3"),
            ])
            .unwrap();
        assert_eq!(added, 2);
    }

    #[test]
    fn test_import_rejects_done_entry_without_ref() {
        let dir = TempDir::new().unwrap();
        let mut reg = registry(&dir);
        let result = reg.import(vec![
            RegistryEntry::published(&WorkItem::new("Emma", None), "v3"),
            RegistryEntry::published(&WorkItem::new("Dune", None), " "),
        ]);
        assert!(matches!(result, Err(ClipflowError::Registry(_))));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_manifest_scan_finds_newest_match() {
        let dir = TempDir::new().unwrap();
        let item = WorkItem::new("Dune", Some("Frank Herbert"));

        for (name, created) in [("old", "2026-01-01T00:00:00"), ("new", "2026-02-01T00:00:00")] {
            let run_dir = dir.path().join(name);
            std::fs::create_dir_all(&run_dir).unwrap();
            let mut manifest = RunManifest::new(Uuid::new_v4(), &item);
            manifest.created_at = created.to_string();
            manifest.write(&run_dir).unwrap();
        }
        let other = dir.path().join("other");
        std::fs::create_dir_all(&other).unwrap();
        RunManifest::new(Uuid::new_v4(), &WorkItem::new("Emma", None))
            .write(&other)
            .unwrap();

        let (found, _) = RunManifest::scan(dir.path(), &item).unwrap();
        assert_eq!(found, dir.path().join("new"));
        assert!(RunManifest::scan(&dir.path().join("missing"), &item).is_none());
    }
}
