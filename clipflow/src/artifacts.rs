//! Per-run artifact directory and the stage artifact contract.
//!
//! The physical presence of a stage's required files is ground truth for
//! completion, independent of what the ledger says.

use crate::stages::StageSpec;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the run ledger inside a run directory.
pub const LEDGER_FILE: &str = "ledger.json";
/// File name of the run manifest inside a run directory.
pub const MANIFEST_FILE: &str = "run.json";

/// Run directory plus the stage → required files mapping.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    run_dir: PathBuf,
    contract: Arc<HashMap<String, Vec<String>>>,
}

impl ArtifactStore {
    /// Creates a store for `run_dir` using the artifact contract of `stages`.
    #[must_use]
    pub fn new(run_dir: impl Into<PathBuf>, stages: &[StageSpec]) -> Self {
        let contract = stages
            .iter()
            .map(|s| (s.name.clone(), s.artifacts.clone()))
            .collect();
        Self {
            run_dir: run_dir.into(),
            contract: Arc::new(contract),
        }
    }

    /// Returns the run directory.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Returns the absolute path of a file inside the run directory.
    #[must_use]
    pub fn path(&self, file_name: &str) -> PathBuf {
        self.run_dir.join(file_name)
    }

    /// Returns the ledger path.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.path(LEDGER_FILE)
    }

    /// Returns the manifest path.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path(MANIFEST_FILE)
    }

    /// Returns the required files of a stage, if the stage is known.
    #[must_use]
    pub fn required(&self, stage: &str) -> Option<&[String]> {
        self.contract.get(stage).map(Vec::as_slice)
    }

    /// Returns the required files of `stage` that are not on disk.
    ///
    /// An unknown stage reports no missing files; see [`Self::is_present`].
    #[must_use]
    pub fn missing(&self, stage: &str) -> Vec<String> {
        self.required(stage)
            .unwrap_or_default()
            .iter()
            .filter(|f| !self.path(f).is_file())
            .cloned()
            .collect()
    }

    /// Returns true if every required file of `stage` exists.
    ///
    /// A stage without a contract is never considered present.
    #[must_use]
    pub fn is_present(&self, stage: &str) -> bool {
        match self.required(stage) {
            Some(files) if !files.is_empty() => files.iter().all(|f| self.path(f).is_file()),
            _ => false,
        }
    }

    /// Returns true if any stage artifact exists in the run directory.
    #[must_use]
    pub fn has_any_artifact(&self) -> bool {
        self.contract
            .values()
            .flatten()
            .any(|f| self.path(f).is_file())
    }

    /// Creates the run directory if needed.
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.run_dir)
    }
}
