//! Durable, append-style record of stage attempts for one run.
//!
//! The ledger lives at `<run_dir>/ledger.json` and is rewritten atomically
//! after every append. A missing, unreadable or malformed ledger loads as an
//! empty history: losing the audit trail costs rework, never correctness.

use crate::artifacts::{ArtifactStore, LEDGER_FILE};
use crate::core::{StageRecord, StageStatus};
use crate::errors::Result;
use crate::utils::{read_json_lenient, write_json_atomic};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// On-disk shape of a run ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerDocument {
    /// The run id.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    /// Ordered stage history.
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    /// Cached name of the failure point.
    #[serde(default)]
    pub last_failed_stage: Option<String>,
}

/// The ledger of one run.
#[derive(Debug, Clone)]
pub struct RunLedger {
    run_id: Uuid,
    root_path: PathBuf,
    records: Vec<StageRecord>,
    last_failed_stage: Option<String>,
}

impl RunLedger {
    /// Loads the ledger in `run_dir`, or starts an empty one.
    ///
    /// `run_id` is used only when the directory holds no ledger yet.
    #[must_use]
    pub fn load(run_dir: impl Into<PathBuf>, run_id: Uuid) -> Self {
        let root_path = run_dir.into();
        let doc: LedgerDocument =
            read_json_lenient(&root_path.join(LEDGER_FILE)).unwrap_or_default();

        let derived = derive_last_failed(&doc.stages);
        if doc.last_failed_stage != derived {
            warn!(
                run_dir = %root_path.display(),
                cached = ?doc.last_failed_stage,
                derived = ?derived,
                "Ledger failure marker disagrees with history; using history"
            );
        }

        debug!(
            run_dir = %root_path.display(),
            records = doc.stages.len(),
            "Loaded run ledger"
        );

        Self {
            run_id: doc.run_id.unwrap_or(run_id),
            root_path,
            records: doc.stages,
            last_failed_stage: derived,
        }
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the run directory.
    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Returns the ledger file path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.root_path.join(LEDGER_FILE)
    }

    /// Returns the ordered stage history.
    #[must_use]
    pub fn read(&self) -> &[StageRecord] {
        &self.records
    }

    /// Returns true if no attempt has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the current failure point, if any.
    #[must_use]
    pub fn last_failed_stage(&self) -> Option<&str> {
        self.last_failed_stage.as_deref()
    }

    /// Returns the most recent record of `stage`.
    #[must_use]
    pub fn latest(&self, stage: &str) -> Option<&StageRecord> {
        self.records.iter().rev().find(|r| r.name == stage)
    }

    /// Returns true when the latest record of `stage` is ok and its artifacts
    /// are on disk.
    #[must_use]
    pub fn is_stage_completed(&self, stage: &str, artifacts: &ArtifactStore) -> bool {
        self.latest(stage).is_some_and(StageRecord::is_ok) && artifacts.is_present(stage)
    }

    /// Appends a record and persists the ledger.
    pub fn append_record(&mut self, record: StageRecord) -> Result<()> {
        match record.status {
            StageStatus::Failed => self.last_failed_stage = Some(record.name.clone()),
            StageStatus::Ok if self.last_failed_stage.as_deref() == Some(record.name.as_str()) => {
                self.last_failed_stage = None;
            }
            _ => {}
        }
        self.records.push(record);
        self.persist()
    }

    /// Appends a record built from its parts and persists the ledger.
    pub fn append(
        &mut self,
        stage: &str,
        status: StageStatus,
        attempts: u32,
        duration: Duration,
        error: Option<&str>,
    ) -> Result<()> {
        let mut record = StageRecord::new(stage, status)
            .with_attempts(attempts)
            .with_duration_seconds(duration.as_secs_f64());
        if let Some(error) = error {
            record = record.with_error(error);
        }
        self.append_record(record)
    }

    fn persist(&self) -> Result<()> {
        let doc = LedgerDocument {
            run_id: Some(self.run_id),
            stages: self.records.clone(),
            last_failed_stage: self.last_failed_stage.clone(),
        };
        write_json_atomic(&self.path(), &doc)
    }
}

/// The most recent failed stage that no later ok of the same stage superseded.
fn derive_last_failed(records: &[StageRecord]) -> Option<String> {
    let mut last_failed: Option<String> = None;
    for record in records {
        match record.status {
            StageStatus::Failed => last_failed = Some(record.name.clone()),
            StageStatus::Ok if last_failed.as_deref() == Some(record.name.as_str()) => {
                last_failed = None;
            }
            _ => {}
        }
    }
    last_failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageSpec;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::new(
            dir.path(),
            &[
                StageSpec::new("search", ["search.json"]),
                StageSpec::new("render", ["video.mp4"]),
            ],
        )
    }

    #[test]
    fn test_append_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();

        let mut ledger = RunLedger::load(dir.path(), run_id);
        assert!(ledger.is_empty());
        ledger
            .append("search", StageStatus::Ok, 1, Duration::from_millis(1500), None)
            .unwrap();

        let reloaded = RunLedger::load(dir.path(), Uuid::new_v4());
        assert_eq!(reloaded.run_id(), run_id);
        assert_eq!(reloaded.read().len(), 1);
        assert_eq!(reloaded.read()[0].name, "search");
        assert!((reloaded.read()[0].duration_seconds - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_corrupt_ledger_is_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LEDGER_FILE), b"{\"stages\": [tru").unwrap();

        let ledger = RunLedger::load(dir.path(), Uuid::new_v4());
        assert!(ledger.is_empty());
        assert_eq!(ledger.last_failed_stage(), None);
    }

    #[test]
    fn test_failure_marker_tracks_most_recent_failure() {
        let dir = TempDir::new().unwrap();
        let mut ledger = RunLedger::load(dir.path(), Uuid::new_v4());

        ledger.append("search", StageStatus::Failed, 3, Duration::ZERO, Some("timeout")).unwrap();
        assert_eq!(ledger.last_failed_stage(), Some("search"));

        ledger.append("search", StageStatus::Ok, 1, Duration::ZERO, None).unwrap();
        assert_eq!(ledger.last_failed_stage(), None);

        ledger.append("render", StageStatus::Failed, 3, Duration::ZERO, Some("gpu")).unwrap();
        ledger.append("render", StageStatus::Cancelled, 1, Duration::ZERO, Some("ctrl-c")).unwrap();
        assert_eq!(ledger.last_failed_stage(), Some("render"));

        let reloaded = RunLedger::load(dir.path(), Uuid::new_v4());
        assert_eq!(reloaded.last_failed_stage(), Some("render"));
    }

    #[test]
    fn test_stale_cached_marker_is_recomputed() {
        let dir = TempDir::new().unwrap();
        let doc = serde_json::json!({
            "run_id": null,
            "stages": [
                {"name": "search", "status": "failed", "attempts": 2, "timestamp": "t"},
                {"name": "search", "status": "ok", "attempts": 1, "timestamp": "t"}
            ],
            "last_failed_stage": "search"
        });
        std::fs::write(dir.path().join(LEDGER_FILE), doc.to_string()).unwrap();

        let ledger = RunLedger::load(dir.path(), Uuid::new_v4());
        assert_eq!(ledger.last_failed_stage(), None);
    }

    #[test]
    fn test_completion_requires_ok_and_artifacts() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        let mut ledger = RunLedger::load(dir.path(), Uuid::new_v4());

        ledger.append("search", StageStatus::Ok, 1, Duration::ZERO, None).unwrap();
        assert!(!ledger.is_stage_completed("search", &artifacts));

        std::fs::write(artifacts.path("search.json"), b"[]").unwrap();
        assert!(ledger.is_stage_completed("search", &artifacts));

        // Artifacts alone are not enough either.
        std::fs::write(artifacts.path("video.mp4"), b"v").unwrap();
        assert!(!ledger.is_stage_completed("render", &artifacts));
    }

    #[test]
    fn test_running_record_after_ok_is_not_completed() {
        let dir = TempDir::new().unwrap();
        let artifacts = store(&dir);
        std::fs::write(artifacts.path("search.json"), b"[]").unwrap();

        let mut ledger = RunLedger::load(dir.path(), Uuid::new_v4());
        ledger.append("search", StageStatus::Ok, 1, Duration::ZERO, None).unwrap();
        ledger.append("search", StageStatus::Running, 0, Duration::ZERO, None).unwrap();

        assert!(!ledger.is_stage_completed("search", &artifacts));
    }

    #[test]
    fn test_wire_format() {
        let dir = TempDir::new().unwrap();
        let mut ledger = RunLedger::load(dir.path(), Uuid::new_v4());
        ledger.append("tts", StageStatus::Failed, 10, Duration::from_secs(2), Some("quota")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(ledger.path()).unwrap()).unwrap();
        assert_eq!(raw["last_failed_stage"], "tts");
        assert_eq!(raw["stages"][0]["status"], "failed");
        assert_eq!(raw["stages"][0]["attempts"], 10);
        assert_eq!(raw["stages"][0]["error"], "quota");
    }
}
