//! Immutable stage attempt records.

use super::StageStatus;
use serde::{Deserialize, Serialize};

/// One entry in a run ledger.
///
/// Records are never edited after they are written; a later attempt of the
/// same stage appends a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage name.
    pub name: String,
    /// Outcome of the attempt.
    pub status: StageStatus,
    /// Attempts consumed by the retry controller.
    #[serde(default)]
    pub attempts: u32,
    /// Wall-clock duration of the attempts, in seconds.
    #[serde(default)]
    pub duration_seconds: f64,
    /// Error message for failed or cancelled records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// References produced by an ok attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_refs: Vec<String>,
    /// When the record was written (ISO 8601).
    pub timestamp: String,
}

impl StageRecord {
    /// Creates a new record stamped with the current time.
    #[must_use]
    pub fn new(name: impl Into<String>, status: StageStatus) -> Self {
        Self {
            name: name.into(),
            status,
            attempts: 0,
            duration_seconds: 0.0,
            error: None,
            artifact_refs: Vec::new(),
            timestamp: crate::utils::iso_timestamp(),
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_seconds(mut self, duration: f64) -> Self {
        self.duration_seconds = duration;
        self
    }

    /// Sets the error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the artifact references.
    #[must_use]
    pub fn with_artifact_refs(mut self, refs: Vec<String>) -> Self {
        self.artifact_refs = refs;
        self
    }

    /// Returns true if the record is an ok record.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == StageStatus::Ok
    }

    /// Returns true if the record is a failed record.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }
}
