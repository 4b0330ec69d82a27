//! Per-stage resume decisions.
//!
//! The rules are applied in order:
//! 1. the stage is the ledger's failure point → [`StageAction::Retry`]
//! 2. the latest record is ok and the artifacts exist → [`StageAction::Skip`]
//! 3. anything else → [`StageAction::Run`]

use crate::artifacts::ArtifactStore;
use crate::ledger::RunLedger;
use crate::stages::StageSpec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the executor does with a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    /// Completed and verified on disk.
    Skip,
    /// The recorded failure point; must run before anything later.
    Retry,
    /// Never attempted, interrupted, or unverified.
    Run,
}

impl StageAction {
    /// Returns true if the stage will be executed.
    #[must_use]
    pub fn executes(&self) -> bool {
        !matches!(self, Self::Skip)
    }
}

impl fmt::Display for StageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skip => "skip",
            Self::Retry => "retry",
            Self::Run => "run",
        };
        write!(f, "{s}")
    }
}

/// Classifies one stage against the ledger and the artifact store.
#[must_use]
pub fn classify(ledger: &RunLedger, artifacts: &ArtifactStore, stage: &str) -> StageAction {
    if ledger.last_failed_stage() == Some(stage) {
        StageAction::Retry
    } else if ledger.is_stage_completed(stage, artifacts) {
        StageAction::Skip
    } else {
        StageAction::Run
    }
}

/// One entry of a resume plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    /// Stage name.
    pub stage: String,
    /// Planned action.
    pub action: StageAction,
}

/// The classification of every stage, in pipeline order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumePlan {
    entries: Vec<StagePlan>,
}

impl ResumePlan {
    /// Returns the entries in order.
    #[must_use]
    pub fn entries(&self) -> &[StagePlan] {
        &self.entries
    }

    /// Returns the action planned for `stage`.
    #[must_use]
    pub fn action(&self, stage: &str) -> Option<StageAction> {
        self.entries.iter().find(|e| e.stage == stage).map(|e| e.action)
    }

    /// Returns the first stage that will execute.
    #[must_use]
    pub fn first_pending(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.action.executes())
            .map(|e| e.stage.as_str())
    }

    /// Returns true if every stage is skipped.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.action == StageAction::Skip)
    }

    /// Number of stages to skip.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.entries.iter().filter(|e| e.action == StageAction::Skip).count()
    }
}

/// Classifies every stage of `stages`.
#[must_use]
pub fn plan(ledger: &RunLedger, artifacts: &ArtifactStore, stages: &[StageSpec]) -> ResumePlan {
    let entries = stages
        .iter()
        .map(|spec| StagePlan {
            stage: spec.name.clone(),
            action: classify(ledger, artifacts, &spec.name),
        })
        .collect();
    ResumePlan { entries }
}
