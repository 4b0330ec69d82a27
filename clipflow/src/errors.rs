//! Error types for the clipflow orchestration engine.
//!
//! Stage handlers report failures as [`StageError`] values carrying an
//! explicit [`StageErrorKind`], so the retry controller branches on the kind
//! instead of on printed text. A stage that exhausts its attempt budget turns
//! into a [`CriticalStageFailure`], which is terminal for the run and must
//! reach the process boundary untouched.

use crate::config::ConfigError;
use crate::core::RunState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Exit code for a run whose stages all completed.
pub const EXIT_OK: i32 = 0;
/// Exit code for a critical stage failure or any unexpected error.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for a user-cancelled run.
pub const EXIT_CANCELLED: i32 = 130;

/// The main error type for clipflow operations.
#[derive(Debug, Error)]
pub enum ClipflowError {
    /// A stage exhausted its retry budget.
    #[error(transparent)]
    CriticalStage(#[from] CriticalStageFailure),

    /// The run was cancelled by the user.
    #[error("Run cancelled{}: {reason}", stage_suffix(.stage))]
    Cancelled {
        /// The stage that was in flight, if any.
        stage: Option<String>,
        /// The cancellation reason.
        reason: String,
    },

    /// The run state machine was asked to make an illegal move.
    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: RunState,
        /// Requested state.
        to: RunState,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A registry operation was rejected.
    #[error("Registry error: {0}")]
    Registry(String),

    /// The authoritative registry source could not be read.
    #[error("Registry sync failed: {0}")]
    Sync(String),

    /// A batch input line could not be parsed.
    #[error("Batch input error at line {line}: {message}")]
    BatchInput {
        /// 1-based line number.
        line: usize,
        /// What was wrong with the line.
        message: String,
    },

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClipflowError {
    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(stage: Option<String>, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            stage,
            reason: reason.into(),
        }
    }

    /// Returns true for user cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Maps the error to the process exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled { .. } => EXIT_CANCELLED,
            _ => EXIT_FAILURE,
        }
    }
}

fn stage_suffix(stage: &Option<String>) -> String {
    stage
        .as_ref()
        .map(|s| format!(" during stage '{s}'"))
        .unwrap_or_default()
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClipflowError>;

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Timeout, rate limit or temporary outage; worth another attempt.
    Transient,
    /// The stage cannot succeed by retrying; the budget is forfeited.
    Permanent,
    /// The collaborator observed a user cancellation.
    Cancelled,
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error returned by a stage handler.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct StageError {
    /// The failure kind.
    pub kind: StageErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl StageError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Cancelled,
            message: message.into(),
        }
    }

    /// Returns true if another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == StageErrorKind::Transient
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::transient(err.to_string())
    }
}

/// Terminal signal raised when a stage exhausts its retry budget.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' failed after {attempts} attempt(s): {last_error}")]
pub struct CriticalStageFailure {
    /// The stage that failed.
    pub stage: String,
    /// Attempts consumed.
    pub attempts: u32,
    /// The error from the final attempt.
    pub last_error: StageError,
}

impl CriticalStageFailure {
    /// Creates a new critical stage failure.
    #[must_use]
    pub fn new(stage: impl Into<String>, attempts: u32, last_error: StageError) -> Self {
        Self {
            stage: stage.into(),
            attempts,
            last_error,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!("CriticalStageFailure"));
        map.insert("stage".to_string(), serde_json::json!(self.stage));
        map.insert("attempts".to_string(), serde_json::json!(self.attempts));
        map.insert("error_kind".to_string(), serde_json::json!(self.last_error.kind));
        map.insert("message".to_string(), serde_json::json!(self.last_error.message));
        map
    }
}
