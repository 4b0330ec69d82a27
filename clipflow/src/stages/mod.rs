//! Stage handler trait, stage catalog and built-in handlers.
//!
//! Every concrete stage (search, transcription, synthesis, rendering,
//! publishing, ...) is an opaque collaborator behind [`StageHandler`]. A
//! handler writes its artifacts into the run directory and must be safe to
//! re-execute from scratch; there is no intra-stage resume.

mod command;

pub use command::CommandStage;

use crate::context::RunContext;
use crate::errors::StageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Successful result of a stage attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// References to what the stage produced (file names, external ids).
    #[serde(default)]
    pub artifact_refs: Vec<String>,
}

impl StageOutcome {
    /// Creates an outcome with artifact references.
    #[must_use]
    pub fn new(artifact_refs: Vec<String>) -> Self {
        Self { artifact_refs }
    }

    /// Creates an outcome with no references.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Trait for pipeline stages.
#[async_trait]
pub trait StageHandler: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Executes one attempt of the stage.
    ///
    /// `Err` carries the failure kind so the retry controller can decide
    /// whether another attempt is worthwhile.
    async fn execute(&self, ctx: &RunContext) -> Result<StageOutcome, StageError>;
}

/// A stage name plus the files it must leave in the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// The stage name.
    pub name: String,
    /// Required artifact file names, relative to the run directory.
    pub artifacts: Vec<String>,
}

impl StageSpec {
    /// Creates a new stage spec.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            artifacts: artifacts.into_iter().map(Into::into).collect(),
        }
    }
}

/// The fixed production sequence and each stage's artifact contract.
#[must_use]
pub fn default_catalog() -> Vec<StageSpec> {
    vec![
        StageSpec::new("search", ["search_results.json"]),
        StageSpec::new("transcribe", ["transcript.txt"]),
        StageSpec::new("transform", ["script.md"]),
        StageSpec::new("synthesize", ["narration.wav"]),
        StageSpec::new("render", ["video.mp4"]),
        StageSpec::new("package-metadata", ["metadata.json"]),
        StageSpec::new("merge", ["final.mp4"]),
        StageSpec::new("thumbnail", ["thumbnail.png"]),
        StageSpec::new("publish", ["publish.json"]),
        StageSpec::new("short-variant-generate", ["short.mp4"]),
        StageSpec::new("short-variant-publish", ["short_publish.json"]),
    ]
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&RunContext) -> Result<StageOutcome, StageError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&RunContext) -> Result<StageOutcome, StageError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&RunContext) -> Result<StageOutcome, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> StageHandler for FnStage<F>
where
    F: Fn(&RunContext) -> Result<StageOutcome, StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StageOutcome, StageError> {
        (self.func)(ctx)
    }
}
