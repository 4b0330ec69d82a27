//! Sequential pipeline executor for one run.

use super::planner::{self, StageAction};
use super::retry::{RetryConfig, RetryController};
use crate::config::{ClipflowConfig, ConfigError};
use crate::context::RunContext;
use crate::core::RunState;
use crate::errors::{ClipflowError, Result, EXIT_CANCELLED, EXIT_FAILURE, EXIT_OK};
use crate::ledger::RunLedger;
use crate::stages::{StageHandler, StageSpec};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Tracks the run state and rejects illegal moves.
#[derive(Debug, Default)]
pub struct RunStateMachine {
    state: RunState,
}

impl RunStateMachine {
    /// Creates a machine in `NotStarted`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Moves to `next`.
    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ClipflowError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Summary of a run that reached `Ok`.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// The run id.
    pub run_id: Uuid,
    /// Final state.
    pub state: RunState,
    /// Stages executed by this invocation.
    pub executed: Vec<String>,
    /// Stages skipped as already verified.
    pub skipped: Vec<String>,
    /// Artifact refs per stage, including refs recorded by earlier invocations.
    pub artifact_refs: BTreeMap<String, Vec<String>>,
    /// Total execution time in milliseconds.
    pub duration_ms: f64,
}

impl RunOutcome {
    /// Returns the exit code for the outcome's state.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Ok => EXIT_OK,
            RunState::Cancelled => EXIT_CANCELLED,
            _ => EXIT_FAILURE,
        }
    }

    /// Collects the refs of `stages`, in the given order.
    #[must_use]
    pub fn refs_for(&self, stages: &[String]) -> Vec<String> {
        stages
            .iter()
            .filter_map(|s| self.artifact_refs.get(s))
            .flatten()
            .cloned()
            .collect()
    }
}

/// Maps a run result to the process exit code.
#[must_use]
pub fn exit_code(result: &Result<RunOutcome>) -> i32 {
    match result {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => e.exit_code(),
    }
}

/// Drives the fixed stage list for one run directory.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    specs: Vec<StageSpec>,
    handlers: Vec<Arc<dyn StageHandler>>,
    retry: RetryController,
}

impl PipelineExecutor {
    /// Creates an executor.
    ///
    /// `handlers` must name the same stages as `specs`, in the same order.
    pub fn new(
        specs: Vec<StageSpec>,
        handlers: Vec<Arc<dyn StageHandler>>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let expected: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        let actual: Vec<&str> = handlers.iter().map(|h| h.name()).collect();
        if expected != actual {
            return Err(ConfigError::Invalid(format!(
                "stage handlers {actual:?} do not match stage list {expected:?}"
            ))
            .into());
        }
        Ok(Self {
            specs,
            handlers,
            retry: RetryController::new(retry),
        })
    }

    /// Creates an executor running each configured stage command.
    pub fn from_config(config: &ClipflowConfig) -> Result<Self> {
        Self::new(
            config.stage_specs(),
            config.command_handlers()?,
            config.retry.clone(),
        )
    }

    /// Returns the stage list.
    #[must_use]
    pub fn specs(&self) -> &[StageSpec] {
        &self.specs
    }

    /// Runs every stage that is not already verified complete.
    ///
    /// A critical stage failure or cancellation is returned as `Err`; the
    /// caller maps it with [`exit_code`].
    pub async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome> {
        let started = Instant::now();
        let mut machine = RunStateMachine::new();
        let sink = ctx.event_sink();

        ctx.artifacts().ensure_dir()?;
        let mut ledger = RunLedger::load(ctx.run_dir(), ctx.run_id());

        if ctx.is_cancelled() {
            machine.transition(RunState::Cancelled)?;
            let reason = ctx.cancellation().reason().unwrap_or_else(|| "cancelled".into());
            return Err(ClipflowError::cancelled(None, reason));
        }
        machine.transition(RunState::Running)?;

        let plan = planner::plan(&ledger, ctx.artifacts(), &self.specs);
        info!(
            run_id = %ctx.run_id(),
            title = %ctx.item().title,
            stages = self.specs.len(),
            skipping = plan.skipped(),
            resume_from = plan.first_pending().unwrap_or("-"),
            "Starting run"
        );
        sink.emit(
            "run.started",
            Some(serde_json::json!({
                "run_id": ctx.run_id().to_string(),
                "title": ctx.item().title,
                "resume_from": plan.first_pending(),
            })),
        )
        .await;

        let mut executed = Vec::new();
        let mut skipped = Vec::new();
        let mut artifact_refs = BTreeMap::new();

        for (spec, handler) in self.specs.iter().zip(&self.handlers) {
            // Classified live: a retried stage changes what follows it.
            let action = planner::classify(&ledger, ctx.artifacts(), &spec.name);
            if action == StageAction::Skip {
                let refs = ledger
                    .latest(&spec.name)
                    .map(|r| r.artifact_refs.clone())
                    .unwrap_or_default();
                if !refs.is_empty() {
                    artifact_refs.insert(spec.name.clone(), refs);
                }
                skipped.push(spec.name.clone());
                sink.try_emit(
                    "stage.skipped",
                    Some(serde_json::json!({"stage": spec.name, "reason": "verified"})),
                );
                continue;
            }

            if action == StageAction::Retry {
                info!(stage = %spec.name, "Retrying failed stage");
            }

            match self.retry.run(handler.as_ref(), ctx, &mut ledger).await {
                Ok(outcome) => {
                    if !outcome.artifact_refs.is_empty() {
                        artifact_refs.insert(spec.name.clone(), outcome.artifact_refs);
                    }
                    executed.push(spec.name.clone());
                }
                Err(e) => {
                    let next = if e.is_cancelled() {
                        RunState::Cancelled
                    } else {
                        RunState::Failed
                    };
                    machine.transition(next)?;
                    if e.is_cancelled() {
                        warn!(run_id = %ctx.run_id(), error = %e, "Run cancelled");
                    } else {
                        error!(run_id = %ctx.run_id(), error = %e, "Run failed");
                    }
                    sink.emit(
                        &format!("run.{next}"),
                        Some(serde_json::json!({
                            "run_id": ctx.run_id().to_string(),
                            "error": e.to_string(),
                            "exit_code": e.exit_code(),
                        })),
                    )
                    .await;
                    return Err(e);
                }
            }
        }

        machine.transition(RunState::Ok)?;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            run_id = %ctx.run_id(),
            executed = executed.len(),
            skipped = skipped.len(),
            duration_ms,
            "Run completed"
        );
        sink.emit(
            "run.ok",
            Some(serde_json::json!({
                "run_id": ctx.run_id().to_string(),
                "executed": executed,
                "skipped": skipped,
            })),
        )
        .await;

        Ok(RunOutcome {
            run_id: ctx.run_id(),
            state: machine.state(),
            executed,
            skipped,
            artifact_refs,
            duration_ms,
        })
    }
}
