//! Stage handler that delegates to an external command.
//!
//! The command runs with the run directory as its working directory and
//! receives the run's identity through `CLIPFLOW_*` environment variables.
//! Lines printed as `artifact: <ref>` on stdout become the outcome's artifact
//! references. Exit code 0 is success, 130 is a user cancellation, anything
//! else is a transient failure.

use super::{StageHandler, StageOutcome};
use crate::context::RunContext;
use crate::errors::StageError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const ARTIFACT_PREFIX: &str = "artifact:";

/// Runs `program args...` for one stage attempt.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandStage {
    /// Creates a command stage.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            timeout: None,
        }
    }

    /// Bounds each attempt; an attempt that overruns is a transient failure.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn build_command(&self, ctx: &RunContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(ctx.run_dir())
            .env("CLIPFLOW_STAGE", &self.name)
            .env("CLIPFLOW_RUN_ID", ctx.run_id().to_string())
            .env("CLIPFLOW_RUN_DIR", ctx.run_dir())
            .env("CLIPFLOW_TITLE", &ctx.item().title)
            .env("CLIPFLOW_AUTHOR", ctx.item().author.as_deref().unwrap_or(""))
            .env("CLIPFLOW_PRIVACY", ctx.privacy().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in ctx.params() {
            cmd.env(format!("CLIPFLOW_PARAM_{}", key.to_ascii_uppercase()), value);
        }
        cmd
    }
}

fn parse_artifact_refs(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(ARTIFACT_PREFIX))
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect()
}

fn tail(text: &str, max_chars: usize) -> &str {
    let trimmed = text.trim_end();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed;
    }
    let skip = count - max_chars;
    let start = trimmed
        .char_indices()
        .nth(skip)
        .map_or(0, |(index, _)| index);
    &trimmed[start..]
}

#[async_trait]
impl StageHandler for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &RunContext) -> Result<StageOutcome, StageError> {
        debug!(stage = %self.name, program = %self.program, "Spawning stage command");
        let child = self.build_command(ctx).spawn().map_err(|e| {
            StageError::permanent(format!("failed to spawn '{}': {e}", self.program))
        })?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    StageError::transient(format!("timed out after {}s", limit.as_secs_f64()))
                })??,
            None => child.wait_with_output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => Ok(StageOutcome::new(parse_artifact_refs(&stdout))),
            Some(130) => Err(StageError::cancelled("stage command interrupted")),
            Some(code) => Err(StageError::transient(format!(
                "exit code {code}: {}",
                tail(&stderr, 400)
            ))),
            None => Err(StageError::transient("terminated by signal")),
        }
    }
}
