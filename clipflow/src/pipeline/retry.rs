//! Bounded retries with backoff around a single stage.
//!
//! Transient stage errors are absorbed inside the attempt budget. Exhausting
//! the budget writes exactly one `failed` record and then raises
//! [`CriticalStageFailure`]. Cancellation observed during an attempt or a
//! backoff sleep writes a `cancelled` record and stops immediately.

use crate::context::RunContext;
use crate::core::{StageRecord, StageStatus};
use crate::errors::{ClipflowError, CriticalStageFailure, Result, StageError, StageErrorKind};
use crate::ledger::RunLedger;
use crate::stages::{StageHandler, StageOutcome};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to spread retries against shared rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    #[default]
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per stage (including the first).
    pub max_attempts: u32,
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 2000,
            max_delay_ms: 120_000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Equal,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// State tracking for retry operations.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Retries taken so far (0-indexed).
    pub attempt: u32,
    /// Previous delay, for decorrelated jitter.
    previous_delay: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculates the delay for the current attempt.
    #[must_use]
    pub fn calculate_delay(&mut self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        let attempt = self.attempt;

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => {
                let exp_delay = base.saturating_mul(2u64.saturating_pow(attempt));
                exp_delay.min(max)
            }
            BackoffStrategy::Linear => {
                let linear_delay = base.saturating_mul(u64::from(attempt) + 1);
                linear_delay.min(max)
            }
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay.unwrap_or(base);
                let upper = (prev.saturating_mul(3)).min(max);
                let new_delay = if upper <= base {
                    base.min(max)
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delay = Some(new_delay);
                new_delay
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Wraps a stage call with bounded retries, backoff and ledger bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    /// Creates a controller.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the retry configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `handler` until it succeeds, the budget runs out, or the user cancels.
    ///
    /// A reported success whose declared artifacts are missing counts as a
    /// transient failure.
    pub async fn run(
        &self,
        handler: &dyn StageHandler,
        ctx: &RunContext,
        ledger: &mut RunLedger,
    ) -> Result<StageOutcome> {
        let stage = handler.name().to_string();
        let token = ctx.cancellation().clone();
        let max_attempts = self.config.max_attempts.max(1);
        let started = Instant::now();

        if token.is_cancelled() {
            return record_cancellation(ledger, ctx, &stage, 0, started, cancel_reason(ctx)).await;
        }

        ledger.append(&stage, StageStatus::Running, 0, Duration::ZERO, None)?;

        let mut state = RetryState::new();
        loop {
            let attempt = state.attempt + 1;
            ctx.event_sink()
                .emit(
                    "stage.started",
                    Some(serde_json::json!({"stage": stage, "attempt": attempt, "max_attempts": max_attempts})),
                )
                .await;

            let result = tokio::select! {
                biased;
                () = token.cancelled() => Err(StageError::cancelled(cancel_reason(ctx))),
                r = handler.execute(ctx) => r,
            };
            let result = result.and_then(|outcome| {
                let missing = ctx.artifacts().missing(&stage);
                if missing.is_empty() {
                    Ok(outcome)
                } else {
                    Err(StageError::transient(format!(
                        "reported success but artifacts are missing: {}",
                        missing.join(", ")
                    )))
                }
            });

            let error = match result {
                Ok(outcome) => {
                    ledger.append_record(
                        StageRecord::new(&stage, StageStatus::Ok)
                            .with_attempts(attempt)
                            .with_duration_seconds(started.elapsed().as_secs_f64())
                            .with_artifact_refs(outcome.artifact_refs.clone()),
                    )?;
                    info!(stage = %stage, attempt, "Stage completed");
                    ctx.event_sink()
                        .emit(
                            "stage.completed",
                            Some(serde_json::json!({
                                "stage": stage,
                                "attempts": attempt,
                                "artifact_refs": outcome.artifact_refs,
                            })),
                        )
                        .await;
                    return Ok(outcome);
                }
                Err(e) if e.kind == StageErrorKind::Cancelled => {
                    return record_cancellation(ledger, ctx, &stage, attempt, started, e.message).await;
                }
                Err(e) => e,
            };

            warn!(
                stage = %stage,
                attempt,
                max_attempts,
                kind = %error.kind,
                error = %error.message,
                "Stage attempt failed"
            );
            ctx.event_sink().try_emit(
                "stage.attempt_failed",
                Some(serde_json::json!({"stage": stage, "attempt": attempt, "error": error})),
            );

            if !error.is_retryable() || attempt >= max_attempts {
                ledger.append(
                    &stage,
                    StageStatus::Failed,
                    attempt,
                    started.elapsed(),
                    Some(&error.to_string()),
                )?;
                let failure = CriticalStageFailure::new(&stage, attempt, error);
                ctx.event_sink()
                    .emit("stage.failed", Some(serde_json::json!(failure.to_dict())))
                    .await;
                return Err(failure.into());
            }

            let delay = state.calculate_delay(&self.config);
            state.attempt += 1;
            tracing::debug!(stage = %stage, delay_ms = delay.as_millis() as u64, "Backing off before retry");

            tokio::select! {
                biased;
                () = token.cancelled() => {
                    return record_cancellation(ledger, ctx, &stage, attempt, started, cancel_reason(ctx)).await;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn cancel_reason(ctx: &RunContext) -> String {
    ctx.cancellation()
        .reason()
        .unwrap_or_else(|| "cancelled".to_string())
}

async fn record_cancellation(
    ledger: &mut RunLedger,
    ctx: &RunContext,
    stage: &str,
    attempts: u32,
    started: Instant,
    reason: String,
) -> Result<StageOutcome> {
    ledger.append(stage, StageStatus::Cancelled, attempts, started.elapsed(), Some(&reason))?;
    warn!(stage = %stage, reason = %reason, "Stage cancelled");
    ctx.event_sink()
        .emit("stage.cancelled", Some(serde_json::json!({"stage": stage, "reason": reason})))
        .await;
    Err(ClipflowError::cancelled(Some(stage.to_string()), reason))
}
