//! Run execution.
//!
//! This module provides:
//! - The retry controller wrapping each stage call
//! - The resume planner deciding skip / retry / run per stage
//! - The sequential pipeline executor and its run state machine

mod executor;
mod planner;
mod retry;

pub use executor::{exit_code, PipelineExecutor, RunOutcome, RunStateMachine};
pub use planner::{classify, plan, ResumePlan, StageAction, StagePlan};
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig, RetryController, RetryState};
