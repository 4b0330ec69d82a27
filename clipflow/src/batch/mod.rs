//! Batch input parsing and the stop-on-failure batch scheduler.

mod input;
mod scheduler;

pub use input::{parse_batch, read_batch_file};
pub use scheduler::{BatchPlan, BatchReport, BatchScheduler, FailedItem, PlanAction, PlanEntry};
