//! Core domain model types for clipflow.
//!
//! - Stage status and run state enums
//! - Immutable stage attempt records

mod record;
mod status;

pub use record::StageRecord;
pub use status::{RunState, StageStatus};
