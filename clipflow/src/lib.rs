//! # Clipflow
//!
//! Resumable, retryable, duplicate-aware orchestration for a linear
//! content-production pipeline.
//!
//! Clipflow drives a fixed sequence of opaque stages (search, transcription,
//! script generation, speech synthesis, rendering, publishing) with support for:
//!
//! - **Crash-safe resume**: a per-run ledger plus on-disk artifacts decide
//!   which stages are skipped, retried or run
//! - **Bounded retries**: exponential backoff with jitter, one critical failure
//!   once the budget is spent
//! - **Duplicate detection**: a batch-level registry of published items,
//!   rebuildable from the published catalog
//! - **Stop-on-failure batches**: a pre-flight plan and a five-way report
//! - **Cancellation**: a user interrupt is recorded and exits with code 130
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use clipflow::prelude::*;
//!
//! let config = ClipflowConfig::load(&root)?;
//! let registry = DuplicateRegistry::open(config.registry_path_in(&root));
//! let mut scheduler = BatchScheduler::from_config(&config, &root, registry)?;
//!
//! let items = parse_batch("Dune | Frank Herbert\nEmma | Jane Austen\n")?;
//! let report = scheduler.run(&items).await;
//! std::process::exit(report.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod batch;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod pipeline;
pub mod registry;
pub mod stages;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::ArtifactStore;
    pub use crate::batch::{parse_batch, BatchPlan, BatchReport, BatchScheduler, PlanAction};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{ClipflowConfig, Privacy};
    pub use crate::context::RunContext;
    pub use crate::core::{RunState, StageRecord, StageStatus};
    pub use crate::errors::{
        ClipflowError, CriticalStageFailure, StageError, StageErrorKind, EXIT_CANCELLED,
        EXIT_FAILURE, EXIT_OK,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::ledger::RunLedger;
    pub use crate::pipeline::{
        PipelineExecutor, RetryConfig, RetryController, RunOutcome, StageAction,
    };
    pub use crate::registry::{DuplicateRegistry, RegistryEntry, RegistryStatus, WorkItem};
    pub use crate::stages::{CommandStage, FnStage, StageHandler, StageOutcome, StageSpec};
}
