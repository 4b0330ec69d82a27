//! Explicit per-run context threaded through every stage call.
//!
//! Everything a stage collaborator needs (run directory, work item, publish
//! privacy, cancellation, event sink, free-form parameters) travels in a
//! [`RunContext`] instead of module-level state.

use crate::artifacts::ArtifactStore;
use crate::cancellation::CancellationToken;
use crate::config::Privacy;
use crate::events::{EventSink, NoOpEventSink};
use crate::registry::WorkItem;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// The context for one run of one work item.
#[derive(Clone)]
pub struct RunContext {
    run_id: Uuid,
    item: WorkItem,
    artifacts: ArtifactStore,
    privacy: Privacy,
    cancellation: Arc<CancellationToken>,
    event_sink: Arc<dyn EventSink>,
    params: BTreeMap<String, String>,
}

impl RunContext {
    /// Creates a new run context.
    #[must_use]
    pub fn new(run_id: Uuid, item: WorkItem, artifacts: ArtifactStore) -> Self {
        Self {
            run_id,
            item,
            artifacts,
            privacy: Privacy::default(),
            cancellation: Arc::new(CancellationToken::new()),
            event_sink: Arc::new(NoOpEventSink),
            params: BTreeMap::new(),
        }
    }

    /// Sets the publish privacy.
    #[must_use]
    pub fn with_privacy(mut self, privacy: Privacy) -> Self {
        self.privacy = privacy;
        self
    }

    /// Shares a cancellation token with the caller.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Adds a collaborator parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the work item.
    #[must_use]
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    /// Returns the run directory.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        self.artifacts.run_dir()
    }

    /// Returns the artifact store for the run directory.
    #[must_use]
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Returns the publish privacy.
    #[must_use]
    pub fn privacy(&self) -> Privacy {
        self.privacy
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancellation
    }

    /// Returns true once the user has cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns the event sink.
    #[must_use]
    pub fn event_sink(&self) -> &Arc<dyn EventSink> {
        &self.event_sink
    }

    /// Returns a collaborator parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns all collaborator parameters.
    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("item", &self.item)
            .field("run_dir", &self.run_dir())
            .field("privacy", &self.privacy)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
