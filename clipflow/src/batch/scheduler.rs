//! Pre-flight planning and stop-on-failure execution of a batch.
//!
//! Every item is classified before anything runs. Items then execute
//! strictly in order; the first non-zero run exit ends the batch and every
//! remaining item is reported as skipped after failure.

use crate::artifacts::ArtifactStore;
use crate::cancellation::CancellationToken;
use crate::config::{ClipflowConfig, Privacy};
use crate::context::RunContext;
use crate::errors::{ClipflowError, Result, EXIT_CANCELLED, EXIT_FAILURE, EXIT_OK};
use crate::events::{EventSink, NoOpEventSink};
use crate::ledger::RunLedger;
use crate::pipeline::{exit_code, PipelineExecutor};
use crate::registry::{DuplicateRegistry, RegistryEntry, RunManifest, WorkItem};
use crate::utils::{compact_timestamp, generate_run_id, short_digest, slugify};
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pre-flight decision for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    /// Already published.
    Skip,
    /// An unfinished run exists.
    Resume,
    /// Start a new run.
    Process,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skip => "skip",
            Self::Resume => "resume",
            Self::Process => "process",
        };
        write!(f, "{s}")
    }
}

/// One planned item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    /// The work item.
    pub item: WorkItem,
    /// The decision.
    pub action: PlanAction,
    /// Why.
    pub rationale: String,
    /// Run folder recorded in the registry, for resumes.
    pub run_folder: Option<PathBuf>,
}

/// The pre-flight plan of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    /// Entries in input order.
    pub entries: Vec<PlanEntry>,
}

impl BatchPlan {
    /// Classifies every item against the registry.
    ///
    /// With `no_skip`, published items are planned as fresh work.
    #[must_use]
    pub fn build(items: &[WorkItem], registry: &DuplicateRegistry, no_skip: bool) -> Self {
        let entries = items
            .iter()
            .map(|item| match registry.lookup(item) {
                Some(entry) if entry.is_done() && no_skip => PlanEntry {
                    item: item.clone(),
                    action: PlanAction::Process,
                    rationale: format!(
                        "published as {}; reprocessing (--no-skip)",
                        entry.external_refs.join(", ")
                    ),
                    run_folder: None,
                },
                Some(entry) if entry.is_done() => PlanEntry {
                    item: item.clone(),
                    action: PlanAction::Skip,
                    rationale: format!("already published ({})", entry.external_refs.join(", ")),
                    run_folder: None,
                },
                Some(entry) => PlanEntry {
                    item: item.clone(),
                    action: PlanAction::Resume,
                    rationale: match &entry.run_folder {
                        Some(folder) => format!("unfinished run in {}", folder.display()),
                        None => "unfinished run".to_string(),
                    },
                    run_folder: entry.run_folder.clone(),
                },
                None => PlanEntry {
                    item: item.clone(),
                    action: PlanAction::Process,
                    rationale: "not in registry".to_string(),
                    run_folder: None,
                },
            })
            .collect();
        Self { entries }
    }

    /// Number of entries with `action`.
    #[must_use]
    pub fn count(&self, action: PlanAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Renders the plan for display before execution.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!(
            "Batch plan: {} item(s), {} to process, {} to resume, {} to skip\n",
            self.entries.len(),
            self.count(PlanAction::Process),
            self.count(PlanAction::Resume),
            self.count(PlanAction::Skip),
        );
        for (index, entry) in self.entries.iter().enumerate() {
            let _ = writeln!(
                out,
                "  {:>3}. {:<9} {} : {}",
                index + 1,
                format!("[{}]", entry.action),
                entry.item,
                entry.rationale
            );
        }
        out
    }
}

/// A failed item with its run's exit code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    /// The work item.
    pub item: WorkItem,
    /// The run's exit code.
    pub exit_code: i32,
    /// The error shown to the user.
    pub error: String,
}

/// Final partition of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Completed in a new run.
    pub succeeded_fresh: Vec<WorkItem>,
    /// Completed by resuming an earlier run.
    pub succeeded_resumed: Vec<WorkItem>,
    /// The item that ended the batch.
    pub failed: Vec<FailedItem>,
    /// Found in the registry, before or just before execution.
    pub skipped_duplicate: Vec<WorkItem>,
    /// Never attempted because an earlier item failed.
    pub skipped_after_failure: Vec<WorkItem>,
}

impl BatchReport {
    /// Exit code of the batch: the first failing run's code, else 0.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.failed.first().map_or(EXIT_OK, |f| f.exit_code)
    }

    /// Number of items accounted for.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded_fresh.len()
            + self.succeeded_resumed.len()
            + self.failed.len()
            + self.skipped_duplicate.len()
            + self.skipped_after_failure.len()
    }

    /// Renders the report for display.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("Batch report: {} item(s), exit code {}\n", self.total(), self.exit_code());
        let sections: [(&str, Vec<String>); 5] = [
            ("succeeded (fresh)", self.succeeded_fresh.iter().map(ToString::to_string).collect()),
            ("succeeded (resumed)", self.succeeded_resumed.iter().map(ToString::to_string).collect()),
            (
                "failed",
                self.failed
                    .iter()
                    .map(|f| format!("{} (exit {}): {}", f.item, f.exit_code, f.error))
                    .collect(),
            ),
            ("skipped (duplicate)", self.skipped_duplicate.iter().map(ToString::to_string).collect()),
            (
                "skipped (after failure)",
                self.skipped_after_failure.iter().map(ToString::to_string).collect(),
            ),
        ];
        for (label, lines) in sections {
            let _ = writeln!(out, "  {label}: {}", lines.len());
            for line in lines {
                let _ = writeln!(out, "    - {line}");
            }
        }
        out
    }
}

/// How an item ended.
enum ItemResult {
    Fresh,
    Resumed,
    Duplicate,
    Failed { exit_code: i32, error: String },
}

/// Runs a batch against one registry and one executor.
pub struct BatchScheduler {
    registry: DuplicateRegistry,
    executor: PipelineExecutor,
    runs_dir: PathBuf,
    publish_stages: Vec<String>,
    privacy: Privacy,
    no_skip: bool,
    cancellation: Arc<CancellationToken>,
    event_sink: Arc<dyn EventSink>,
}

impl BatchScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(registry: DuplicateRegistry, executor: PipelineExecutor, runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            executor,
            runs_dir: runs_dir.into(),
            publish_stages: vec!["publish".to_string()],
            privacy: Privacy::default(),
            no_skip: false,
            cancellation: Arc::new(CancellationToken::new()),
            event_sink: Arc::new(NoOpEventSink),
        }
    }

    /// Creates a scheduler from the project config.
    pub fn from_config(config: &ClipflowConfig, root: &Path, registry: DuplicateRegistry) -> Result<Self> {
        let executor = PipelineExecutor::from_config(config)?;
        Ok(Self::new(registry, executor, config.runs_dir_in(root))
            .with_publish_stages(config.publish_stages.clone())
            .with_privacy(config.privacy))
    }

    /// Sets the stages whose refs mark an item done.
    #[must_use]
    pub fn with_publish_stages(mut self, stages: Vec<String>) -> Self {
        self.publish_stages = stages;
        self
    }

    /// Sets the publish privacy for every run.
    #[must_use]
    pub fn with_privacy(mut self, privacy: Privacy) -> Self {
        self.privacy = privacy;
        self
    }

    /// Plans published items as fresh work.
    #[must_use]
    pub fn with_no_skip(mut self, no_skip: bool) -> Self {
        self.no_skip = no_skip;
        self
    }

    /// Sets the cancellation token shared with every run.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Sets the event sink shared with every run.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &DuplicateRegistry {
        &self.registry
    }

    /// Returns the registry for mutation (sync).
    pub fn registry_mut(&mut self) -> &mut DuplicateRegistry {
        &mut self.registry
    }

    /// Builds the pre-flight plan.
    #[must_use]
    pub fn plan(&self, items: &[WorkItem]) -> BatchPlan {
        BatchPlan::build(items, &self.registry, self.no_skip)
    }

    /// Executes `plan` in order.
    pub async fn execute(&mut self, plan: &BatchPlan) -> BatchReport {
        let mut report = BatchReport::default();
        self.event_sink
            .emit(
                "batch.started",
                Some(serde_json::json!({"items": plan.entries.len()})),
            )
            .await;

        let mut entries = plan.entries.iter();
        for entry in entries.by_ref() {
            if self.cancellation.is_cancelled() {
                report.failed.push(FailedItem {
                    item: entry.item.clone(),
                    exit_code: EXIT_CANCELLED,
                    error: "batch cancelled before the item started".into(),
                });
                break;
            }

            info!(item = %entry.item, action = %entry.action, "Batch item starting");
            let result = match entry.action {
                PlanAction::Skip => ItemResult::Duplicate,
                PlanAction::Resume => self.resume(entry).await,
                PlanAction::Process => self.process(&entry.item).await,
            };

            match result {
                ItemResult::Fresh => report.succeeded_fresh.push(entry.item.clone()),
                ItemResult::Resumed => report.succeeded_resumed.push(entry.item.clone()),
                ItemResult::Duplicate => report.skipped_duplicate.push(entry.item.clone()),
                ItemResult::Failed { exit_code, error } => {
                    error!(item = %entry.item, exit_code, error = %error, "Batch item failed; stopping batch");
                    report.failed.push(FailedItem {
                        item: entry.item.clone(),
                        exit_code,
                        error,
                    });
                    break;
                }
            }
        }
        report
            .skipped_after_failure
            .extend(entries.map(|e| e.item.clone()));

        self.event_sink
            .emit(
                "batch.completed",
                Some(serde_json::json!({
                    "exit_code": report.exit_code(),
                    "succeeded": report.succeeded_fresh.len() + report.succeeded_resumed.len(),
                    "skipped_after_failure": report.skipped_after_failure.len(),
                })),
            )
            .await;
        report
    }

    /// Plans and executes `items`.
    pub async fn run(&mut self, items: &[WorkItem]) -> BatchReport {
        let plan = self.plan(items);
        info!("{}", plan.render().trim_end());
        self.execute(&plan).await
    }

    async fn resume(&mut self, entry: &PlanEntry) -> ItemResult {
        let Some((run_dir, run_id)) = self.locate_run(entry) else {
            warn!(item = %entry.item, "No run folder found for unfinished item; processing fresh");
            if let Err(e) = self.registry.remove(&entry.item) {
                return failed(&e);
            }
            return self.process(&entry.item).await;
        };

        let store = ArtifactStore::new(&run_dir, self.executor.specs());
        let ledger = RunLedger::load(&run_dir, run_id);
        if ledger.is_empty() && !store.has_any_artifact() {
            warn!(item = %entry.item, run_dir = %run_dir.display(), "Discarding orphan run folder");
            if let Err(e) = std::fs::remove_dir_all(&run_dir) {
                warn!(run_dir = %run_dir.display(), error = %e, "Failed to delete orphan run folder");
            }
            if let Err(e) = self.registry.remove(&entry.item) {
                return failed(&e);
            }
            return self.process(&entry.item).await;
        }

        match self.dispatch(&entry.item, run_dir, run_id).await {
            Ok(()) => ItemResult::Resumed,
            Err(result) => result,
        }
    }

    async fn process(&mut self, item: &WorkItem) -> ItemResult {
        // The registry may have changed since the plan was built.
        self.registry.reload();
        let current = self.registry.lookup(item).cloned();
        let published = current.as_ref().is_some_and(RegistryEntry::is_done);
        if published && !self.no_skip {
            info!(item = %item, "Published since planning; skipping");
            return ItemResult::Duplicate;
        }
        if let Some(entry) = current.filter(|e| !e.is_done()) {
            info!(
                item = %item,
                run_folder = ?entry.run_folder,
                "Started elsewhere since planning; skipping"
            );
            return ItemResult::Duplicate;
        }

        let run_id = generate_run_id();
        let run_dir = self.runs_dir.join(run_folder_name(item));
        if let Err(e) = self.prepare_run(item, &run_dir, run_id, published) {
            return failed(&e);
        }

        match self.dispatch(item, run_dir, run_id).await {
            Ok(()) => ItemResult::Fresh,
            Err(result) => result,
        }
    }

    fn prepare_run(&mut self, item: &WorkItem, run_dir: &Path, run_id: Uuid, published: bool) -> Result<()> {
        std::fs::create_dir_all(run_dir)?;
        RunManifest::new(run_id, item).write(run_dir)?;
        // A reprocessed published item keeps its done entry.
        if !published {
            self.registry.create(item, run_dir)?;
        }
        Ok(())
    }

    fn locate_run(&self, entry: &PlanEntry) -> Option<(PathBuf, Uuid)> {
        let recorded = entry.run_folder.as_ref().filter(|folder| folder.is_dir()).map(|folder| {
            let run_id = RunManifest::read(folder).map_or_else(
                || RunLedger::load(folder, generate_run_id()).run_id(),
                |m| m.run_id,
            );
            (folder.clone(), run_id)
        });
        recorded.or_else(|| {
            RunManifest::scan(&self.runs_dir, &entry.item).map(|(folder, manifest)| (folder, manifest.run_id))
        })
    }

    async fn dispatch(&mut self, item: &WorkItem, run_dir: PathBuf, run_id: Uuid) -> std::result::Result<(), ItemResult> {
        let store = ArtifactStore::new(run_dir, self.executor.specs());
        let ctx = RunContext::new(run_id, item.clone(), store)
            .with_privacy(self.privacy)
            .with_cancellation(self.cancellation.clone())
            .with_event_sink(self.event_sink.clone());

        let result = self.executor.execute(&ctx).await;
        let code = exit_code(&result);
        let outcome = match result {
            Ok(outcome) if code == EXIT_OK => outcome,
            Ok(_) => {
                return Err(ItemResult::Failed {
                    exit_code: code,
                    error: "run did not complete".into(),
                })
            }
            Err(e) => return Err(failed(&e)),
        };

        let refs = outcome.refs_for(&self.publish_stages);
        if let Err(e) = self.registry.set_done(item, refs) {
            return Err(ItemResult::Failed {
                exit_code: EXIT_FAILURE,
                error: e.to_string(),
            });
        }
        Ok(())
    }
}

fn failed(error: &ClipflowError) -> ItemResult {
    ItemResult::Failed {
        exit_code: error.exit_code(),
        error: error.to_string(),
    }
}

/// `<timestamp>-<slug>-<digest>`; the digest keeps same-slug items apart.
fn run_folder_name(item: &WorkItem) -> String {
    let key = format!(
        "{}|{}",
        item.key_title(),
        item.key_author().unwrap_or_default()
    );
    let slug = slugify(&item.title, 40);
    let slug = if slug.is_empty() { "item".to_string() } else { slug };
    format!("{}-{slug}-{}", compact_timestamp(), short_digest(&key, 8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::errors::StageError;
    use crate::events::CollectingEventSink;
    use crate::pipeline::{JitterStrategy, RetryConfig};
    use crate::stages::{FnStage, StageHandler, StageOutcome, StageSpec};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// Two-stage pipeline; items whose title is in `failing` fail at render.
    struct Fixture {
        dir: TempDir,
        failing: Arc<Mutex<HashSet<String>>>,
        renders: Arc<Mutex<Vec<String>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                failing: Arc::default(),
                renders: Arc::default(),
            }
        }

        fn registry(&self) -> DuplicateRegistry {
            DuplicateRegistry::open(self.dir.path().join("registry.json"))
        }

        fn runs_dir(&self) -> PathBuf {
            self.dir.path().join("runs")
        }

        fn scheduler(&self) -> BatchScheduler {
            let specs = vec![
                StageSpec::new("render", ["video.mp4"]),
                StageSpec::new("publish", ["publish.json"]),
            ];
            let failing = self.failing.clone();
            let renders = self.renders.clone();
            let handlers: Vec<Arc<dyn StageHandler>> = vec![
                Arc::new(FnStage::new("render", move |ctx| {
                    renders.lock().push(ctx.item().title.clone());
                    if failing.lock().contains(&ctx.item().title) {
                        return Err(StageError::permanent("encoder crashed"));
                    }
                    std::fs::write(ctx.artifacts().path("video.mp4"), b"v")?;
                    Ok(StageOutcome::empty())
                })),
                Arc::new(FnStage::new("publish", |ctx| {
                    std::fs::write(ctx.artifacts().path("publish.json"), b"{}")?;
                    Ok(StageOutcome::new(vec![format!("vid-{}", ctx.item().key_title())]))
                })),
            ];
            let retry = RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay_ms(1)
                .with_max_delay_ms(1)
                .with_jitter(JitterStrategy::None);
            let executor = PipelineExecutor::new(specs, handlers, retry).unwrap();
            BatchScheduler::new(self.registry(), executor, self.runs_dir())
        }

        fn fail(&self, title: &str) {
            self.failing.lock().insert(title.to_string());
        }

        fn renders(&self) -> Vec<String> {
            self.renders.lock().clone()
        }
    }

    fn items(titles: &[&str]) -> Vec<WorkItem> {
        titles.iter().map(|t| WorkItem::new(*t, None)).collect()
    }

    #[test]
    fn test_plan_classifies_items() {
        let fx = Fixture::new();
        let mut registry = fx.registry();
        registry.set_done(&WorkItem::new("Dune", None), vec!["vid-1".into()]).unwrap();
        registry.create(&WorkItem::new("Emma", None), &fx.runs_dir().join("emma")).unwrap();

        let batch = items(&["Dune", "Emma", "Solaris"]);
        let plan = BatchPlan::build(&batch, &registry, false);
        let actions: Vec<_> = plan.entries.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![PlanAction::Skip, PlanAction::Resume, PlanAction::Process]);

        let rendered = plan.render();
        assert!(rendered.contains("1 to skip"));
        assert!(rendered.contains("already published (vid-1)"));

        let forced = BatchPlan::build(&batch, &registry, true);
        assert_eq!(forced.entries[0].action, PlanAction::Process);
    }

    #[tokio::test]
    async fn test_published_item_is_never_rerun() {
        let fx = Fixture::new();
        fx.registry()
            .set_done(&WorkItem::new("Dune", None), vec!["vid-1".into()])
            .unwrap();

        let report = fx.scheduler().run(&items(&["dune"])).await;
        assert_eq!(report.skipped_duplicate, items(&["dune"]));
        assert!(fx.renders().is_empty());
        assert_eq!(report.exit_code(), EXIT_OK);
    }

    #[tokio::test]
    async fn test_fresh_items_are_marked_done() {
        let fx = Fixture::new();
        let report = fx.scheduler().run(&items(&["Dune", "Emma"])).await;

        assert_eq!(report.succeeded_fresh, items(&["Dune", "Emma"]));
        let registry = fx.registry();
        let entry = registry.lookup(&WorkItem::new("Dune", None)).unwrap();
        assert!(entry.is_done());
        assert_eq!(entry.external_refs, vec!["vid-dune"]);
        let run_folder = entry.run_folder.clone().unwrap();
        assert!(run_folder.join("run.json").is_file());
        assert!(run_folder.starts_with(fx.runs_dir()));
    }

    #[tokio::test]
    async fn test_failure_stops_batch() {
        let fx = Fixture::new();
        fx.fail("B");
        let sink = Arc::new(CollectingEventSink::new());
        let mut scheduler = fx.scheduler().with_event_sink(sink.clone());

        let report = scheduler.run(&items(&["A", "B", "C", "D"])).await;

        assert_eq!(report.succeeded_fresh, items(&["A"]));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].item, WorkItem::new("B", None));
        assert_eq!(report.failed[0].exit_code, EXIT_FAILURE);
        assert!(report.failed[0].error.contains("render"));
        assert_eq!(report.skipped_after_failure, items(&["C", "D"]));
        assert_eq!(report.exit_code(), EXIT_FAILURE);
        assert_eq!(report.total(), 4);
        assert_eq!(fx.renders(), vec!["A", "B"]);

        let entry = fx.registry().lookup(&WorkItem::new("B", None)).cloned().unwrap();
        assert!(!entry.is_done());
        assert_eq!(sink.event_types().last().map(String::as_str), Some("batch.completed"));
    }

    #[tokio::test]
    async fn test_failed_item_resumes_in_same_folder() {
        let fx = Fixture::new();
        fx.fail("B");
        fx.scheduler().run(&items(&["B"])).await;
        let first_folder = fx
            .registry()
            .lookup(&WorkItem::new("B", None))
            .and_then(|e| e.run_folder.clone())
            .unwrap();

        fx.failing.lock().clear();
        let mut scheduler = fx.scheduler();
        assert_eq!(scheduler.plan(&items(&["B"])).entries[0].action, PlanAction::Resume);
        let report = scheduler.run(&items(&["B"])).await;

        assert_eq!(report.succeeded_resumed, items(&["B"]));
        let entry = fx.registry().lookup(&WorkItem::new("B", None)).cloned().unwrap();
        assert!(entry.is_done());
        assert_eq!(entry.run_folder, Some(first_folder.clone()));

        let ledger = RunLedger::load(&first_folder, Uuid::new_v4());
        assert!(ledger.read().iter().any(|r| r.status == StageStatus::Failed));
        assert_eq!(ledger.last_failed_stage(), None);
    }

    #[tokio::test]
    async fn test_stale_run_folder_falls_back_to_manifest_scan() {
        let fx = Fixture::new();
        let item = WorkItem::new("Dune", None);
        let real = fx.runs_dir().join("real");
        std::fs::create_dir_all(&real).unwrap();
        let run_id = Uuid::new_v4();
        RunManifest::new(run_id, &item).write(&real).unwrap();
        std::fs::write(real.join("video.mp4"), b"v").unwrap();
        let mut ledger = RunLedger::load(&real, run_id);
        ledger
            .append("render", StageStatus::Ok, 1, std::time::Duration::ZERO, None)
            .unwrap();

        fx.registry().create(&item, &fx.runs_dir().join("moved-away")).unwrap();

        let report = fx.scheduler().run(&[item.clone()]).await;
        assert_eq!(report.succeeded_resumed, vec![item.clone()]);
        // render was verified complete in the scanned folder.
        assert!(fx.renders().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_folder_is_discarded_and_reprocessed() {
        let fx = Fixture::new();
        let item = WorkItem::new("Dune", None);
        let orphan = fx.runs_dir().join("orphan");
        std::fs::create_dir_all(&orphan).unwrap();
        fx.registry().create(&item, &orphan).unwrap();

        let report = fx.scheduler().run(&[item.clone()]).await;
        assert_eq!(report.succeeded_fresh, vec![item.clone()]);
        assert!(!orphan.exists());
        let entry = fx.registry().lookup(&item).cloned().unwrap();
        assert_ne!(entry.run_folder, Some(orphan));
    }

    #[tokio::test]
    async fn test_just_in_time_duplicate_check() {
        let fx = Fixture::new();
        let mut scheduler = fx.scheduler();
        let plan = scheduler.plan(&items(&["Dune"]));
        assert_eq!(plan.entries[0].action, PlanAction::Process);

        // Another process publishes the item after planning.
        fx.registry()
            .set_done(&WorkItem::new("Dune", None), vec!["vid-other".into()])
            .unwrap();

        let report = scheduler.execute(&plan).await;
        assert_eq!(report.skipped_duplicate, items(&["Dune"]));
        assert!(fx.renders().is_empty());
    }

    #[tokio::test]
    async fn test_item_started_elsewhere_after_planning_is_left_alone() {
        let fx = Fixture::new();
        let mut scheduler = fx.scheduler();
        let plan = scheduler.plan(&items(&["Dune"]));
        assert_eq!(plan.entries[0].action, PlanAction::Process);

        let other = fx.dir.path().join("other-machine-run");
        fx.registry().create(&WorkItem::new("Dune", None), &other).unwrap();

        let report = scheduler.execute(&plan).await;
        assert_eq!(report.skipped_duplicate, items(&["Dune"]));
        assert!(report.succeeded_fresh.is_empty());
        assert!(fx.renders().is_empty());

        let entry = fx.registry().lookup(&WorkItem::new("Dune", None)).cloned().unwrap();
        assert_eq!(entry.run_folder, Some(other));
        assert!(!entry.is_done());
    }

    #[tokio::test]
    async fn test_cancelled_batch_exits_130() {
        let fx = Fixture::new();
        let token = Arc::new(CancellationToken::new());
        token.cancel("ctrl-c");
        let mut scheduler = fx.scheduler().with_cancellation(token);

        let report = scheduler.run(&items(&["A", "B"])).await;
        assert_eq!(report.exit_code(), EXIT_CANCELLED);
        assert_eq!(report.skipped_after_failure, items(&["B"]));
    }

    #[test]
    fn test_run_folder_name() {
        let name = run_folder_name(&WorkItem::new("Dune: Part Two!", Some("Frank Herbert")));
        assert!(name.contains("-dune-part-two-"));
        assert_ne!(name, run_folder_name(&WorkItem::new("Dune: Part Two!", None)));
    }

    #[test]
    fn test_report_render() {
        let report = BatchReport {
            succeeded_fresh: items(&["A"]),
            failed: vec![FailedItem {
                item: WorkItem::new("B", None),
                exit_code: 1,
                error: "Stage 'render' failed".into(),
            }],
            skipped_after_failure: items(&["C"]),
            ..BatchReport::default()
        };
        let text = report.render();
        assert!(text.contains("exit code 1"));
        assert!(text.contains("B (exit 1): Stage 'render' failed"));
        assert!(text.contains("skipped (after failure): 1"));
    }
}
