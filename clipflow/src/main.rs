//! `clipflow` command-line entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clipflow::batch::{read_batch_file, BatchScheduler};
use clipflow::cancellation::CancellationToken;
use clipflow::config::{find_project_root, ClipflowConfig, Privacy};
use clipflow::errors::EXIT_FAILURE;
use clipflow::events::LoggingEventSink;
use clipflow::registry::sync::{rebuild_if_empty, source_from_config};
use clipflow::registry::DuplicateRegistry;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Resumable, duplicate-aware batch production runner
#[derive(Parser)]
#[command(name = "clipflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a batch of work items through the production pipeline")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run a batch file (`Title | Author` per line)
    RunBatch {
        /// Batch input file
        #[arg(short, long)]
        input: PathBuf,

        /// Reprocess items that are already published
        #[arg(long)]
        no_skip: bool,

        /// Publish visibility (public, unlisted, private)
        #[arg(long, env = "CLIPFLOW_PRIVACY")]
        privacy: Option<Privacy>,

        /// Config file; defaults to clipflow.json in the project root
        #[arg(long, env = "CLIPFLOW_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clipflow={level},warn").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn load_config(explicit: Option<&Path>) -> Result<(PathBuf, ClipflowConfig)> {
    match explicit {
        Some(path) => {
            let config = ClipflowConfig::from_file(path)?;
            let root = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            Ok((root, config))
        }
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            let root = find_project_root(&cwd)?;
            let config = ClipflowConfig::load(&root)?;
            Ok((root, config))
        }
    }
}

async fn run_batch(
    input: &Path,
    no_skip: bool,
    privacy: Option<Privacy>,
    config_path: Option<&Path>,
) -> Result<i32> {
    let (root, config) = load_config(config_path)?;
    let items = read_batch_file(input)
        .with_context(|| format!("Failed to read batch input {}", input.display()))?;
    tracing::info!(root = %root.display(), items = items.len(), "Loaded batch");

    let mut registry = DuplicateRegistry::open(config.registry_path_in(&root));
    if let Some(sync) = &config.sync {
        let source = source_from_config(sync, &root)?;
        rebuild_if_empty(&mut registry, source.as_ref()).await;
    }

    let token = Arc::new(CancellationToken::new());
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; cancelling");
            signal_token.cancel("interrupted by user");
        }
    });

    let mut scheduler = BatchScheduler::from_config(&config, &root, registry)?
        .with_no_skip(no_skip)
        .with_privacy(privacy.unwrap_or(config.privacy))
        .with_cancellation(token)
        .with_event_sink(Arc::new(LoggingEventSink::new()));

    let plan = scheduler.plan(&items);
    println!("{}", plan.render());
    let report = scheduler.execute(&plan).await;
    println!("{}", report.render());
    Ok(report.exit_code())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Commands::RunBatch {
            input,
            no_skip,
            privacy,
            config,
        } => runtime.block_on(run_batch(&input, no_skip, privacy, config.as_deref())),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_FAILURE
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
