use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use auto_build::config::validate_spec_name;
use auto_build::dispatch::StopReason;
use auto_build::git_worktree::{ReleaseOutcome, WorktreeRegistry, WorktreeRole};
use auto_build::reconcile::recover;
use auto_build::runner::{render_progress, RunOptions, Runner};
use auto_build::{ChunkStatus, CommandAgent, Config, Error, Layout, PlanStore, ResumeState};

/// Plans a spec with an AI coding agent and builds it chunk by chunk in git worktrees
#[derive(Parser)]
#[command(name = "auto-build", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory (defaults to current)
    #[arg(short = 'C', long, global = true)]
    project_dir: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan if needed, then build every pending chunk
    Run {
        spec: String,
        /// Don't ask before resuming a partially built spec
        #[arg(long)]
        auto_continue: bool,
        /// Parallel workers (1 = sequential in the staging worktree)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Show progress for one spec, or every spec with a plan
    Status { spec: Option<String> },
    /// Reset chunks left in progress by an interrupted run
    Reconcile { spec: String },
    /// Put a failed or blocked chunk back to pending
    Reset { spec: String, chunk: String },
    /// Merge the staging branch into the base branch and remove its worktree
    Merge { spec: String },
    /// Delete every worktree and branch of a spec
    Discard { spec: String },
    /// List files changed on the staging branch
    Review { spec: String },
    /// Drop worktree records and directories git no longer knows about
    Prune { spec: String },
}

impl Commands {
    fn spec(&self) -> Option<&str> {
        match self {
            Commands::Run { spec, .. }
            | Commands::Reconcile { spec }
            | Commands::Reset { spec, .. }
            | Commands::Merge { spec }
            | Commands::Discard { spec }
            | Commands::Review { spec }
            | Commands::Prune { spec } => Some(spec),
            Commands::Status { spec } => spec.as_deref(),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn execute(cli: Cli) -> Result<i32> {
    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::load(&project_dir).context("Failed to load configuration")?;
    if let Some(spec) = cli.command.spec() {
        validate_spec_name(spec)?;
    }
    let layout = Layout::new(project_dir.clone(), &config);
    let store = PlanStore::new(layout.clone());

    match cli.command {
        Commands::Run {
            spec,
            auto_continue,
            workers,
        } => {
            let registry = open_registry(&layout, &config)?;
            handle_run(&config, &layout, &store, &registry, spec, auto_continue, workers)
        }
        Commands::Status { spec } => handle_status(&layout, &store, spec.as_deref()),
        Commands::Reconcile { spec } => {
            let (_, reset) = recover(&store, &spec)?;
            if reset.is_empty() {
                println!("✅ Nothing to reconcile for '{}'", spec);
            } else {
                println!("🔄 Reset to pending: {}", reset.join(", "));
            }
            Ok(0)
        }
        Commands::Reset { spec, chunk } => handle_reset(&store, &spec, &chunk),
        Commands::Merge { spec } => {
            let registry = open_registry(&layout, &config)?;
            handle_merge(&store, &registry, &spec)
        }
        Commands::Discard { spec } => {
            let registry = open_registry(&layout, &config)?;
            handle_discard(&registry, &spec)
        }
        Commands::Review { spec } => {
            let registry = open_registry(&layout, &config)?;
            handle_review(&registry, &spec)
        }
        Commands::Prune { spec } => {
            let registry = open_registry(&layout, &config)?;
            let report = registry.prune_stale(&spec);
            for record in &report.removed_records {
                println!("🧹 Dropped stale record {}", record);
            }
            for dir in &report.removed_dirs {
                println!("🧹 Removed orphaned directory {}", dir.display());
            }
            for error in &report.errors {
                eprintln!("⚠️  {}", error);
            }
            if report.removed_records.is_empty() && report.removed_dirs.is_empty() {
                println!("✅ Nothing stale for '{}'", spec);
            }
            Ok(0)
        }
    }
}

fn open_registry(layout: &Layout, config: &Config) -> Result<WorktreeRegistry> {
    WorktreeRegistry::open(layout.clone(), config.base_branch.as_deref())
        .context("auto-build needs a git repository with at least one commit")
}

fn handle_run(
    config: &Config,
    layout: &Layout,
    store: &PlanStore,
    registry: &WorktreeRegistry,
    spec: String,
    auto_continue: bool,
    workers: Option<usize>,
) -> Result<i32> {
    let agent = CommandAgent::from_config(config)?;
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        if !flag.swap(true, Ordering::SeqCst) {
            eprintln!("\n⚠️  Interrupted: waiting for running chunks, nothing new will start");
        }
    })
    .context("Failed to install Ctrl-C handler")?;

    let options = RunOptions {
        spec: spec.clone(),
        workers: workers.unwrap_or(config.max_workers).max(1),
        auto_continue,
    };
    if options.workers > 1 {
        println!("🚀 Building '{}' with {} parallel workers", spec, options.workers);
    } else {
        println!("🚀 Building '{}'", spec);
    }

    let summary = Runner::new(config, layout, store, registry, &agent)
        .with_interrupt(interrupted)
        .run(&options)
        .with_context(|| format!("Run of '{}' failed", spec))?;

    if summary.declined {
        println!("👋 Stopped. Run 'auto-build run {}' again when ready", spec);
        return Ok(0);
    }

    if let Ok(plan) = store.load(&spec) {
        println!("\n{}", render_progress(&plan));
    }

    match summary.dispatch.stopped {
        Some(StopReason::Paused) => {
            println!(
                "⏸️  Paused. Remove {} and run again to resume",
                layout.pause_file(&spec).display()
            );
        }
        Some(StopReason::Interrupted) => {
            println!("⏹️  Interrupted. Run 'auto-build run {}' to resume", spec);
        }
        None => {}
    }

    if summary.state == ResumeState::AllComplete && summary.stats.is_complete() {
        println!("✅ All chunks completed!");
        println!(
            "📝 Next step: 'auto-build review {0}' then 'auto-build merge {0}'",
            spec
        );
    } else if summary.stats.failed > 0 {
        println!(
            "💡 Fix the cause, then 'auto-build reset {} <chunk>' to retry a failed chunk",
            spec
        );
    }

    Ok(summary.exit_code())
}

fn handle_status(layout: &Layout, store: &PlanStore, spec: Option<&str>) -> Result<i32> {
    let specs = match spec {
        Some(spec) => vec![spec.to_string()],
        None => list_specs(&layout.specs_dir())?,
    };
    if specs.is_empty() {
        println!("No specs planned yet. Start one with 'auto-build run <spec>'");
        return Ok(0);
    }

    for spec in &specs {
        match store.load(spec) {
            Ok(plan) => {
                println!("{}", render_progress(&plan));
                if layout.pause_file(spec).exists() {
                    println!("   ⏸️  Paused");
                }
            }
            Err(e) if e.is_not_found() => println!("📊 {}\n   Not planned yet", spec),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(0)
}

fn list_specs(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut specs: Vec<String> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    specs.sort();
    Ok(specs)
}

fn handle_reset(store: &PlanStore, spec: &str, chunk: &str) -> Result<i32> {
    let previous = store.update(spec, |plan| {
        let current = plan
            .chunk(chunk)
            .map(|c| c.chunk.status)
            .ok_or_else(|| Error::UnknownChunk(chunk.to_string()))?;
        if current == ChunkStatus::Completed {
            return Err(Error::InvalidTransition {
                from: format!("chunk {} is completed", chunk),
                event: "reset".to_string(),
            });
        }
        plan.set_chunk_status(chunk, ChunkStatus::Pending, None)
    })?;
    println!("🔁 {} is pending again (was {})", chunk, previous);
    Ok(0)
}

fn handle_merge(store: &PlanStore, registry: &WorktreeRegistry, spec: &str) -> Result<i32> {
    let Some(staging) = registry.find(spec, WorktreeRole::Staging)? else {
        bail!("'{}' has no staging worktree to merge", spec);
    };
    if let Ok(plan) = store.load(spec) {
        let stats = plan.stats();
        if !stats.is_complete() {
            println!(
                "⚠️  Merging with {}/{} chunks completed",
                stats.completed, stats.total
            );
        }
    }

    match registry.release(&staging, ReleaseOutcome::Merged) {
        Ok(()) => {
            println!("✅ Merged {} into {}", staging.branch, staging.base_branch);
            Ok(0)
        }
        Err(e) if e.is_per_chunk() => {
            eprintln!("❌ {}", e);
            println!("💡 The worktree is kept at {}", staging.path.display());
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

fn handle_discard(registry: &WorktreeRegistry, spec: &str) -> Result<i32> {
    let mut records = registry.records(spec)?.worktrees;
    if records.is_empty() {
        println!("Nothing to discard for '{}'", spec);
        return Ok(0);
    }
    // Workers branch off staging, so they go first
    records.sort_by_key(|w| w.role == WorktreeRole::Staging);
    for worktree in records {
        registry.release(&worktree, ReleaseOutcome::Discarded)?;
        println!("🗑️  Discarded {} ({})", worktree.role, worktree.branch);
    }
    Ok(0)
}

fn handle_review(registry: &WorktreeRegistry, spec: &str) -> Result<i32> {
    let Some(staging) = registry.find(spec, WorktreeRole::Staging)? else {
        bail!("'{}' has no staging worktree", spec);
    };
    let changes = registry.changed_files(&staging)?;
    println!(
        "📋 {} vs {} ({})",
        staging.branch,
        staging.base_branch,
        staging.path.display()
    );
    if changes.is_empty() {
        println!("   No changes");
    }
    for change in changes {
        println!("   {}", change);
    }
    Ok(0)
}
