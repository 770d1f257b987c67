//! Inspect relay profiles and checkpoints.
//!
//! Set `RUST_LOG` to control log output (default `info`).
//!
//! # Examples
//!
//! ```sh
//! # Which profile, capacities and zone limits a 32k window gets
//! relay profile --context 32768
//!
//! # Pin a profile by name
//! relay profile --context 200000 --profile aggressive
//!
//! # Checkpoints under a data directory
//! relay checkpoints --data-dir .relay list
//! relay checkpoints --data-dir .relay show checkpoint-1739000000000-ab12
//! relay checkpoints --data-dir .relay verify checkpoint-1739000000000-ab12 --workdir .
//! ```

use clap::{Parser, Subcommand};
use relay_rs::agent::config::OrchestratorConfig;
use relay_rs::checkpoint::{CheckpointManager, GitProbe, StaticProbe, WorkspaceProbe};
use relay_rs::context::{AdaptiveOptimizer, ContextWindowManager, WorkingMemory};
use relay_rs::error::Result;
use relay_rs::memory::ArtifactStore;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "relay", about = "Inspect relay profiles and checkpoints")]
struct Cli {
    /// JSON config file. Missing fields take their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the optimization profile, working memory capacity and zone
    /// limits for a context window.
    Profile {
        /// Context window in tokens
        #[arg(long)]
        context: usize,

        /// Profile name overriding automatic selection
        #[arg(long)]
        profile: Option<String>,
    },
    /// List, show or verify checkpoints.
    Checkpoints {
        /// Data directory (defaults to the config's `data_dir`)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Summaries of every checkpoint, oldest first
    List,
    /// Print one checkpoint as JSON
    Show { id: String },
    /// Run the resume post-check against a workspace
    Verify {
        id: String,

        /// Git working directory to check the branch against
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn show_profile(config: &OrchestratorConfig, context: usize, profile: Option<String>) -> Result<()> {
    let selected = AdaptiveOptimizer::new()
        .with_override(profile.or_else(|| config.profile_override.clone()))
        .select_profile(context);
    let window = ContextWindowManager::with_thresholds(context, config.utilization_limit, config.zones)?;
    let capacity = WorkingMemory::for_context(context, &config.working_memory).capacity();
    let snapshot = window.snapshot();

    println!("profile:               {}", selected.name);
    println!("summarization trigger: {} tokens", selected.summarization_trigger_tokens);
    println!(
        "checkpoint cadence:    every {} min or {} ops",
        selected.checkpoint_interval.as_secs() / 60,
        selected.checkpoint_op_threshold
    );
    println!("target reduction:      {:.0}%", selected.target_reduction * 100.0);
    println!(
        "working memory:        {} ops / {} tokens",
        capacity.max_operations, capacity.max_tokens
    );
    println!(
        "effective window:      {} of {} tokens",
        snapshot.effective_max, snapshot.max_tokens
    );
    let limits = snapshot.limits;
    println!(
        "zone limits:           monitor {} / yellow {} / orange {} / red {}",
        limits.monitor, limits.yellow, limits.orange, limits.red
    );
    Ok(())
}

async fn checkpoints(
    config: &OrchestratorConfig,
    data_dir: Option<PathBuf>,
    action: CheckpointAction,
) -> Result<()> {
    let config = match data_dir {
        Some(dir) => config.clone().with_data_dir(dir),
        None => config.clone(),
    };
    let probe: Arc<dyn WorkspaceProbe> = match &action {
        CheckpointAction::Verify {
            workdir: Some(dir), ..
        } => Arc::new(GitProbe::new(dir)),
        _ => Arc::new(StaticProbe::default()),
    };
    let profile = AdaptiveOptimizer::new()
        .with_override(config.profile_override.clone())
        .select_profile(config.context_window);
    let manager = CheckpointManager::open(
        config.checkpoints_dir(),
        config.checkpoint.clone(),
        config.zones,
        profile,
        probe,
        ArtifactStore::open(config.memory_dir().join("artifacts"))?,
    )?;

    match action {
        CheckpointAction::List => {
            let summaries = manager.list()?;
            if summaries.is_empty() {
                println!("no checkpoints in {}", manager.dir().display());
            }
            for s in summaries {
                println!(
                    "{}  {}  {:<16} task={} ops={} verified={}",
                    s.id,
                    s.created_at.format("%Y-%m-%d %H:%M:%S"),
                    s.trigger,
                    s.task_id.as_deref().unwrap_or("-"),
                    s.operations,
                    s.verified
                );
            }
        }
        CheckpointAction::Show { id } => {
            let checkpoint = manager.load(&id)?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        CheckpointAction::Verify { id, .. } => {
            let result = manager.verify(&id).await?;
            for check in &result.checks {
                println!(
                    "[{}] {}: {}",
                    if check.passed { "ok" } else { "FAIL" },
                    check.name,
                    check.detail
                );
            }
            if !result.verified {
                eprintln!("checkpoint {id} failed verification");
                process::exit(2);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path),
        None => Ok(OrchestratorConfig::default()),
    };
    let result = match config {
        Ok(config) => match cli.command {
            Command::Profile { context, profile } => show_profile(&config, context, profile),
            Command::Checkpoints { data_dir, action } => {
                checkpoints(&config, data_dir, action).await
            }
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
