//! # ensemble
//!
//! Command-line front end: runs a task with a scripted team and inspects
//! stored task records.

#![deny(unsafe_code)]

mod team_file;
mod tools;
mod wiring;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use ensemble_core::ids::TaskId;
use ensemble_core::task::TaskStatus;
use ensemble_settings::EnsembleSettings;
use ensemble_telemetry::{init_telemetry, TelemetryConfig};

use crate::team_file::TeamFile;

#[derive(Parser, Debug)]
#[command(name = "ensemble", about = "Run multi-agent tasks and inspect their records")]
struct Cli {
    /// Settings file (defaults to ~/.ensemble/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Task database path (overrides settings).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task with a scripted team, printing stream chunks as JSON lines.
    Run {
        /// Team description file.
        #[arg(long)]
        team: PathBuf,

        /// Overrides the configured round limit.
        #[arg(long)]
        max_rounds: Option<u32>,

        prompt: String,
    },
    /// Inspect stored tasks.
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
}

#[derive(Subcommand, Debug)]
enum TasksCommand {
    /// Most recent tasks first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Full record of one task as JSON.
    Show { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => ensemble_settings::load_settings_from_path(path),
        None => ensemble_settings::load_settings(),
    }
    .context("failed to load settings")?;

    let _telemetry = init_telemetry(TelemetryConfig::from_level_str(
        &settings.logging.level,
        settings.logging.json,
    ));

    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| ensemble_settings::resolve_db_path(&settings));

    match cli.command {
        Command::Run {
            team,
            max_rounds,
            prompt,
        } => run(settings, &db_path, &team, max_rounds, &prompt).await,
        Command::Tasks {
            command: TasksCommand::List { limit },
        } => list_tasks(&db_path, limit).await,
        Command::Tasks {
            command: TasksCommand::Show { id },
        } => show_task(&db_path, &id).await,
    }
}

async fn run(
    mut settings: EnsembleSettings,
    db_path: &std::path::Path,
    team_path: &std::path::Path,
    max_rounds: Option<u32>,
    prompt: &str,
) -> Result<()> {
    if let Some(n) = max_rounds {
        if n == 0 {
            bail!("--max-rounds must be at least 1");
        }
        settings.orchestrator.max_rounds = n;
    }

    let team_file = TeamFile::load(team_path)?;
    let bus = wiring::event_bus(&settings.bus);
    let tasks = Arc::new(wiring::open_task_manager(db_path, Some(bus.clone()))?);
    let orchestrator = wiring::build_orchestrator(&settings, &team_file, tasks, bus.clone())?;

    let mut task_run = orchestrator.start(prompt).await.context("failed to start task")?;
    info!(task_id = %task_run.task_id(), "running");

    while let Some(chunk) = task_run.next_chunk().await {
        println!("{}", serde_json::to_string(&chunk)?);
    }
    let outcome = task_run.outcome().await?;
    println!("{}", serde_json::to_string(&outcome)?);

    let dropped = bus.stop().await;
    if dropped > 0 {
        warn!(dropped, "event handlers cut short on shutdown");
    }

    if outcome.status == TaskStatus::Failed {
        bail!(
            "task {} failed: {}",
            outcome.task_id,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn list_tasks(db_path: &std::path::Path, limit: u32) -> Result<()> {
    let tasks = wiring::open_task_manager(db_path, None)?;
    for task in tasks.list_tasks(limit).await? {
        let description: String = task.description.chars().take(60).collect();
        println!(
            "{}  {:<13} round {:<3} {}  {}",
            task.id,
            task.status.as_str(),
            task.round,
            task.updated_at.format("%Y-%m-%d %H:%M:%S"),
            description
        );
    }
    Ok(())
}

async fn show_task(db_path: &std::path::Path, id: &str) -> Result<()> {
    let tasks = wiring::open_task_manager(db_path, None)?;
    let Some(task) = tasks.get_task(&TaskId::from_raw(id)).await? else {
        bail!("task not found: {id}");
    };
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}
