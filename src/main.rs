use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use overseer_core::config::{AppConfig, CheckpointConfig};
use overseer_core::traits::CheckpointSink;
use overseer_core::types::WorkflowState;

use overseer_supervisor::{
    CheckpointStore, Executor, LogStatus, RunLogger, SupervisorContext, WorkflowFile,
    WorkflowResult,
};

#[derive(Parser)]
#[command(name = "overseer", version, about = "Workflow supervisor with recovery, circuit breaking and escalation")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "overseer.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition
    Run {
        /// Workflow TOML file
        workflow: PathBuf,
        /// Initial state as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// Workflow/session ID (auto-generated if not provided)
        #[arg(short, long)]
        session: Option<String>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config,
    /// Inspect stored checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List sessions that have checkpoints
    Sessions,
    /// List checkpoints of a session, newest first
    List {
        session: String,
    },
    /// Print one checkpoint
    Show {
        checkpoint_id: String,
    },
    /// Delete every checkpoint of a session
    Delete {
        session: String,
    },
    /// Delete checkpoints older than the given number of days
    Cleanup {
        #[arg(long, default_value = "30")]
        days: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("overseer=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "overseer", &mut std::io::stdout());
        }
        Commands::Run {
            workflow,
            input,
            session,
            json,
        } => {
            let config = load_config(&cli.config)?;
            let result = run_workflow(&config, &workflow, input.as_deref(), session).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
            if !result.succeeded() {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Checkpoints { action } => {
            let config = load_config(&cli.config)?;
            handle_checkpoints(&config.checkpoint.unwrap_or_default(), action)?;
        }
    }

    Ok(())
}

/// Load the config file, or fall back to defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        Ok(AppConfig::load(path)?)
    } else {
        info!(path = %path.display(), "No config file found, using defaults");
        Ok(AppConfig::default())
    }
}

async fn run_workflow(
    config: &AppConfig,
    path: &Path,
    input: Option<&str>,
    session: Option<String>,
) -> anyhow::Result<WorkflowResult> {
    let definition = WorkflowFile::load(path)?;
    let (graph, steps) = definition.build()?;

    let initial = match input {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).context("--input must be a JSON object")?;
            anyhow::ensure!(value.is_object(), "--input must be a JSON object");
            WorkflowState::from_json(value)
        }
        None => WorkflowState::new(),
    };
    let workflow_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut ctx = SupervisorContext::new(config);
    if let Some(cp) = config.checkpoint.as_ref().filter(|c| c.enabled) {
        let store = CheckpointStore::open(Path::new(&cp.path))
            .with_context(|| format!("opening checkpoint store {}", cp.path))?;
        ctx = ctx.with_checkpoints(Arc::new(store));
    }
    if config.monitor.enabled {
        ctx = ctx.with_configured_monitor(config);
    }
    let monitor_task = ctx.monitor.as_ref().map(|m| m.start());

    let cancel = CancellationToken::new();
    let logger = config.log.as_ref().filter(|l| l.enabled).map(|l| {
        RunLogger::new(l.dir(), l.level).spawn(&ctx.event_bus, workflow_id.clone(), cancel.clone())
    });

    let executor = Executor::new(graph, steps, config.clone(), ctx.clone());
    let stop = executor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current iteration");
            stop.cancel();
        }
    });

    info!(workflow = %definition.name, workflow_id = %workflow_id, "Running workflow");
    let result = executor.run_with_id(workflow_id, initial).await;

    if let Some(handle) = logger {
        if result.is_err() {
            cancel.cancel();
        }
        if let Ok(Some(path)) = handle.await {
            info!(path = %path.display(), "Run log written");
        }
    }
    if let Some(monitor) = &ctx.monitor {
        monitor.stop();
    }
    if let Some(task) = monitor_task {
        task.await.ok();
    }

    Ok(result?)
}

fn print_summary(result: &WorkflowResult) {
    println!("Workflow {} finished: {:?}", result.workflow_id, result.reason);
    println!(
        "  iterations: {}  completed: {}",
        result.total_iterations,
        result.completed_nodes.len()
    );
    for entry in &result.log {
        let status = match entry.status {
            LogStatus::Completed if entry.recovery_applied => "completed (recovered)",
            LogStatus::Completed => "completed",
            LogStatus::Failed => "FAILED",
            LogStatus::Escalated => "ESCALATED",
        };
        match &entry.error {
            Some(err) => println!("  [{}] {:<20} {} - {}", entry.iteration, entry.node, status, err),
            None => println!("  [{}] {:<20} {}", entry.iteration, entry.node, status),
        }
    }
    for record in &result.escalations {
        println!(
            "  awaiting human: {} (step {}, {} retries, alternative: {})",
            record.task_id,
            record.step,
            record.retry_count,
            record.alternative_tried.as_deref().unwrap_or("none")
        );
    }
    if let Some(stats) = &result.recovery_stats {
        println!(
            "  recovery: {} attempts, {:.0}% success, avg {:.1}ms",
            stats.total_attempts,
            stats.success_rate * 100.0,
            stats.average_duration_ms
        );
    }
}

fn handle_checkpoints(config: &CheckpointConfig, action: CheckpointAction) -> anyhow::Result<()> {
    let store = CheckpointStore::open(Path::new(&config.path))
        .with_context(|| format!("opening checkpoint store {}", config.path))?;

    match action {
        CheckpointAction::Sessions => {
            let sessions = store.list_sessions()?;
            if sessions.is_empty() {
                println!("No checkpoints stored.");
            }
            for s in sessions {
                println!("  {:<38} {:>4} checkpoints  latest {}", s.session_id, s.checkpoints, s.latest.to_rfc3339());
            }
        }
        CheckpointAction::List { session } => {
            let checkpoints = store.load_all(&session)?;
            if checkpoints.is_empty() {
                println!("No checkpoints for session {}.", session);
            }
            for cp in checkpoints {
                let iteration = cp
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("iteration"))
                    .and_then(|v| v.as_u64());
                match iteration {
                    Some(i) => println!("  {}  {}  iteration {}", cp.checkpoint_id, cp.timestamp.to_rfc3339(), i),
                    None => println!("  {}  {}", cp.checkpoint_id, cp.timestamp.to_rfc3339()),
                }
            }
        }
        CheckpointAction::Show { checkpoint_id } => match store.load(&checkpoint_id)? {
            Some(cp) => println!("{}", serde_json::to_string_pretty(&cp)?),
            None => anyhow::bail!("checkpoint not found: {}", checkpoint_id),
        },
        CheckpointAction::Delete { session } => {
            let removed = store.delete_session(&session)?;
            println!("Deleted {} checkpoints for session {}.", removed, session);
        }
        CheckpointAction::Cleanup { days } => {
            let removed = store.cleanup_older_than(Duration::from_secs(days * 24 * 3600))?;
            println!("Deleted {} checkpoints older than {} days.", removed, days);
        }
    }
    Ok(())
}
