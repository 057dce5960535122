use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use deskflow::{init_telemetry, shutdown_telemetry, DeskflowConfig};

#[derive(Parser)]
#[command(name = "deskflow")]
#[command(about = "Persisted workflow engine for service-desk conversations")]
#[command(long_about = "Deskflow stores long-running, multi-step workflows (clarification dialogues, \
                       form-driven data collection, approvals) and enforces one active instance per \
                       reference. Use 'deskflow sweep --watch' to expire stale workflows.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database if needed and apply schema migrations
    Migrate,
    /// Transition every overdue active workflow to EXPIRED
    Sweep {
        /// Keep sweeping on an interval until interrupted
        #[arg(long, help = "Run continuously instead of a single pass")]
        watch: bool,
        /// Seconds between passes in watch mode
        #[arg(long, help = "Override the configured sweep interval (seconds)")]
        interval: Option<u64>,
    },
    /// Print one workflow as JSON
    Show {
        /// Workflow id
        id: uuid::Uuid,
    },
    /// List workflows of a type in a given state
    List {
        #[arg(long = "type", help = "Workflow type, e.g. DEMAND_REQUEST")]
        workflow_type: String,
        #[arg(long, help = "Current state label")]
        state: String,
    },
    /// Show the active workflow for a type and reference id
    Active {
        #[arg(long = "type", help = "Workflow type, e.g. DEMAND_REQUEST")]
        workflow_type: String,
        #[arg(long, help = "External reference id, e.g. a thread identifier")]
        reference: String,
    },
    /// List active workflows whose deadline has passed, without expiring them
    Expired,
    /// Write the effective configuration to a TOML file
    WriteConfig {
        #[arg(default_value = "deskflow.toml")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = DeskflowConfig::load_env_file();
    let config = DeskflowConfig::load().context("Failed to load configuration")?;
    init_telemetry(&config.observability)?;

    let result = tokio::runtime::Runtime::new()?.block_on(run(cli.command, config));

    shutdown_telemetry();
    result
}

#[cfg(feature = "database")]
async fn run(command: Commands, config: DeskflowConfig) -> Result<()> {
    use deskflow::{DatabaseManager, WorkflowManager};
    use std::sync::Arc;

    if let Commands::WriteConfig { path } = &command {
        config.save_to_file(path)?;
        println!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    let db_config = config.require_database()?;
    let database = DatabaseManager::connect(db_config)
        .await
        .with_context(|| format!("Failed to open workflow database at {}", db_config.url))?;
    let manager = WorkflowManager::new(
        Arc::new(database.workflow_store()),
        config.engine.terminal_states(),
    );
    manager
        .refresh_active_flags()
        .await
        .context("Failed to apply the configured terminal states to stored workflows")?;

    let outcome = execute(command, &config, &database, &manager).await;

    if config.observability.metrics_enabled {
        manager.metrics().log_stats();
    }
    database.shutdown().await;
    outcome
}

#[cfg(feature = "database")]
async fn execute(
    command: Commands,
    config: &DeskflowConfig,
    database: &deskflow::DatabaseManager,
    manager: &deskflow::WorkflowManager,
) -> Result<()> {
    use deskflow::{ExpirySweeper, ShutdownCoordinator};
    use std::sync::Arc;
    use std::time::Duration;

    match command {
        Commands::Migrate => {
            database.migrate().await?;
            println!("Database is up to date");
        }
        Commands::Sweep { watch, interval } => {
            let sweeper = ExpirySweeper::new(manager.clone())
                .with_actor(config.sweep.actor.clone())
                .with_reason(config.sweep.reason.clone());

            if watch {
                let every =
                    Duration::from_secs(interval.unwrap_or(config.sweep.interval_seconds).max(1));
                let shutdown = Arc::new(ShutdownCoordinator::new());
                let receiver = shutdown.subscribe();
                let signals = Arc::clone(&shutdown);
                let signal_task = tokio::spawn(async move { signals.wait_for_signal().await });

                // The sweeper finishes its current pass before it sees the flag.
                sweeper.run(every, receiver).await;
                signal_task.abort();
                if shutdown.is_triggered() {
                    tracing::info!("Expiry sweeper interrupted; exiting");
                }
            } else {
                let report = sweeper.sweep_once().await?;
                println!(
                    "Examined {} overdue workflows: {} expired, {} skipped, {} failed",
                    report.examined, report.expired, report.skipped, report.failed
                );
            }
        }
        Commands::Show { id } => match manager.get(id).await? {
            Some(workflow) => print_json(&workflow)?,
            None => anyhow::bail!("Workflow {} not found", id),
        },
        Commands::List {
            workflow_type,
            state,
        } => print_json(&manager.find_by_type_and_state(&workflow_type, &state).await?)?,
        Commands::Active {
            workflow_type,
            reference,
        } => match manager
            .find_active_by_reference_id(&workflow_type, &reference)
            .await?
        {
            Some(workflow) => print_json(&workflow)?,
            None => println!("No active {} workflow for {}", workflow_type, reference),
        },
        Commands::Expired => print_json(&manager.find_expired().await?)?,
        Commands::WriteConfig { .. } => {}
    }

    Ok(())
}

#[cfg(not(feature = "database"))]
async fn run(command: Commands, config: DeskflowConfig) -> Result<()> {
    if let Commands::WriteConfig { path } = command {
        config.save_to_file(&path)?;
        println!("Wrote configuration to {}", path.display());
        return Ok(());
    }
    anyhow::bail!("deskflow was built without the `database` feature; no workflow store is available")
}

#[cfg(feature = "database")]
fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
