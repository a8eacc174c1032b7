//! bosun - policy scheduler for a fleet of backup agents.
//!
//! Usage:
//!   bosun run --config <file>       Seed the fleet and run the scheduler until Ctrl+C
//!   bosun validate --config <file>  Validate a configuration without running
//!   bosun status --config <file>    Print the scheduler status as JSON

use bosun::{
    FleetBuilder, GlobalConfig, InMemoryStorage, Scheduler, Storage, StorageConfig, YamlLoader,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// bosun - policy scheduler for a fleet of backup agents
#[derive(Parser)]
#[command(name = "bosun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed policies and agents, then run the scheduler
    Run {
        /// Path to the configuration file
        #[arg(short, long, value_name = "FILE", default_value = "bosun.yaml")]
        config: PathBuf,

        /// Override the tick interval in seconds
        #[arg(long)]
        tick_interval: Option<u64>,
    },

    /// Validate a configuration without running
    Validate {
        /// Path to the configuration file
        #[arg(short, long, value_name = "FILE", default_value = "bosun.yaml")]
        config: PathBuf,
    },

    /// Print the scheduler status as JSON
    Status {
        /// Path to the configuration file
        #[arg(short, long, value_name = "FILE", default_value = "bosun.yaml")]
        config: PathBuf,

        /// Evaluate one tick before reporting
        #[arg(long)]
        tick: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            tick_interval,
        } => {
            let mut config = YamlLoader::load_global_config(&config)?;
            if let Some(secs) = tick_interval {
                config.scheduler.tick_interval_secs = secs;
                YamlLoader::validate_global_config(&config)?;
            }
            with_storage(config, Mode::Run).await?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Status { config, tick } => {
            let config = YamlLoader::load_global_config(&config)?;
            with_storage(config, Mode::Status { tick }).await?;
        }
    }

    Ok(())
}

enum Mode {
    Run,
    Status { tick: bool },
}

/// Open the configured storage backend and dispatch.
async fn with_storage(config: GlobalConfig, mode: Mode) -> Result<(), Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Memory => {
            let storage = Arc::new(InMemoryStorage::new());
            dispatch(storage, &config, mode).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Opening SQLite store: {}", path);
            let storage = Arc::new(bosun::SqliteStorage::new(path).await?);
            let result = dispatch(Arc::clone(&storage), &config, mode).await;
            storage.close().await;
            result
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("SQLite storage requires the 'sqlite' feature".into())
        }
    }
}

async fn dispatch<S: Storage + 'static>(
    storage: Arc<S>,
    config: &GlobalConfig,
    mode: Mode,
) -> Result<(), Box<dyn std::error::Error>> {
    let fleet = FleetBuilder::build(config)?;
    fleet.seed(storage.as_ref()).await?;

    let scheduler = Scheduler::with_storage(storage)
        .with_tick_interval(config.scheduler.tick_interval());

    match mode {
        Mode::Run => run_scheduler(&scheduler).await,
        Mode::Status { tick } => {
            if tick {
                scheduler.run_now().await?;
            }
            let status = scheduler.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

/// Run the scheduler until Ctrl+C.
async fn run_scheduler<S: Storage + 'static>(
    scheduler: &Scheduler<S>,
) -> Result<(), Box<dyn std::error::Error>> {
    scheduler.start().await?;
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    scheduler.stop().await?;

    let metrics = scheduler.metrics();
    info!(
        runs = metrics.total_runs,
        tasks = metrics.tasks_generated,
        errors = metrics.errors_total,
        "Goodbye!"
    );
    Ok(())
}

/// Validate a configuration without running.
fn validate_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating configuration: {}", path.display());

    match YamlLoader::load_global_config(&path).and_then(|config| FleetBuilder::build(&config)) {
        Ok(fleet) => {
            info!(
                "Configuration is valid: {} policy(ies), {} agent(s)",
                fleet.policies.len(),
                fleet.agents.len()
            );
            for policy in &fleet.policies {
                let schedules: Vec<String> = policy
                    .schedules()
                    .iter()
                    .map(|(task_type, schedule)| format!("{}={}", task_type, schedule))
                    .collect();
                info!(
                    "  - {}{}: {}",
                    policy.name,
                    if policy.enabled { "" } else { " (disabled)" },
                    schedules.join(", ")
                );
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}
