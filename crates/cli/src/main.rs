mod doctor;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{Instrument, error, info_span};
use tracing_subscriber::EnvFilter;

use evolve_config::LoadedConfig;
use evolve_dispatcher::Dispatcher;
use evolve_ideation::Ideator;
use evolve_worker::Worker;

#[derive(Debug, Parser)]
#[command(
    name = "evolve",
    version,
    about = "LLM-guided evolutionary search over an evaluator-scored algorithm"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the dispatcher: supervise workers, meta-learning, and ideation.
    Run {
        /// Path to config.toml (defaults to discovery via
        /// CLAUDE_EVOLVE_CONFIG and well-known locations).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Cap on concurrent workers.
        #[arg(long, conflicts_with = "sequential")]
        parallel: Option<usize>,
        /// One worker at a time.
        #[arg(long)]
        sequential: bool,
        /// Per-evaluation timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Claim and process pending candidates (spawned by the dispatcher).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run a single ideation pass.
    Ideate {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Audit parent-id references in the ledger.
    Doctor {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Mark unprocessed orphans failed-parent-missing.
        #[arg(long)]
        fix: bool,
    },
}

fn init_tracing() {
    // RUST_LOG wins; DEBUG/VERBOSE raise the default to debug.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let verbose = std::env::var("DEBUG").is_ok() || std::env::var("VERBOSE").is_ok();
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(explicit: Option<&PathBuf>) -> Result<LoadedConfig> {
    let path = evolve_config::discover(explicit.map(PathBuf::as_path))?;
    evolve_config::load(&path)
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let pid = std::process::id();

    match cli.command {
        Commands::Run {
            config,
            parallel,
            sequential,
            timeout,
        } => {
            let mut loaded = load_config(config.as_ref())?;
            if sequential {
                loaded.config.parallel.max_workers = 1;
            } else if let Some(workers) = parallel {
                loaded.config.parallel.max_workers = workers;
            }
            if let Some(timeout) = timeout {
                loaded.config.timeout_seconds = timeout;
            }

            let mut dispatcher = Dispatcher::new(loaded)?;
            dispatcher.run().instrument(info_span!("run", pid)).await
        }
        Commands::Worker { config, timeout } => {
            let mut loaded = load_config(config.as_ref())?;
            if let Some(timeout) = timeout {
                loaded.config.timeout_seconds = timeout;
            }

            let worker = Worker::new(loaded);
            worker.run().instrument(info_span!("worker", pid)).await
        }
        Commands::Ideate { config } => {
            let loaded = load_config(config.as_ref())?;
            let ideator = Ideator::new(loaded);
            let added = ideator.run().instrument(info_span!("ideate", pid)).await?;
            Ok(if added > 0 { 0 } else { 1 })
        }
        Commands::Doctor { config, fix } => {
            let loaded = load_config(config.as_ref())?;
            let _span = info_span!("doctor", pid).entered();
            doctor::run(&loaded, fix)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}
