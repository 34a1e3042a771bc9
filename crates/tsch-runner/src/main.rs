//! # tschsim
//!
//! CLI runner for the TSCH scheduling-function simulator.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tsch_model::{load_model, Overrides};
use tsch_runner::{run_model, RunnerError};
use tsch_sf::SfKind;

// ============================================================================
// CLI Configuration
// ============================================================================

/// tschsim - TSCH scheduling-function simulator
#[derive(Parser, Debug)]
#[command(name = "tschsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from a YAML model file
    Run(RunConfig),
    /// List the selectable scheduling functions
    SfTypes,
}

/// Options of the `run` command.
#[derive(Parser, Debug)]
pub struct RunConfig {
    /// Path to the YAML model file.
    pub model: PathBuf,

    /// Seed of the first run (overrides simulation.seed)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Number of runs (overrides simulation.runs)
    #[arg(short, long)]
    pub runs: Option<u32>,

    /// Run length in slotframes (overrides simulation.num_cycles_per_run)
    #[arg(short, long)]
    pub cycles: Option<u64>,

    /// Write the JSON report to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Commands
// ============================================================================

fn run_command(config: RunConfig) -> Result<(), RunnerError> {
    let mut model = load_model(&config.model)?;
    model.apply_overrides(Overrides {
        seed: config.seed,
        runs: config.runs,
        num_cycles_per_run: config.cycles,
    })?;

    if config.verbose {
        eprintln!(
            "Loaded model with {} nodes, {} x {} slotframes of {} slots, SF {}",
            model.node_count(),
            model.simulation.runs,
            model.simulation.num_cycles_per_run,
            model.tsch.slotframe_length,
            model.sf.kind
        );
    }

    let reports = run_model(&model).inspect_err(|e| error!("Run failed: {}", e))?;
    let json = serde_json::to_string_pretty(&reports)?;

    match config.output {
        Some(path) => {
            std::fs::write(&path, json)?;
            if config.verbose {
                eprintln!("Report written to {}", path.display());
            }
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn print_sf_types() {
    for kind in SfKind::ALL {
        let description = if kind.is_static() {
            "static, installed once at setup"
        } else {
            "adaptive, negotiates cells from measured usage"
        };
        println!("{:<24} {}", kind.name(), description);
    }
}

fn main() -> Result<(), RunnerError> {
    // Default to "warn" level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(config) => run_command(config)?,
        Commands::SfTypes => print_sf_types(),
    }
    Ok(())
}
