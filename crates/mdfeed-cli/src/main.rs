//! `mdfeed` — the command-line front end over the ingestion engine.
//!
//! A `clap` derive `Cli`/`Commands` pair, `tracing_subscriber` initialized
//! once at startup, and a per-subcommand resolve-config -> open-storage ->
//! run -> close sequence.

mod config;
mod run_cmd;
mod verify_cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mdfeed", version, about = "Fault-tolerant market data ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute one group's tasks against the remote API.
    Run {
        /// Name of the group in the config's `groups:` section.
        #[arg(long)]
        group: String,
        /// Comma-separated symbol list overriding the group's own scope.
        #[arg(long, value_delimiter = ',')]
        symbols: Option<Vec<String>>,
        /// Bypass watermarks; plan every task from the earliest date.
        #[arg(long)]
        force: bool,
        /// Path to the YAML job configuration.
        #[arg(long, default_value = "mdfeed.yaml")]
        config: PathBuf,
    },
    /// Reconcile the security master against stored data, dead-lettering
    /// any symbol missing from a business table.
    Verify {
        #[arg(long, default_value = "mdfeed.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { group, symbols, force, config } => run_cmd::run(&config, &group, symbols, force).await,
        Commands::Verify { config } => verify_cmd::run(&config).await,
    };

    match result {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            tracing::error!(error = %err, "mdfeed exited with an error");
            ExitCode::from(1)
        }
    }
}
