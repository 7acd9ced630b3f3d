//! # Beacon CLI
//!
//! Command-line entry point: configuration checks, repository listing and
//! maintenance, packaging, and a demo producer.

mod cli;
mod commands;
mod error;

use anyhow::Result;
use clap::Parser;
use observability::ObservabilityConfig;
use tracing::debug;

use cli::{Cli, Commands};
use commands::{run_info, run_package, run_prune, run_record, run_sessions, run_validate};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli)?;

    debug!(version = env!("CARGO_PKG_VERSION"), "Beacon CLI starting");

    let config = cli.config.as_path();
    let result = match &cli.command {
        Commands::Validate(args) => run_validate(config, args),
        Commands::Info(args) => run_info(config, args),
        Commands::Sessions(args) => run_sessions(config, args).await,
        Commands::Package(args) => run_package(config, args).await,
        Commands::Prune(args) => run_prune(config, args),
        Commands::Record(args) => run_record(config, args).await,
    };

    if let Err(ref e) = result {
        tracing::error!(error = %e, "Command failed");
    }

    result
}

/// Initialize logging based on CLI options; `RUST_LOG` wins over the flags
fn init_logging(cli: &Cli) -> Result<()> {
    let default_log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    observability::init_with_config(ObservabilityConfig {
        log_format: cli.log_format.into(),
        metrics_port: cli.metrics_port,
        default_log_level: default_log_level.to_string(),
    })
}
