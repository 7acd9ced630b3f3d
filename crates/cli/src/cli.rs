//! CLI argument definitions using clap.

use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use contracts::{Criteria, PublishMode};
use std::path::PathBuf;

/// Beacon - session telemetry agent
#[derive(Parser, Debug)]
#[command(
    name = "beacon",
    author,
    version,
    about = "Beacon telemetry agent",
    long_about = "Records application sessions into a local repository and packages\n\
                  them for delivery to a file or a collector."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "BEACON_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "compact",
        global = true,
        env = "BEACON_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    /// Path to configuration file (TOML or JSON)
    #[arg(
        short,
        long,
        default_value = "beacon.toml",
        global = true,
        env = "BEACON_CONFIG"
    )]
    pub config: PathBuf,

    /// Serve Prometheus metrics on this port
    #[arg(long, global = true, env = "BEACON_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration file
    Validate(ValidateArgs),

    /// Show the configuration or the contents of a package file
    Info(InfoArgs),

    /// List sessions in the repository
    Sessions(SessionsArgs),

    /// Package sessions to a file or the collector
    Package(PackageArgs),

    /// Delete sessions past the configured age or size limits
    Prune(PruneArgs),

    /// Record a synthetic session (demo producer)
    Record(RecordArgs),
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Describe this package file instead of the configuration
    #[arg(long)]
    pub package: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `sessions` command
#[derive(Parser, Debug)]
pub struct SessionsArgs {
    /// Only sessions matching: none | active | new | all | <session id>
    #[arg(long, default_value = "all")]
    pub criteria: Criteria,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `package` command
#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("destination").required(true).args(["file", "server"])))]
pub struct PackageArgs {
    /// Sessions to package: none | active | new | all | <session id>
    #[arg(long, default_value = "new")]
    pub criteria: Criteria,

    /// Write the package to this file
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Send the package to the configured collector
    #[arg(long)]
    pub server: bool,

    /// Flag packaged sessions as sent
    #[arg(long)]
    pub mark_read: bool,

    /// Delete sessions after the collector confirmed them
    #[arg(long, conflicts_with = "file")]
    pub purge: bool,

    /// Override the collector customer key
    #[arg(long, env = "BEACON_CUSTOMER_KEY")]
    pub customer_key: Option<String>,
}

/// Arguments for the `prune` command
#[derive(Parser, Debug)]
pub struct PruneArgs {
    /// Override repository.max_age_days
    #[arg(long)]
    pub max_age_days: Option<u32>,

    /// Override repository.max_size_mb
    #[arg(long)]
    pub max_size_mb: Option<u64>,

    /// Output the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `record` command
#[derive(Parser, Debug, Clone)]
pub struct RecordArgs {
    /// Log messages to publish
    #[arg(long, default_value = "100")]
    pub messages: u64,

    /// Metric samples to publish
    #[arg(long, default_value = "20")]
    pub samples: u64,

    /// Concurrent producer tasks
    #[arg(long, default_value = "4")]
    pub producers: usize,

    /// Pause between publishes per producer, in milliseconds
    #[arg(long, default_value = "0")]
    pub interval_ms: u64,

    /// Publish mode
    #[arg(long, value_enum, default_value = "queued")]
    pub mode: ModeArg,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    Pretty,
    /// Compact single-line format
    #[default]
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => Self::Json,
            LogFormat::Pretty => Self::Pretty,
            LogFormat::Compact => Self::Compact,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum ModeArg {
    #[default]
    Queued,
    Commit,
    Task,
}

impl From<ModeArg> for PublishMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Queued => Self::Queued,
            ModeArg::Commit => Self::WaitForCommit,
            ModeArg::Task => Self::WaitForTask,
        }
    }
}
