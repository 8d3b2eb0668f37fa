//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// clawfw - request firewall configuration and trace replay.
#[derive(Parser, Debug, Clone)]
#[command(name = "clawfw")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Firewall configuration file (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true, env = "CLAWFW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, global = true, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Diagnostic log format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Diagnostic log format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Validate configuration and rules, and show the effective rule order.
    Check(CheckArgs),

    /// Replay a JSON-lines request trace through the engine.
    ///
    /// Each line is an object with `method`, `url`, optional `headers`,
    /// `remote_addr` and `at_offset_secs`. The engine clock is moved to
    /// each offset before the request is decided.
    Replay(ReplayArgs),
}

/// Arguments for the check command.
#[derive(Parser, Debug, Clone)]
pub struct CheckArgs {
    /// Rules file (JSON array of rule records).
    #[arg(short, long)]
    pub rules: Option<PathBuf>,
}

/// Arguments for the replay command.
#[derive(Parser, Debug, Clone)]
pub struct ReplayArgs {
    /// Rules file (JSON array of rule records).
    #[arg(short, long)]
    pub rules: Option<PathBuf>,

    /// Request trace (JSON lines).
    #[arg(long, required = true)]
    pub requests: PathBuf,

    /// Blocks to load before replaying (JSON array).
    #[arg(short, long)]
    pub blocks: Option<PathBuf>,
}
