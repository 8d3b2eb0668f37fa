//! # claw-firewall-cli
//!
//! `clawfw`, the operator tool for the request firewall.
//!
//! Provides commands for:
//! - Validating a configuration file and rule set
//! - Replaying a recorded request trace through a fresh engine
//!
//! Replays run against in-memory stores and a manually driven clock, so the
//! same trace always yields the same decisions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

pub use cli::{CheckArgs, Cli, Commands, Format, LogFormat, ReplayArgs};
pub use error::CliError;
pub use output::OutputFormat;
