//! CLI command implementations.
//!
//! - [`check`] - Configuration and rule validation
//! - [`replay`] - Trace replay through the engine

use std::path::Path;

use claw_firewall::{FirewallConfig, RuleRecord};
use tracing::debug;

use crate::error::CliError;

pub mod check;
pub mod replay;

pub use check::CheckCommand;
pub use replay::ReplayCommand;

/// Load the firewall configuration, or the defaults when no path is given.
///
/// # Errors
///
/// Returns an error if the file cannot be read or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<FirewallConfig, CliError> {
    let Some(path) = path else {
        debug!("No configuration file, using defaults");
        return Ok(FirewallConfig::default());
    };
    FirewallConfig::load(path)
        .map_err(|e| CliError::Config(format!("{}: {e}", path.display())))
}

/// Load rule records from a JSON array, or none when no path is given.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_rules(path: Option<&Path>) -> Result<Vec<RuleRecord>, CliError> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| CliError::Config(format!("{}: {e}", path.display())))
}
