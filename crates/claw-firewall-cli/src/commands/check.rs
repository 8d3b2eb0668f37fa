//! Configuration check command.
//!
//! Loads and validates the configuration, compiles the rules and prints
//! them in the order the engine evaluates them.

use std::io::Write;
use std::path::PathBuf;

use claw_firewall::compile_rules;
use tracing::info;

use super::{load_config, load_rules};
use crate::error::CliError;
use crate::output::{CheckReport, OutputFormat, RuleRow};

/// Check command executor.
pub struct CheckCommand {
    config: Option<PathBuf>,
    rules: Option<PathBuf>,
}

impl CheckCommand {
    /// Create a new check command.
    #[must_use]
    pub const fn new(config: Option<PathBuf>, rules: Option<PathBuf>) -> Self {
        Self { config, rules }
    }

    /// Execute the check command.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or rules cannot be loaded.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let report = self.report()?;
        info!(
            rules = report.rules.len(),
            skipped = report.skipped.len(),
            "Configuration checked"
        );
        format.write(writer, &report)
    }

    /// Build the report without printing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or rules cannot be loaded.
    pub fn report(&self) -> Result<CheckReport, CliError> {
        let config = load_config(self.config.as_deref())?;
        let records = load_rules(self.rules.as_deref())?;
        let compiled = compile_rules(&records);

        let environment = if config.environment.is_production() {
            "production"
        } else {
            "development"
        };

        Ok(CheckReport {
            environment: environment.into(),
            per_minute_limit: config.rate_limit.per_minute_limit,
            per_hour_limit: config.rate_limit.per_hour_limit,
            progressive_delays_secs: config
                .rate_limit
                .progressive_delays
                .iter()
                .map(std::time::Duration::as_secs)
                .collect(),
            rules: compiled
                .rules
                .iter()
                .map(|rule| RuleRow {
                    name: rule.name.clone(),
                    priority: rule.priority,
                    kind: rule.kind().to_string(),
                    action: rule.action.to_string(),
                    description: rule.description.clone(),
                })
                .collect(),
            skipped: compiled.skipped.iter().map(ToString::to_string).collect(),
        })
    }
}
