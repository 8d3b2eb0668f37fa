//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use claw_firewall::EngineStats;
use serde::Serialize;

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => {
                value.write_table(writer)?;
            }
        }
        Ok(())
    }

    /// Write a serializable value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

/// A compiled rule in evaluation order.
#[derive(Debug, Clone, Serialize)]
pub struct RuleRow {
    /// Rule name.
    pub name: String,
    /// Evaluation priority.
    pub priority: i32,
    /// Rule type.
    pub kind: String,
    /// Action on match.
    pub action: String,
    /// Free-form description.
    pub description: String,
}

/// Result of validating configuration and rules.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    /// Deployment mode.
    pub environment: String,
    /// Requests per minute before a violation.
    pub per_minute_limit: u32,
    /// Requests per hour before a violation.
    pub per_hour_limit: u32,
    /// Delay tiers in seconds.
    pub progressive_delays_secs: Vec<u64>,
    /// Usable rules in evaluation order.
    pub rules: Vec<RuleRow>,
    /// Rules that will be ignored, with the reason.
    pub skipped: Vec<String>,
}

impl TableDisplay for CheckReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Firewall Configuration")?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Environment:      {}", self.environment)?;
        writeln!(writer, "Per minute:       {}", self.per_minute_limit)?;
        writeln!(writer, "Per hour:         {}", self.per_hour_limit)?;
        let delays: Vec<String> = self
            .progressive_delays_secs
            .iter()
            .map(|d| format!("{d}s"))
            .collect();
        writeln!(writer, "Delay tiers:      {}", delays.join(" → "))?;
        writeln!(writer)?;

        if self.rules.is_empty() {
            writeln!(writer, "No active rules")?;
        } else {
            writeln!(
                writer,
                "{:>8}  {:<24}  {:<18}  {:<10}  DESCRIPTION",
                "PRIORITY", "NAME", "TYPE", "ACTION"
            )?;
            writeln!(writer, "{}", "─".repeat(80))?;
            for rule in &self.rules {
                writeln!(
                    writer,
                    "{:>8}  {:<24}  {:<18}  {:<10}  {}",
                    rule.priority,
                    truncate(&rule.name, 24),
                    rule.kind,
                    rule.action,
                    rule.description
                )?;
            }
        }

        if !self.skipped.is_empty() {
            writeln!(writer)?;
            writeln!(writer, "Skipped ({})", self.skipped.len())?;
            for reason in &self.skipped {
                writeln!(writer, "  ✗ {reason}")?;
            }
        }
        Ok(())
    }
}

/// One replayed request.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayRow {
    /// 1-based trace line.
    pub line: usize,
    /// Seconds since the start of the trace.
    pub at_offset_secs: f64,
    /// Client identifier.
    pub identifier: String,
    /// HTTP method.
    pub method: String,
    /// Requested URL.
    pub url: String,
    /// Decision code.
    pub code: String,
    /// HTTP status.
    pub status: u16,
    /// Rule that settled the request.
    pub triggering_rule: Option<String>,
    /// Seconds until a rate limited client may retry.
    pub retry_after_secs: Option<u64>,
}

/// Result of replaying a trace.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    /// Per-request decisions in trace order.
    pub decisions: Vec<ReplayRow>,
    /// Totals per decision code.
    pub stats: EngineStats,
}

impl TableDisplay for ReplayReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.decisions.is_empty() {
            writeln!(writer, "Trace is empty")?;
            return Ok(());
        }

        writeln!(
            writer,
            "{:>5}  {:>9}  {:<39}  {:<6}  {:<24}  {:<21}  {:>6}  RULE",
            "LINE", "OFFSET", "IDENTIFIER", "METHOD", "URL", "CODE", "RETRY"
        )?;
        writeln!(writer, "{}", "─".repeat(130))?;

        for row in &self.decisions {
            let retry = row
                .retry_after_secs
                .map_or_else(|| "-".to_string(), |s| format!("{s}s"));
            writeln!(
                writer,
                "{:>5}  {:>9.1}  {:<39}  {:<6}  {:<24}  {:<21}  {:>6}  {}",
                row.line,
                row.at_offset_secs,
                row.identifier,
                row.method,
                truncate(&row.url, 24),
                row.code,
                retry,
                row.triggering_rule.as_deref().unwrap_or("-")
            )?;
        }

        let s = &self.stats;
        writeln!(writer)?;
        writeln!(
            writer,
            "Total: {} request(s), {} allowed, {} blocked, {} rate limited",
            s.total(),
            s.allowed + s.bypassed,
            s.ip_blocked + s.rule_blocked + s.ip_blocked_rate_limit,
            s.rate_limited
        )?;
        Ok(())
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
