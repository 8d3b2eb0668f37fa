//! Trace replay command.
//!
//! Feeds a JSON-lines request trace through a fresh engine backed by
//! in-memory stores. The engine runs on a manual clock that is moved to each
//! line's `at_offset_secs`, so a trace replays identically every time.
//! Decision events are written to the diagnostic log.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_firewall::{
    Clock, EventLog, FilterEngine, FilterRequest, ManualClock, MemoryRuleStorage, TracingLogStorage,
};
use serde::Deserialize;
use tracing::{debug, info};

use super::{load_config, load_rules};
use crate::error::CliError;
use crate::output::{OutputFormat, ReplayReport, ReplayRow};

/// One line of a request trace.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceEntry {
    /// HTTP method.
    #[serde(default = "default_method")]
    pub method: String,
    /// Requested URL.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Socket peer address.
    #[serde(default)]
    pub remote_addr: Option<String>,
    /// Seconds since the start of the trace. Defaults to the previous line's.
    #[serde(default)]
    pub at_offset_secs: Option<f64>,
}

fn default_method() -> String {
    "GET".into()
}

impl TraceEntry {
    fn into_request(self) -> FilterRequest {
        let mut request = FilterRequest::new(self.method, self.url);
        for (name, value) in self.headers {
            request = request.with_header(name, value);
        }
        request.remote_addr = self.remote_addr;
        request
    }
}

/// A block to install before replaying.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockSeed {
    /// IP address or CIDR network.
    pub identifier: String,
    /// Human-readable reason.
    #[serde(default = "default_reason")]
    pub reason: String,
    /// Permanent unless `ttl_secs` is given.
    #[serde(default)]
    pub permanent: bool,
    /// Lifetime of a temporary block.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_reason() -> String {
    "imported".into()
}

/// Replay command executor.
pub struct ReplayCommand {
    config: Option<PathBuf>,
    rules: Option<PathBuf>,
    requests: PathBuf,
    blocks: Option<PathBuf>,
}

impl ReplayCommand {
    /// Create a new replay command.
    #[must_use]
    pub const fn new(
        config: Option<PathBuf>,
        rules: Option<PathBuf>,
        requests: PathBuf,
        blocks: Option<PathBuf>,
    ) -> Self {
        Self {
            config,
            rules,
            requests,
            blocks,
        }
    }

    /// Execute the replay command.
    ///
    /// # Errors
    ///
    /// Returns an error if an input file is unusable or output fails.
    pub async fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let report = self.replay().await?;
        format.write(writer, &report)
    }

    /// Replay the trace and collect the decisions.
    ///
    /// # Errors
    ///
    /// Returns an error if an input file is unusable.
    pub async fn replay(&self) -> Result<ReplayReport, CliError> {
        let config = load_config(self.config.as_deref())?;
        let records = load_rules(self.rules.as_deref())?;
        let clock = ManualClock::starting_now();
        let start = clock.now();

        let (events, writer) = EventLog::spawn(Arc::new(TracingLogStorage::new()));
        let events = events.with_redacted_headers(config.events.redact_headers.iter().cloned());
        let engine = FilterEngine::builder(config)
            .clock(Arc::new(clock.clone()))
            .rule_storage(Arc::new(MemoryRuleStorage::new(records)))
            .event_log(events)
            .build()?;

        if let Some(path) = &self.blocks {
            seed_blocks(&engine, path)?;
        }

        let file = std::fs::File::open(&self.requests)?;
        let mut decisions = Vec::new();
        let mut offset = 0.0_f64;

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let number = index + 1;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TraceEntry =
                serde_json::from_str(&line).map_err(|e| CliError::trace(number, e.to_string()))?;

            if let Some(at) = entry.at_offset_secs {
                if !at.is_finite() || at < offset {
                    return Err(CliError::trace(
                        number,
                        format!("at_offset_secs {at} is before the previous line ({offset})"),
                    ));
                }
                offset = at;
                let at_time = offset_to_time(start, at).ok_or_else(|| {
                    CliError::trace(number, format!("at_offset_secs {at} is out of range"))
                })?;
                clock.set(at_time);
            }

            let request = entry.into_request();
            let decision = engine.decide(&request);
            debug!(line = number, code = %decision.code, "Replayed request");

            decisions.push(ReplayRow {
                line: number,
                at_offset_secs: offset,
                retry_after_secs: decision.retry_after_secs(clock.now()),
                identifier: decision.identifier,
                method: request.method,
                url: request.url,
                code: decision.code.to_string(),
                status: decision.code.http_status(),
                triggering_rule: decision.triggering_rule,
            });
        }

        let stats = engine.stats();
        drop(engine);
        if let Err(e) = writer.await {
            tracing::warn!(error = %e, "Event writer did not shut down cleanly");
        }

        info!(requests = decisions.len(), "Replay finished");
        Ok(ReplayReport { decisions, stats })
    }
}

/// `start` moved forward by `secs`, or `None` past chrono's range.
fn offset_to_time(start: DateTime<Utc>, secs: f64) -> Option<DateTime<Utc>> {
    // Float to int casts saturate, so only the calendar bound remains.
    #[allow(clippy::cast_possible_truncation)]
    let millis = (secs * 1000.0).round() as i64;
    let delta = chrono::TimeDelta::try_milliseconds(millis)?;
    start.checked_add_signed(delta)
}

fn seed_blocks(engine: &FilterEngine, path: &Path) -> Result<(), CliError> {
    let contents = std::fs::read_to_string(path)?;
    let seeds: Vec<BlockSeed> = serde_json::from_str(&contents)
        .map_err(|e| CliError::Config(format!("{}: {e}", path.display())))?;

    for seed in &seeds {
        let permanent = seed.permanent || seed.ttl_secs.is_none();
        engine.block_identifier(
            &seed.identifier,
            &seed.reason,
            permanent,
            seed.ttl_secs.map(Duration::from_secs),
        )?;
    }
    info!(count = seeds.len(), "Seeded blocks");
    Ok(())
}
