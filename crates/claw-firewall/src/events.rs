//! Decision event log.
//!
//! Every decision the engine makes (apart from the development bypass) is
//! turned into a [`LogEvent`] and handed to an [`EventLog`]. Recording is
//! fire-and-forget: a failing [`LogStorage`] is reported on the operational
//! log and never reaches the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EventsConfig;
use crate::geo::GeoLocation;
use crate::request::FilterRequest;
use crate::storage::{LogStorage, StorageResult};

/// Replacement for redacted header values.
pub const REDACTED: &str = "[redacted]";

/// What happened to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// Let through.
    Allowed,
    /// Rejected by the block registry or a rule.
    Blocked,
    /// Rejected by the rate limiter.
    RateLimited,
    /// Flagged without being rejected.
    Suspicious,
}

impl EventAction {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
            Self::RateLimited => "rate_limited",
            Self::Suspicious => "suspicious",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded filtering decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Unique event ID.
    pub id: Uuid,
    /// Client identifier.
    pub identifier: String,
    /// `User-Agent` header, empty if absent.
    pub user_agent: String,
    /// HTTP method.
    pub method: String,
    /// Requested URL.
    pub url: String,
    /// Request headers after redaction.
    pub headers: BTreeMap<String, String>,
    /// Resolved location.
    pub geo: GeoLocation,
    /// Outcome.
    pub action: EventAction,
    /// Name of the rule that decided, if any.
    pub triggering_rule: Option<String>,
    /// Human-readable reason.
    pub reason: String,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    /// Build an event from a request.
    #[must_use]
    pub fn new(
        identifier: impl Into<String>,
        action: EventAction,
        request: &FilterRequest,
        geo: GeoLocation,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: identifier.into(),
            user_agent: request.user_agent().to_string(),
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            geo,
            action,
            triggering_rule: None,
            reason: String::new(),
            timestamp,
        }
    }

    /// Set the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Set the triggering rule.
    #[must_use]
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.triggering_rule = Some(rule.into());
        self
    }

    fn redact(&mut self, names: &[String]) {
        for (name, value) in &mut self.headers {
            if names.iter().any(|n| n == name) {
                REDACTED.clone_into(value);
            }
        }
    }
}

#[derive(Clone)]
enum Sink {
    Inline(Arc<dyn LogStorage>),
    Background(mpsc::UnboundedSender<LogEvent>),
    Disabled,
}

/// Fire-and-forget writer in front of a [`LogStorage`].
#[derive(Clone)]
pub struct EventLog {
    sink: Sink,
    redact: Vec<String>,
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.sink {
            Sink::Inline(_) => "inline",
            Sink::Background(_) => "background",
            Sink::Disabled => "disabled",
        };
        f.debug_struct("EventLog")
            .field("mode", &mode)
            .field("redact", &self.redact)
            .finish()
    }
}

impl EventLog {
    /// Write events on the caller's thread.
    #[must_use]
    pub fn inline(storage: Arc<dyn LogStorage>) -> Self {
        Self::with_sink(Sink::Inline(storage))
    }

    /// Write events from a spawned tokio task.
    ///
    /// The task drains until every clone of the returned log is dropped.
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(storage: Arc<dyn LogStorage>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                write(storage.as_ref(), event);
            }
            debug!("Event log writer stopped");
        });
        (Self::with_sink(Sink::Background(tx)), handle)
    }

    /// Drop every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self::with_sink(Sink::Disabled)
    }

    /// Inline log honouring `enabled` and the redaction list.
    #[must_use]
    pub fn from_config(config: &EventsConfig, storage: Arc<dyn LogStorage>) -> Self {
        if config.enabled {
            Self::inline(storage).with_redacted_headers(config.redact_headers.iter().cloned())
        } else {
            Self::disabled()
        }
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            sink,
            redact: EventsConfig::default().redact_headers,
        }
    }

    /// Replace the set of header names whose values are redacted.
    #[must_use]
    pub fn with_redacted_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redact = names
            .into_iter()
            .map(|n| n.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Whether events go anywhere.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self.sink, Sink::Disabled)
    }

    /// Record an event. Never fails.
    pub fn record(&self, mut event: LogEvent) {
        event.redact(&self.redact);
        match &self.sink {
            Sink::Inline(storage) => write(storage.as_ref(), event),
            Sink::Background(tx) => {
                if let Err(e) = tx.send(event) {
                    warn!(event_id = %e.0.id, "Event log writer has stopped, dropping event");
                }
            }
            Sink::Disabled => {}
        }
    }
}

fn write(storage: &dyn LogStorage, event: LogEvent) {
    let id = event.id;
    if let Err(e) = storage.append(event) {
        warn!(event_id = %id, error = %e, "Failed to write log event");
    }
}

/// Log storage that emits each event on the `tracing` pipeline.
///
/// Allowed requests are logged at debug level, everything else at warn.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogStorage;

impl TracingLogStorage {
    /// Create a tracing-backed log storage.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl LogStorage for TracingLogStorage {
    fn append(&self, event: LogEvent) -> StorageResult<()> {
        let json = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        let rule = event.triggering_rule.as_deref().unwrap_or("-");

        match event.action {
            EventAction::Allowed => {
                tracing::debug!(
                    target: "claw_firewall::events",
                    event_id = %event.id,
                    identifier = %event.identifier,
                    action = %event.action,
                    rule = %rule,
                    geo = %event.geo,
                    event_json = %json,
                    "{} {} {}", event.action, event.method, event.url
                );
            }
            EventAction::Blocked | EventAction::RateLimited | EventAction::Suspicious => {
                tracing::warn!(
                    target: "claw_firewall::events",
                    event_id = %event.id,
                    identifier = %event.identifier,
                    action = %event.action,
                    rule = %rule,
                    geo = %event.geo,
                    reason = %event.reason,
                    event_json = %json,
                    "{} {} {}", event.action, event.method, event.url
                );
            }
        }
        Ok(())
    }
}
