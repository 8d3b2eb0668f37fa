//! Sliding-window rate limiting with progressive delays.
//!
//! Each identifier moves through `Normal -> Delayed(level) -> Blocked`.
//! Requests are counted over a trailing minute and a trailing hour. Every
//! time a client is over either limit outside an active delay it earns a
//! violation and the next cooldown tier; once the tiers run out it is
//! pushed into the [`BlockRegistry`] permanently.
//!
//! The read-prune-count-persist sequence for one identifier runs under a
//! lock scoped to that identifier, so unrelated clients never wait on
//! each other.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blocklist::{BlockRegistry, BlockedEntry};
use crate::clock::{saturating_add, Clock};
use crate::config::{BlocklistConfig, RateLimitConfig};
use crate::error::{FirewallError, FirewallResult, StorageError};
use crate::geo::GeoLocation;
use crate::locks::KeyedLocks;
use crate::request::FilterRequest;
use crate::storage::RateStorage;

/// A request counted against an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// When the request was admitted.
    pub timestamp: DateTime<Utc>,
    /// Requested URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
}

/// Rate state persisted per identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateState {
    /// Admitted requests in the trailing hour, oldest first.
    pub requests_in_window: VecDeque<RequestRecord>,
    /// Violations so far.
    pub violations: u32,
    /// When the last violation happened.
    pub last_violation_at: Option<DateTime<Utc>>,
    /// End of the current cooldown.
    pub delay_until: Option<DateTime<Utc>>,
}

impl RateState {
    /// Drop requests at or before `now - 1h`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::hours(1);
        while self
            .requests_in_window
            .front()
            .is_some_and(|r| r.timestamp <= cutoff)
        {
            self.requests_in_window.pop_front();
        }
    }

    /// Requests strictly after `since`.
    #[must_use]
    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.requests_in_window
            .iter()
            .rev()
            .take_while(|r| r.timestamp > since)
            .count()
    }

    /// The active cooldown end, if `now` falls inside it.
    #[must_use]
    pub fn active_delay(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.delay_until.filter(|until| now < *until)
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateOutcome {
    /// Under both limits; the request was counted.
    Allowed,
    /// Rejected until `until`.
    Limited {
        /// End of the cooldown.
        until: DateTime<Utc>,
        /// Violations so far.
        violations: u32,
        /// Human-readable reason.
        reason: String,
    },
    /// Out of delay tiers; the identifier is now blocked permanently.
    Blocked {
        /// Violations that led to the block.
        violations: u32,
        /// Human-readable reason.
        reason: String,
    },
}

impl RateOutcome {
    /// Whether the request must be rejected.
    #[must_use]
    pub const fn is_limited(&self) -> bool {
        !matches!(self, Self::Allowed)
    }

    /// Whether the check escalated to a permanent block.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// End of the cooldown, if limited.
    #[must_use]
    pub const fn delay_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Limited { until, .. } => Some(*until),
            _ => None,
        }
    }

    /// Human-readable reason, empty when allowed.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Allowed => "",
            Self::Limited { reason, .. } | Self::Blocked { reason, .. } => reason,
        }
    }
}

/// Position of an identifier in the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RateLimitState {
    /// No cooldown in force.
    Normal,
    /// Cooling down at `level` (1-indexed tier).
    Delayed {
        /// Tier, equal to the violation count.
        level: u32,
        /// End of the cooldown.
        until: DateTime<Utc>,
    },
    /// In the block registry.
    Blocked,
}

/// Snapshot of an identifier's rate state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateStatus {
    /// Escalation state.
    pub state: RateLimitState,
    /// Admitted requests in the trailing minute.
    pub count_last_minute: usize,
    /// Admitted requests in the trailing hour.
    pub count_last_hour: usize,
    /// Violations so far.
    pub violations: u32,
}

/// Progressive rate limiter over a rate storage collaborator.
pub struct RateLimiter {
    config: RateLimitConfig,
    permanent_reason: String,
    storage: Arc<dyn RateStorage>,
    blocklist: Arc<BlockRegistry>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("locked_keys", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create from configuration.
    #[must_use]
    pub fn from_config(
        config: &RateLimitConfig,
        blocklist_config: &BlocklistConfig,
        storage: Arc<dyn RateStorage>,
        blocklist: Arc<BlockRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: config.clone(),
            permanent_reason: blocklist_config.permanent_reason.clone(),
            storage,
            blocklist,
            clock,
            locks: KeyedLocks::default(),
        }
    }

    /// Check a request and record it if admitted.
    ///
    /// Storage failures fail open: they are logged and the request is
    /// treated as not limited.
    #[must_use]
    pub fn check(
        &self,
        identifier: &str,
        request: &FilterRequest,
        geo: &GeoLocation,
    ) -> RateOutcome {
        if !self.config.enabled {
            return RateOutcome::Allowed;
        }

        let _guard = self.locks.lock(identifier);
        let result = match self.check_locked(identifier, request, geo) {
            // The state changed between our read and write.
            Err(FirewallError::Storage(StorageError::Conflict { key })) => {
                debug!(identifier = %identifier, key = %key, "Rate state conflict, retrying once");
                self.check_locked(identifier, request, geo)
            }
            other => other,
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Rate limit check failed, failing open");
                RateOutcome::Allowed
            }
        }
    }

    fn check_locked(
        &self,
        identifier: &str,
        request: &FilterRequest,
        geo: &GeoLocation,
    ) -> FirewallResult<RateOutcome> {
        let now = self.clock.now();
        let mut state = self.storage.get(identifier)?.unwrap_or_default();
        state.prune(now);

        if let Some(until) = state.active_delay(now) {
            debug!(identifier = %identifier, until = %until, "Request during cooldown");
            return Ok(RateOutcome::Limited {
                until,
                violations: state.violations,
                reason: limited_reason(until),
            });
        }

        let count_last_minute = state.count_since(now - chrono::Duration::minutes(1));
        let count_last_hour = state.requests_in_window.len();
        let over_minute = count_last_minute >= self.config.per_minute_limit as usize;
        let over_hour = count_last_hour >= self.config.per_hour_limit as usize;

        if !(over_minute || over_hour) {
            state.requests_in_window.push_back(RequestRecord {
                timestamp: now,
                url: request.url.clone(),
                method: request.method.clone(),
            });
            self.storage.upsert(identifier, state)?;
            return Ok(RateOutcome::Allowed);
        }

        state.violations = state.violations.saturating_add(1);
        state.last_violation_at = Some(now);
        let violations = state.violations;

        if let Some(delay) = self.config.progressive_delays.get(violations as usize - 1) {
            let until = saturating_add(now, *delay);
            state.delay_until = Some(until);
            self.storage.upsert(identifier, state)?;
            info!(
                identifier = %identifier,
                violations = violations,
                count_last_minute = count_last_minute,
                count_last_hour = count_last_hour,
                until = %until,
                "Rate limit exceeded, delaying client"
            );
            return Ok(RateOutcome::Limited {
                until,
                violations,
                reason: limited_reason(until),
            });
        }

        let entry = BlockedEntry::permanent(identifier, &self.permanent_reason, now)
            .with_attempts(violations)
            .with_geo(geo.clone());
        self.blocklist.add_entry(entry)?;
        if let Err(e) = self.storage.remove(identifier) {
            warn!(identifier = %identifier, error = %e, "Could not drop rate state after block");
        }
        info!(identifier = %identifier, violations = violations, "Delay tiers exhausted, blocked permanently");

        Ok(RateOutcome::Blocked {
            violations,
            reason: self.permanent_reason.clone(),
        })
    }

    /// Current position of an identifier in the escalation ladder.
    ///
    /// # Errors
    ///
    /// Returns an error if rate storage fails.
    pub fn status(&self, identifier: &str) -> FirewallResult<RateStatus> {
        let now = self.clock.now();
        let mut state = self.storage.get(identifier)?.unwrap_or_default();
        state.prune(now);

        let rate_state = if self.blocklist.is_blocked(identifier).is_some() {
            RateLimitState::Blocked
        } else if let Some(until) = state.active_delay(now) {
            RateLimitState::Delayed {
                level: state.violations,
                until,
            }
        } else {
            RateLimitState::Normal
        };

        Ok(RateStatus {
            state: rate_state,
            count_last_minute: state.count_since(now - chrono::Duration::minutes(1)),
            count_last_hour: state.requests_in_window.len(),
            violations: state.violations,
        })
    }

    /// Drop rate state that has outlived its idle TTL. Returns how many
    /// identifiers were forgotten.
    ///
    /// # Errors
    ///
    /// Returns an error if rate storage fails.
    pub fn purge_expired(&self) -> FirewallResult<usize> {
        let removed = self.storage.purge_expired()?;
        if removed > 0 {
            debug!(removed = removed, "Purged idle rate state");
        }
        Ok(removed)
    }

    /// Forget everything about an identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if rate storage fails.
    pub fn reset(&self, identifier: &str) -> FirewallResult<()> {
        let _guard = self.locks.lock(identifier);
        self.storage.remove(identifier)?;
        debug!(identifier = %identifier, "Rate state reset");
        Ok(())
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

fn limited_reason(until: DateTime<Utc>) -> String {
    format!("rate limited until {}", until.to_rfc3339())
}
