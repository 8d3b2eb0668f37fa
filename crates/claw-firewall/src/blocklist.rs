//! Registry of blocked identifiers with expiry support.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{saturating_add, Clock};
use crate::config::BlocklistConfig;
use crate::error::{FirewallError, FirewallResult};
use crate::geo::GeoLocation;
use crate::locks::KeyedLocks;
use crate::request::normalize;
use crate::storage::BlockStorage;

/// A blocked IP address or network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedEntry {
    /// IP address or CIDR network.
    pub identifier: String,
    /// Human-readable reason.
    pub reason: String,
    /// When the block was created or last extended.
    pub blocked_at: DateTime<Utc>,
    /// When a temporary block lapses. Unset for permanent blocks.
    pub expires_at: Option<DateTime<Utc>>,
    /// Permanent blocks never lapse.
    pub permanent: bool,
    /// Violations that led to the block.
    pub attempts: u32,
    /// Location of the client when blocked.
    pub geo: GeoLocation,
}

impl BlockedEntry {
    /// Create a permanent block.
    #[must_use]
    pub fn permanent(
        identifier: impl Into<String>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            reason: reason.into(),
            blocked_at: now,
            expires_at: None,
            permanent: true,
            attempts: 0,
            geo: GeoLocation::unknown(),
        }
    }

    /// Create a block lapsing after `ttl`.
    #[must_use]
    pub fn temporary(
        identifier: impl Into<String>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            reason: reason.into(),
            blocked_at: now,
            expires_at: Some(saturating_add(now, ttl)),
            permanent: false,
            attempts: 0,
            geo: GeoLocation::unknown(),
        }
    }

    /// Set the attempt counter.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the location.
    #[must_use]
    pub fn with_geo(mut self, geo: GeoLocation) -> Self {
        self.geo = geo;
        self
    }

    /// Whether the block applies at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.permanent || self.expires_at.is_some_and(|exp| now < exp)
    }

    /// Time left on a temporary block (None if permanent or lapsed).
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.permanent {
            return None;
        }
        self.expires_at
            .filter(|exp| *exp > now)
            .and_then(|exp| (exp - now).to_std().ok())
    }

    /// Whether the identifier is a network rather than a single address.
    #[must_use]
    pub fn is_network(&self) -> bool {
        self.identifier.contains('/')
    }

    /// Fold an earlier entry for the same identifier into this one.
    ///
    /// Permanence is sticky, expiry extends to the later time and the
    /// attempt counter keeps the larger value.
    fn merge(mut self, existing: &Self, now: DateTime<Utc>) -> Self {
        if !existing.is_active(now) {
            return self;
        }
        if existing.permanent {
            self.permanent = true;
            self.expires_at = None;
        } else if !self.permanent {
            self.expires_at = self.expires_at.max(existing.expires_at);
        }
        self.attempts = self.attempts.max(existing.attempts);
        if self.geo.is_unknown() {
            self.geo = existing.geo.clone();
        }
        self
    }
}

impl fmt::Display for BlockedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expires_at {
            _ if self.permanent => write!(f, "{} (permanent): {}", self.identifier, self.reason),
            Some(exp) => write!(f, "{} (until {exp}): {}", self.identifier, self.reason),
            None => write!(f, "{}: {}", self.identifier, self.reason),
        }
    }
}

/// Canonical key for an IP address or network.
///
/// # Errors
///
/// Returns `FirewallError::InvalidIdentifier` for anything else.
pub fn canonical_identifier(identifier: &str) -> FirewallResult<String> {
    let trimmed = identifier.trim();
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(normalize(ip));
    }
    trimmed
        .parse::<IpNet>()
        .map(|net| net.trunc().to_string())
        .map_err(|_| FirewallError::InvalidIdentifier(identifier.to_string()))
}

/// Blocked identifiers over a block storage collaborator.
///
/// Writes for one identifier are serialized, so concurrent adds always
/// merge and a permanent block is never overwritten by a temporary one.
pub struct BlockRegistry {
    storage: Arc<dyn BlockStorage>,
    clock: Arc<dyn Clock>,
    default_duration: Duration,
    locks: KeyedLocks,
}

impl fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("default_duration", &self.default_duration)
            .field("locked_keys", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl BlockRegistry {
    /// Create from configuration.
    #[must_use]
    pub fn from_config(
        config: &BlocklistConfig,
        storage: Arc<dyn BlockStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            clock,
            default_duration: config.default_block_duration,
            locks: KeyedLocks::default(),
        }
    }

    /// The active block covering `identifier`, if any.
    ///
    /// Lapsed temporary entries count as absent. Storage failures are
    /// logged and treated as "not blocked".
    #[must_use]
    pub fn is_blocked(&self, identifier: &str) -> Option<BlockedEntry> {
        let now = self.clock.now();
        match self.storage.find_active(identifier, now) {
            Ok(entry) => entry.filter(|e| e.is_active(now)),
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Block storage lookup failed, failing open");
                None
            }
        }
    }

    /// Block an identifier.
    ///
    /// Temporary blocks without a `ttl` use the configured default.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid or storage fails.
    pub fn add(
        &self,
        identifier: &str,
        reason: impl Into<String>,
        permanent: bool,
        ttl: Option<Duration>,
    ) -> FirewallResult<BlockedEntry> {
        let now = self.clock.now();
        let entry = if permanent {
            BlockedEntry::permanent(identifier, reason, now)
        } else {
            BlockedEntry::temporary(identifier, reason, now, ttl.unwrap_or(self.default_duration))
        };
        self.add_entry(entry)
    }

    /// Store a prepared entry, merging with any active one for the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid or storage fails.
    pub fn add_entry(&self, mut entry: BlockedEntry) -> FirewallResult<BlockedEntry> {
        entry.identifier = canonical_identifier(&entry.identifier)?;
        let _guard = self.locks.lock(&entry.identifier);
        let now = self.clock.now();

        if let Some(existing) = self.storage.get(&entry.identifier)? {
            entry = entry.merge(&existing, now);
        }

        self.storage.insert(entry.clone())?;
        info!(
            identifier = %entry.identifier,
            reason = %entry.reason,
            permanent = entry.permanent,
            attempts = entry.attempts,
            "Identifier blocked"
        );
        Ok(entry)
    }

    /// Lift a block. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid or storage fails.
    pub fn remove(&self, identifier: &str) -> FirewallResult<bool> {
        let key = canonical_identifier(identifier)?;
        let _guard = self.locks.lock(&key);
        let removed = self.storage.remove(&key)?;
        if removed {
            info!(identifier = %key, "Identifier unblocked");
        }
        Ok(removed)
    }

    /// All blocks currently in force.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn list_active(&self) -> FirewallResult<Vec<BlockedEntry>> {
        let now = self.clock.now();
        Ok(self
            .storage
            .list()?
            .into_iter()
            .filter(|e| e.is_active(now))
            .collect())
    }

    /// Delete lapsed temporary blocks. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub fn cleanup_expired(&self) -> FirewallResult<usize> {
        let now = self.clock.now();
        let mut removed = 0;
        for entry in self.storage.list()? {
            if entry.is_active(now) {
                continue;
            }
            let _guard = self.locks.lock(&entry.identifier);
            // Re-read under the lock: the entry may have been renewed.
            let still_lapsed = self
                .storage
                .get(&entry.identifier)?
                .is_some_and(|e| !e.is_active(now));
            if still_lapsed && self.storage.remove(&entry.identifier)? {
                debug!(identifier = %entry.identifier, "Block expired, removing");
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed = removed, "Cleaned up expired blocks");
        }
        Ok(removed)
    }

    /// Default duration of temporary blocks.
    #[must_use]
    pub const fn default_duration(&self) -> Duration {
        self.default_duration
    }
}
