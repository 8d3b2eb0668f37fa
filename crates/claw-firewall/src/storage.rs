//! Storage collaborator traits.
//!
//! The engine never owns persistence. Each trait below is the narrow surface
//! it needs from whatever backs rules, blocks, rate state and events; the
//! administrative side reads and writes the same stores. In-memory
//! implementations live in [`crate::memory`].

use chrono::{DateTime, Utc};

use crate::blocklist::BlockedEntry;
use crate::error::StorageError;
use crate::events::LogEvent;
use crate::rate_limit::RateState;
use crate::rules::RuleRecord;

/// Result of a storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// Source of firewall rules.
pub trait RuleStorage: Send + Sync {
    /// Enabled rules ordered by ascending priority.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn find_enabled_sorted_by_priority(&self) -> StorageResult<Vec<RuleRecord>>;
}

/// Store of blocked identifiers.
pub trait BlockStorage: Send + Sync {
    /// The entry covering `identifier` that is active at `now`, if any.
    ///
    /// Implementations may match network entries by containment. A lapsed
    /// exact entry must not shadow an active network entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn find_active(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<BlockedEntry>>;

    /// The entry stored under exactly `identifier`, active or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, identifier: &str) -> StorageResult<Option<BlockedEntry>>;

    /// Insert or replace the entry keyed by `entry.identifier`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn insert(&self, entry: BlockedEntry) -> StorageResult<()>;

    /// Remove the entry keyed by `identifier`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn remove(&self, identifier: &str) -> StorageResult<bool>;

    /// Every stored entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn list(&self) -> StorageResult<Vec<BlockedEntry>>;
}

/// Per-identifier rate state, expiring after about an hour of inactivity.
pub trait RateStorage: Send + Sync {
    /// Current state for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, identifier: &str) -> StorageResult<Option<RateState>>;

    /// Insert or replace the state and refresh its TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn upsert(&self, identifier: &str, state: RateState) -> StorageResult<()>;

    /// Drop the state for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn remove(&self, identifier: &str) -> StorageResult<()>;

    /// Drop expired state. Returns how many entries were removed.
    ///
    /// Stores that expire entries on their own keep the default.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn purge_expired(&self) -> StorageResult<usize> {
        Ok(0)
    }
}

/// Append-only sink for decision events.
pub trait LogStorage: Send + Sync {
    /// Append an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&self, event: LogEvent) -> StorageResult<()>;
}
