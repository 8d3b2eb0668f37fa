//! In-memory storage collaborators.
//!
//! Suitable for a single process, for tests and for the CLI replay tool.
//! Shared deployments plug their own implementations of the
//! [`crate::storage`] traits.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use parking_lot::RwLock;

use crate::blocklist::BlockedEntry;
use crate::clock::{saturating_add, Clock};
use crate::events::{EventAction, LogEvent};
use crate::rate_limit::RateState;
use crate::rules::RuleRecord;
use crate::storage::{BlockStorage, LogStorage, RateStorage, RuleStorage, StorageResult};

/// Idle lifetime of rate state.
pub const DEFAULT_RATE_STATE_TTL: Duration = Duration::from_secs(3600);

/// Default number of events kept by [`MemoryLogStorage`].
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

// ==================== Rules ====================

/// Rule records held in insertion order.
#[derive(Debug, Default)]
pub struct MemoryRuleStorage {
    records: RwLock<Vec<RuleRecord>>,
}

impl MemoryRuleStorage {
    /// Create with initial records.
    #[must_use]
    pub fn new(records: Vec<RuleRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Insert a record, replacing any with the same name in place.
    pub fn put(&self, record: RuleRecord) {
        let mut records = self.records.write();
        match records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    /// Remove a record by name. Returns whether one existed.
    pub fn remove(&self, name: &str) -> bool {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.name != name);
        records.len() != before
    }

    /// Every record, enabled or not.
    #[must_use]
    pub fn all(&self) -> Vec<RuleRecord> {
        self.records.read().clone()
    }
}

impl RuleStorage for MemoryRuleStorage {
    fn find_enabled_sorted_by_priority(&self) -> StorageResult<Vec<RuleRecord>> {
        let mut enabled: Vec<_> = self
            .records
            .read()
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        enabled.sort_by_key(|r| r.priority);
        Ok(enabled)
    }
}

// ==================== Blocks ====================

/// Blocked entries keyed by canonical identifier.
///
/// Network entries cover every address they contain. Lapsed entries found
/// during lookup are dropped on the spot.
#[derive(Debug, Default)]
pub struct MemoryBlockStorage {
    entries: RwLock<HashMap<String, BlockedEntry>>,
}

impl MemoryBlockStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, lapsed ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn covering_network(&self, identifier: &str, now: DateTime<Utc>) -> Option<BlockedEntry> {
        let ip: IpAddr = identifier.parse().ok()?;
        self.entries
            .read()
            .values()
            .filter(|e| e.is_network() && e.is_active(now))
            .find(|e| {
                e.identifier
                    .parse::<IpNet>()
                    .is_ok_and(|net| net.contains(&ip))
            })
            .cloned()
    }

    fn drop_if_lapsed(&self, identifier: &str, now: DateTime<Utc>) {
        let mut entries = self.entries.write();
        let lapsed = entries.get(identifier).is_some_and(|e| !e.is_active(now));
        if lapsed {
            entries.remove(identifier);
        }
    }
}

impl BlockStorage for MemoryBlockStorage {
    fn find_active(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<BlockedEntry>> {
        let exact = self.entries.read().get(identifier).cloned();
        match exact {
            Some(entry) if entry.is_active(now) => return Ok(Some(entry)),
            Some(_) => self.drop_if_lapsed(identifier, now),
            None => {}
        }
        // A lapsed exact entry must not hide a network block.
        Ok(self.covering_network(identifier, now))
    }

    fn get(&self, identifier: &str) -> StorageResult<Option<BlockedEntry>> {
        Ok(self.entries.read().get(identifier).cloned())
    }

    fn insert(&self, entry: BlockedEntry) -> StorageResult<()> {
        self.entries.write().insert(entry.identifier.clone(), entry);
        Ok(())
    }

    fn remove(&self, identifier: &str) -> StorageResult<bool> {
        Ok(self.entries.write().remove(identifier).is_some())
    }

    fn list(&self) -> StorageResult<Vec<BlockedEntry>> {
        let mut entries: Vec<_> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.blocked_at.cmp(&b.blocked_at));
        Ok(entries)
    }
}

// ==================== Rate state ====================

#[derive(Debug, Clone)]
struct StoredRate {
    state: RateState,
    expires_at: DateTime<Utc>,
}

/// Rate state with an idle TTL, checked lazily on read.
#[derive(Debug)]
pub struct MemoryRateStorage {
    states: RwLock<HashMap<String, StoredRate>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl MemoryRateStorage {
    /// Create with the default one hour TTL.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(clock, DEFAULT_RATE_STATE_TTL)
    }

    /// Create with a custom TTL.
    #[must_use]
    pub fn with_ttl(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            states: RwLock::default(),
            clock,
            ttl,
        }
    }

    /// Number of identifiers with live state.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.states
            .read()
            .values()
            .filter(|s| now < s.expires_at)
            .count()
    }

    /// Whether no identifier has live state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.states.read().len()
    }
}

impl RateStorage for MemoryRateStorage {
    fn get(&self, identifier: &str) -> StorageResult<Option<RateState>> {
        let now = self.clock.now();
        Ok(self
            .states
            .read()
            .get(identifier)
            .filter(|s| now < s.expires_at)
            .map(|s| s.state.clone()))
    }

    fn upsert(&self, identifier: &str, state: RateState) -> StorageResult<()> {
        let expires_at = saturating_add(self.clock.now(), self.ttl);
        self.states
            .write()
            .insert(identifier.to_string(), StoredRate { state, expires_at });
        Ok(())
    }

    fn remove(&self, identifier: &str) -> StorageResult<()> {
        self.states.write().remove(identifier);
        Ok(())
    }

    fn purge_expired(&self) -> StorageResult<usize> {
        let now = self.clock.now();
        let mut states = self.states.write();
        let before = states.len();
        states.retain(|_, s| now < s.expires_at);
        Ok(before - states.len())
    }
}

// ==================== Events ====================

/// Bounded in-memory event log, oldest events evicted first.
#[derive(Debug)]
pub struct MemoryLogStorage {
    events: RwLock<VecDeque<LogEvent>>,
    capacity: usize,
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStorage {
    /// Create with [`DEFAULT_LOG_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Create keeping at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// The most recent events, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<LogEvent> {
        self.events.read().iter().rev().take(limit).cloned().collect()
    }

    /// The most recent events with `action`, newest first.
    #[must_use]
    pub fn by_action(&self, action: EventAction, limit: usize) -> Vec<LogEvent> {
        self.events
            .read()
            .iter()
            .rev()
            .filter(|e| e.action == action)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Whether no event is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drop every event.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl LogStorage for MemoryLogStorage {
    fn append(&self, event: LogEvent) -> StorageResult<()> {
        let mut events = self.events.write();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geo::GeoLocation;
    use crate::request::FilterRequest;
    use crate::rules::{RuleAction, RuleType};

    fn rule(name: &str, priority: i32) -> RuleRecord {
        RuleRecord::new(name, RuleType::IpBlock, "10.", RuleAction::Block, priority)
    }

    fn log_event(action: EventAction, url: &str) -> LogEvent {
        LogEvent::new(
            "1.2.3.4",
            action,
            &FilterRequest::new("GET", url),
            GeoLocation::unknown(),
            Utc::now(),
        )
    }

    #[test]
    fn test_rules_sorted_and_filtered() {
        let storage = MemoryRuleStorage::new(vec![
            rule("b", 20),
            rule("a", 10),
            rule("c", 20),
            rule("off", 1).with_enabled(false),
        ]);
        let names: Vec<_> = storage
            .find_enabled_sorted_by_priority()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rules_put_replaces_by_name() {
        let storage = MemoryRuleStorage::new(vec![rule("a", 10)]);
        storage.put(rule("a", 5));
        storage.put(rule("b", 1));

        assert_eq!(storage.all().len(), 2);
        assert_eq!(storage.all()[0].priority, 5);
        assert!(storage.remove("a"));
        assert!(!storage.remove("a"));
    }

    #[test]
    fn test_blocks_exact_and_network() {
        let storage = MemoryBlockStorage::new();
        let now = Utc::now();
        storage
            .insert(BlockedEntry::permanent("1.2.3.4", "x", now))
            .unwrap();
        storage
            .insert(BlockedEntry::permanent("10.0.0.0/8", "y", now))
            .unwrap();

        assert_eq!(
            storage.find_active("1.2.3.4", now).unwrap().unwrap().reason,
            "x"
        );
        assert_eq!(
            storage.find_active("10.20.30.40", now).unwrap().unwrap().reason,
            "y"
        );
        assert!(storage.find_active("11.0.0.1", now).unwrap().is_none());
        assert!(storage.find_active("not-an-ip", now).unwrap().is_none());
    }

    #[test]
    fn test_blocks_lazy_expiry() {
        let now = Utc::now();
        let storage = MemoryBlockStorage::new();
        storage
            .insert(BlockedEntry::temporary("1.2.3.4", "x", now, Duration::from_secs(10)))
            .unwrap();

        assert!(storage.find_active("1.2.3.4", now).unwrap().is_some());
        let later = now + chrono::Duration::seconds(10);
        assert!(storage.find_active("1.2.3.4", later).unwrap().is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_lapsed_exact_entry_falls_back_to_network() {
        let now = Utc::now();
        let storage = MemoryBlockStorage::new();
        storage
            .insert(BlockedEntry::temporary("10.9.0.5", "short", now, Duration::from_secs(10)))
            .unwrap();
        storage
            .insert(BlockedEntry::permanent("10.9.0.0/16", "range", now))
            .unwrap();

        assert_eq!(storage.find_active("10.9.0.5", now).unwrap().unwrap().reason, "short");
        let later = now + chrono::Duration::seconds(11);
        let found = storage.find_active("10.9.0.5", later).unwrap().unwrap();
        assert_eq!(found.identifier, "10.9.0.0/16");
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_lapsed_network_is_skipped() {
        let now = Utc::now();
        let storage = MemoryBlockStorage::new();
        storage
            .insert(BlockedEntry::temporary("10.9.0.0/16", "range", now, Duration::from_secs(10)))
            .unwrap();

        let later = now + chrono::Duration::seconds(10);
        assert!(storage.find_active("10.9.3.3", later).unwrap().is_none());
    }

    #[test]
    fn test_rate_state_ttl() {
        let clock = ManualClock::starting_now();
        let storage = MemoryRateStorage::with_ttl(Arc::new(clock.clone()), Duration::from_secs(60));
        storage.upsert("1.2.3.4", RateState::default()).unwrap();

        assert!(storage.get("1.2.3.4").unwrap().is_some());
        clock.advance(Duration::from_secs(60));
        assert!(storage.get("1.2.3.4").unwrap().is_none());
        assert!(storage.is_empty());
        assert_eq!(storage.stored_len(), 1);
        assert_eq!(storage.purge_expired().unwrap(), 1);
        assert_eq!(storage.stored_len(), 0);
    }

    #[test]
    fn test_rate_state_upsert_refreshes_ttl() {
        let clock = ManualClock::starting_now();
        let storage = MemoryRateStorage::with_ttl(Arc::new(clock.clone()), Duration::from_secs(60));
        storage.upsert("1.2.3.4", RateState::default()).unwrap();
        clock.advance(Duration::from_secs(50));
        storage.upsert("1.2.3.4", RateState::default()).unwrap();
        clock.advance(Duration::from_secs(50));

        assert!(storage.get("1.2.3.4").unwrap().is_some());
        storage.remove("1.2.3.4").unwrap();
        assert!(storage.get("1.2.3.4").unwrap().is_none());
    }

    #[test]
    fn test_log_queries_newest_first() {
        let storage = MemoryLogStorage::new();
        storage.append(log_event(EventAction::Allowed, "/a")).unwrap();
        storage.append(log_event(EventAction::Blocked, "/b")).unwrap();
        storage.append(log_event(EventAction::Allowed, "/c")).unwrap();

        let recent: Vec<_> = storage.recent(2).into_iter().map(|e| e.url).collect();
        assert_eq!(recent, vec!["/c", "/b"]);

        let allowed: Vec<_> = storage
            .by_action(EventAction::Allowed, 10)
            .into_iter()
            .map(|e| e.url)
            .collect();
        assert_eq!(allowed, vec!["/c", "/a"]);
        assert_eq!(storage.len(), 3);
    }

    #[test]
    fn test_log_capacity_evicts_oldest() {
        let storage = MemoryLogStorage::with_capacity(2);
        for url in ["/1", "/2", "/3"] {
            storage.append(log_event(EventAction::Allowed, url)).unwrap();
        }
        let urls: Vec<_> = storage.recent(10).into_iter().map(|e| e.url).collect();
        assert_eq!(urls, vec!["/3", "/2"]);

        storage.clear();
        assert!(storage.is_empty());
    }
}
