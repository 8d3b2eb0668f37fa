//! The filtering pipeline.
//!
//! [`FilterEngine::decide`] runs, in order: identifier extraction, the
//! development loopback bypass, the whitelist, geo resolution, the block
//! registry, rule evaluation and the rate limiter. Each stage either
//! settles the request or hands it to the next one. Every settled request
//! except a bypassed one is recorded on the event log.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blocklist::{BlockRegistry, BlockedEntry};
use crate::clock::{Clock, SystemClock};
use crate::config::FirewallConfig;
use crate::error::FirewallResult;
use crate::events::{EventAction, EventLog, LogEvent};
use crate::geo::{GeoLocation, GeoLookup, GeoResolver, NoGeoLookup};
use crate::memory::{MemoryBlockStorage, MemoryLogStorage, MemoryRateStorage, MemoryRuleStorage};
use crate::rate_limit::{RateLimiter, RateOutcome, RateStatus};
use crate::request::{extract_identifier, is_loopback, peer_address, FilterRequest};
use crate::rules::{MatchContext, RuleAction, RuleStore};
use crate::storage::{BlockStorage, LogStorage, RateStorage, RuleStorage};

/// Machine-readable outcome of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionCode {
    /// Request let through.
    Allowed,
    /// Identifier is in the block registry.
    IpBlocked,
    /// A block rule matched.
    RuleBlocked,
    /// Rate limit violations escalated to a permanent block.
    IpBlockedRateLimit,
    /// Client is cooling down.
    RateLimited,
}

impl DecisionCode {
    /// Stable code string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "ALLOWED",
            Self::IpBlocked => "IP_BLOCKED",
            Self::RuleBlocked => "RULE_BLOCKED",
            Self::IpBlockedRateLimit => "IP_BLOCKED_RATE_LIMIT",
            Self::RateLimited => "RATE_LIMITED",
        }
    }

    /// HTTP status a gateway should answer with.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Allowed => 200,
            Self::IpBlocked | Self::RuleBlocked | Self::IpBlockedRateLimit => 403,
            Self::RateLimited => 429,
        }
    }
}

impl fmt::Display for DecisionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict on a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed.
    pub allow: bool,
    /// Outcome code.
    pub code: DecisionCode,
    /// Human-readable message for the client.
    pub message: String,
    /// When a rate limited client may retry.
    pub retry_after: Option<DateTime<Utc>>,
    /// Rule that settled the request, if any.
    pub triggering_rule: Option<String>,
    /// Client identifier the decision applies to.
    pub identifier: String,
}

impl Decision {
    fn new(identifier: &str, code: DecisionCode, message: impl Into<String>) -> Self {
        Self {
            allow: matches!(code, DecisionCode::Allowed),
            code,
            message: message.into(),
            retry_after: None,
            triggering_rule: None,
            identifier: identifier.to_string(),
        }
    }

    fn allowed(identifier: &str) -> Self {
        Self::new(identifier, DecisionCode::Allowed, "OK")
    }

    fn with_rule(mut self, rule: Option<String>) -> Self {
        self.triggering_rule = rule;
        self
    }

    /// HTTP status for this decision.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Whole seconds until `retry_after`, rounded up, if limited.
    #[must_use]
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        let until = self.retry_after?;
        let millis = (until - now).num_milliseconds().max(0);
        u64::try_from(millis).ok().map(|m| m.div_ceil(1000))
    }
}

/// Decision counters since the engine was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Requests allowed, including whitelisted ones.
    pub allowed: u64,
    /// Requests denied with `IP_BLOCKED`.
    pub ip_blocked: u64,
    /// Requests denied with `RULE_BLOCKED`.
    pub rule_blocked: u64,
    /// Requests denied with `IP_BLOCKED_RATE_LIMIT`.
    pub ip_blocked_rate_limit: u64,
    /// Requests denied with `RATE_LIMITED`.
    pub rate_limited: u64,
    /// Loopback requests waved through in development mode.
    pub bypassed: u64,
}

impl EngineStats {
    /// Total decisions.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.allowed
            + self.ip_blocked
            + self.rule_blocked
            + self.ip_blocked_rate_limit
            + self.rate_limited
            + self.bypassed
    }
}

/// What one [`FilterEngine::cleanup`] pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    /// Lapsed temporary blocks deleted.
    pub blocks_removed: usize,
    /// Identifiers whose rate state had outlived its TTL.
    pub rate_states_removed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    ip_blocked: AtomicU64,
    rule_blocked: AtomicU64,
    ip_blocked_rate_limit: AtomicU64,
    rate_limited: AtomicU64,
    bypassed: AtomicU64,
}

impl Counters {
    fn count(&self, code: DecisionCode) {
        let counter = match code {
            DecisionCode::Allowed => &self.allowed,
            DecisionCode::IpBlocked => &self.ip_blocked,
            DecisionCode::RuleBlocked => &self.rule_blocked,
            DecisionCode::IpBlockedRateLimit => &self.ip_blocked_rate_limit,
            DecisionCode::RateLimited => &self.rate_limited,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            ip_blocked: self.ip_blocked.load(Ordering::Relaxed),
            rule_blocked: self.rule_blocked.load(Ordering::Relaxed),
            ip_blocked_rate_limit: self.ip_blocked_rate_limit.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
        }
    }
}

/// A loopback client that also reached us over a loopback socket. A
/// forwarded header alone never qualifies.
fn is_local(request: &FilterRequest, identifier: &str) -> bool {
    is_loopback(identifier) && peer_address(request).is_none_or(|ip| ip.is_loopback())
}

/// Request filtering engine.
#[derive(Debug)]
pub struct FilterEngine {
    config: FirewallConfig,
    clock: Arc<dyn Clock>,
    geo: GeoResolver,
    rules: RuleStore,
    blocklist: Arc<BlockRegistry>,
    rate_limiter: RateLimiter,
    events: EventLog,
    counters: Counters,
}

impl FilterEngine {
    /// Start building an engine for `config`.
    #[must_use]
    pub fn builder(config: FirewallConfig) -> FilterEngineBuilder {
        FilterEngineBuilder::new(config)
    }

    /// Engine with default configuration and in-memory collaborators.
    ///
    /// # Errors
    ///
    /// Never fails with the default configuration; kept fallible to match
    /// [`FilterEngineBuilder::build`].
    pub fn with_defaults() -> FirewallResult<Self> {
        Self::builder(FirewallConfig::default()).build()
    }

    // ==================== Decision ====================

    /// Decide whether a request may proceed.
    ///
    /// Never fails: collaborator errors are logged and the affected stage
    /// lets the request through.
    #[must_use]
    pub fn decide(&self, request: &FilterRequest) -> Decision {
        let identifier = extract_identifier(request, &self.config.proxy);

        if !self.config.environment.is_production() && is_local(request, &identifier) {
            debug!(identifier = %identifier, "Development loopback bypass");
            self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
            return Decision::allowed(&identifier);
        }

        let now = self.clock.now();

        if self.config.is_whitelisted(&identifier) {
            let event = LogEvent::new(&identifier, EventAction::Allowed, request, GeoLocation::unknown(), now)
                .with_reason("whitelisted");
            return self.settle(Decision::allowed(&identifier), event);
        }

        let geo = self.geo.resolve(&identifier);
        let event = |action| LogEvent::new(&identifier, action, request, geo.clone(), now);

        if let Some(entry) = self.blocklist.is_blocked(&identifier) {
            let decision = Decision::new(
                &identifier,
                DecisionCode::IpBlocked,
                format!("Access denied: {}", entry.reason),
            );
            return self.settle(decision, event(EventAction::Blocked).with_reason(entry.reason));
        }

        let ctx = MatchContext {
            identifier: &identifier,
            geo: &geo,
            request,
        };
        let mut flagged_by = None;
        if let Some(rule) = self.rules.evaluate(&ctx) {
            match rule.action {
                RuleAction::Block => {
                    let decision = Decision::new(
                        &identifier,
                        DecisionCode::RuleBlocked,
                        format!("Access denied by rule '{}'", rule.name),
                    )
                    .with_rule(Some(rule.name.clone()));
                    let event = event(EventAction::Blocked)
                        .with_reason(format!("matched {} rule", rule.kind()))
                        .with_rule(rule.name);
                    return self.settle(decision, event);
                }
                RuleAction::Allow => {
                    let decision = Decision::allowed(&identifier).with_rule(Some(rule.name.clone()));
                    let event = event(EventAction::Allowed)
                        .with_reason(format!("allowed by {} rule", rule.kind()))
                        .with_rule(rule.name);
                    return self.settle(decision, event);
                }
                RuleAction::RateLimit => flagged_by = Some(rule.name),
            }
        }

        match self.rate_limiter.check(&identifier, request, &geo) {
            RateOutcome::Allowed => {
                let decision = Decision::allowed(&identifier).with_rule(flagged_by.clone());
                let event = match flagged_by {
                    Some(rule) => event(EventAction::Suspicious)
                        .with_reason("flagged by rule, within rate limits")
                        .with_rule(rule),
                    None => event(EventAction::Allowed),
                };
                self.settle(decision, event)
            }
            RateOutcome::Limited { until, reason, .. } => {
                let mut decision = Decision::new(
                    &identifier,
                    DecisionCode::RateLimited,
                    format!("Too many requests, retry after {}", until.to_rfc3339()),
                )
                .with_rule(flagged_by.clone());
                decision.retry_after = Some(until);
                let mut event = event(EventAction::RateLimited).with_reason(reason);
                event.triggering_rule = flagged_by;
                self.settle(decision, event)
            }
            RateOutcome::Blocked { reason, .. } => {
                let decision = Decision::new(
                    &identifier,
                    DecisionCode::IpBlockedRateLimit,
                    "Access denied: too many rate limit violations",
                )
                .with_rule(flagged_by.clone());
                let mut event = event(EventAction::RateLimited).with_reason(reason);
                event.triggering_rule = flagged_by;
                self.settle(decision, event)
            }
        }
    }

    fn settle(&self, decision: Decision, event: LogEvent) -> Decision {
        self.counters.count(decision.code);
        if !decision.allow {
            debug!(
                identifier = %decision.identifier,
                code = %decision.code,
                rule = ?decision.triggering_rule,
                "Request denied"
            );
        }
        self.events.record(event);
        decision
    }

    // ==================== Administration ====================

    /// Block an identifier or network.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid or storage fails.
    pub fn block_identifier(
        &self,
        identifier: &str,
        reason: &str,
        permanent: bool,
        ttl: Option<Duration>,
    ) -> FirewallResult<BlockedEntry> {
        self.blocklist.add(identifier, reason, permanent, ttl)
    }

    /// Lift a block. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid or storage fails.
    pub fn unblock_identifier(&self, identifier: &str) -> FirewallResult<bool> {
        self.blocklist.remove(identifier)
    }

    /// Forget an identifier's rate history and violations.
    ///
    /// # Errors
    ///
    /// Returns an error if rate storage fails.
    pub fn reset_rate_state(&self, identifier: &str) -> FirewallResult<()> {
        self.rate_limiter.reset(identifier)
    }

    /// Rate limiting status of an identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if rate storage fails.
    pub fn rate_status(&self, identifier: &str) -> FirewallResult<RateStatus> {
        self.rate_limiter.status(identifier)
    }

    /// Reload rules on the next request.
    pub fn invalidate_rules(&self) {
        self.rules.invalidate();
    }

    /// Sweep lapsed blocks, idle rate state and the geo cache.
    ///
    /// Meant to run periodically; nothing else reclaims rate state for
    /// clients that never come back.
    ///
    /// # Errors
    ///
    /// Returns an error if block or rate storage fails.
    pub fn cleanup(&self) -> FirewallResult<CleanupStats> {
        let stats = CleanupStats {
            blocks_removed: self.blocklist.cleanup_expired()?,
            rate_states_removed: self.rate_limiter.purge_expired()?,
        };
        self.geo.clear_cache();
        if stats.blocks_removed > 0 || stats.rate_states_removed > 0 {
            info!(
                blocks = stats.blocks_removed,
                rate_states = stats.rate_states_removed,
                "Cleanup finished"
            );
        }
        Ok(stats)
    }

    // ==================== Accessors ====================

    /// Decision counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &FirewallConfig {
        &self.config
    }

    /// The block registry.
    #[must_use]
    pub fn blocklist(&self) -> &BlockRegistry {
        &self.blocklist
    }

    /// The rule store.
    #[must_use]
    pub const fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// The engine clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Wires a [`FilterEngine`] to its collaborators.
///
/// Anything not supplied falls back to an in-memory store, [`NoGeoLookup`]
/// and [`SystemClock`]. Without [`Self::event_log`] events are written
/// inline on the request path, which suits tests and in-memory stores only.
/// Production deployments with a slow or remote [`LogStorage`] should pass
/// the handle from [`EventLog::spawn`] so recording never waits on storage.
pub struct FilterEngineBuilder {
    config: FirewallConfig,
    clock: Option<Arc<dyn Clock>>,
    geo_lookup: Option<Arc<dyn GeoLookup>>,
    rule_storage: Option<Arc<dyn RuleStorage>>,
    block_storage: Option<Arc<dyn BlockStorage>>,
    rate_storage: Option<Arc<dyn RateStorage>>,
    log_storage: Option<Arc<dyn LogStorage>>,
    event_log: Option<EventLog>,
}

impl fmt::Debug for FilterEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterEngineBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FilterEngineBuilder {
    fn new(config: FirewallConfig) -> Self {
        Self {
            config,
            clock: None,
            geo_lookup: None,
            rule_storage: None,
            block_storage: None,
            rate_storage: None,
            log_storage: None,
            event_log: None,
        }
    }

    /// Set the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the geo lookup collaborator.
    #[must_use]
    pub fn geo_lookup(mut self, lookup: Arc<dyn GeoLookup>) -> Self {
        self.geo_lookup = Some(lookup);
        self
    }

    /// Set the rule storage.
    #[must_use]
    pub fn rule_storage(mut self, storage: Arc<dyn RuleStorage>) -> Self {
        self.rule_storage = Some(storage);
        self
    }

    /// Set the block storage.
    #[must_use]
    pub fn block_storage(mut self, storage: Arc<dyn BlockStorage>) -> Self {
        self.block_storage = Some(storage);
        self
    }

    /// Set the rate state storage.
    #[must_use]
    pub fn rate_storage(mut self, storage: Arc<dyn RateStorage>) -> Self {
        self.rate_storage = Some(storage);
        self
    }

    /// Record events inline into `storage`, on the request path.
    ///
    /// Prefer [`Self::event_log`] with [`EventLog::spawn`] for storage that
    /// can block.
    #[must_use]
    pub fn log_storage(mut self, storage: Arc<dyn LogStorage>) -> Self {
        self.log_storage = Some(storage);
        self
    }

    /// Use a prepared event log, such as one from [`EventLog::spawn`].
    ///
    /// Takes precedence over [`Self::log_storage`].
    #[must_use]
    pub fn event_log(mut self, log: EventLog) -> Self {
        self.event_log = Some(log);
        self
    }

    /// Validate the configuration and build the engine.
    ///
    /// # Errors
    ///
    /// Returns `FirewallError::Config` if the configuration is invalid.
    pub fn build(self) -> FirewallResult<FilterEngine> {
        let mut config = self.config;
        config.normalize_whitelist()?;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let lookup = self.geo_lookup.unwrap_or_else(|| Arc::new(NoGeoLookup));
        let rule_storage = self
            .rule_storage
            .unwrap_or_else(|| Arc::new(MemoryRuleStorage::default()));
        let block_storage = self
            .block_storage
            .unwrap_or_else(|| Arc::new(MemoryBlockStorage::new()));
        let rate_storage = self
            .rate_storage
            .unwrap_or_else(|| Arc::new(MemoryRateStorage::new(Arc::clone(&clock))));

        let events = match (self.event_log, self.log_storage) {
            (Some(log), _) => log,
            (None, Some(storage)) => EventLog::from_config(&config.events, storage),
            (None, None) => EventLog::from_config(&config.events, Arc::new(MemoryLogStorage::new())),
        };

        let blocklist = Arc::new(BlockRegistry::from_config(
            &config.blocklist,
            block_storage,
            Arc::clone(&clock),
        ));
        let rate_limiter = RateLimiter::from_config(
            &config.rate_limit,
            &config.blocklist,
            rate_storage,
            Arc::clone(&blocklist),
            Arc::clone(&clock),
        );

        info!(
            environment = ?config.environment,
            per_minute = config.rate_limit.per_minute_limit,
            per_hour = config.rate_limit.per_hour_limit,
            tiers = config.rate_limit.tiers(),
            "Filter engine ready"
        );

        Ok(FilterEngine {
            geo: GeoResolver::from_config(&config.geo, lookup),
            rules: RuleStore::from_config(&config.rules, rule_storage, Arc::clone(&clock)),
            blocklist,
            rate_limiter,
            events,
            counters: Counters::default(),
            clock,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Environment, ProxyConfig, RateLimitConfig};
    use crate::rules::{RuleRecord, RuleType};
    use test_case::test_case;

    fn engine_with(config: FirewallConfig, rules: Vec<RuleRecord>) -> (FilterEngine, Arc<MemoryLogStorage>) {
        let log = Arc::new(MemoryLogStorage::new());
        let engine = FilterEngine::builder(config)
            .clock(Arc::new(ManualClock::starting_now()))
            .rule_storage(Arc::new(MemoryRuleStorage::new(rules)))
            .log_storage(log.clone())
            .build()
            .unwrap();
        (engine, log)
    }

    fn from(ip: &str) -> FilterRequest {
        FilterRequest::new("GET", "/").with_remote_addr(format!("{ip}:50000"))
    }

    // ==================== DecisionCode Tests ====================

    #[test_case(DecisionCode::Allowed, "ALLOWED", 200)]
    #[test_case(DecisionCode::IpBlocked, "IP_BLOCKED", 403)]
    #[test_case(DecisionCode::RuleBlocked, "RULE_BLOCKED", 403)]
    #[test_case(DecisionCode::IpBlockedRateLimit, "IP_BLOCKED_RATE_LIMIT", 403)]
    #[test_case(DecisionCode::RateLimited, "RATE_LIMITED", 429)]
    fn test_decision_code(code: DecisionCode, name: &str, status: u16) {
        assert_eq!(code.as_str(), name);
        assert_eq!(code.http_status(), status);
        assert_eq!(serde_json::to_value(code).unwrap(), name);
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        let now = Utc::now();
        let mut decision = Decision::new("1.2.3.4", DecisionCode::RateLimited, "slow down");
        assert!(decision.retry_after_secs(now).is_none());

        decision.retry_after = Some(now + chrono::Duration::milliseconds(9_001));
        assert_eq!(decision.retry_after_secs(now), Some(10));
        assert_eq!(decision.retry_after_secs(now + chrono::Duration::seconds(20)), Some(0));
    }

    // ==================== FilterEngine Tests ====================

    #[test]
    fn test_allows_clean_request() {
        let (engine, log) = engine_with(FirewallConfig::default(), vec![]);
        let decision = engine.decide(&from("203.0.113.9"));

        assert!(decision.allow);
        assert_eq!(decision.identifier, "203.0.113.9");
        assert_eq!(log.by_action(EventAction::Allowed, 10).len(), 1);
    }

    #[test]
    fn test_blocked_identifier_denied() {
        let (engine, log) = engine_with(FirewallConfig::default(), vec![]);
        engine
            .block_identifier("203.0.113.9", "manual", true, None)
            .unwrap();

        let decision = engine.decide(&from("203.0.113.9"));
        assert_eq!(decision.code, DecisionCode::IpBlocked);
        assert!(decision.message.contains("manual"));
        assert_eq!(log.recent(1)[0].action, EventAction::Blocked);

        assert!(engine.unblock_identifier("203.0.113.9").unwrap());
        assert!(engine.decide(&from("203.0.113.9")).allow);
    }

    #[test]
    fn test_allow_rule_skips_rate_limiter() {
        let config = FirewallConfig::builder()
            .rate_limit(RateLimitConfig {
                per_minute_limit: 1,
                ..RateLimitConfig::default()
            })
            .build();
        let rules = vec![RuleRecord::new(
            "partners",
            RuleType::IpBlock,
            "198.51.100.0/24",
            RuleAction::Allow,
            1,
        )];
        let (engine, _) = engine_with(config, rules);

        for _ in 0..5 {
            let decision = engine.decide(&from("198.51.100.7"));
            assert!(decision.allow);
            assert_eq!(decision.triggering_rule.as_deref(), Some("partners"));
        }
        assert_eq!(engine.rate_status("198.51.100.7").unwrap().count_last_hour, 0);
    }

    #[test]
    fn test_rate_limit_rule_flags_and_limits() {
        let config = FirewallConfig::builder()
            .rate_limit(RateLimitConfig {
                per_minute_limit: 1,
                ..RateLimitConfig::default()
            })
            .build();
        let rules = vec![RuleRecord::new(
            "scrapers",
            RuleType::SuspiciousPattern,
            "python-requests",
            RuleAction::RateLimit,
            1,
        )];
        let (engine, log) = engine_with(config, rules);
        let request = from("203.0.113.9").with_header("user-agent", "python-requests/2.31");

        let first = engine.decide(&request);
        assert!(first.allow);
        assert_eq!(log.recent(1)[0].action, EventAction::Suspicious);

        let second = engine.decide(&request);
        assert_eq!(second.code, DecisionCode::RateLimited);
        assert_eq!(second.triggering_rule.as_deref(), Some("scrapers"));
        assert!(second.retry_after.is_some());
    }

    #[test]
    fn test_whitelist_bypasses_blocks() {
        let config = FirewallConfig::builder().whitelist("203.0.113.9").build();
        let (engine, log) = engine_with(config, vec![]);
        engine
            .block_identifier("203.0.113.9", "manual", true, None)
            .unwrap();

        assert!(engine.decide(&from("203.0.113.9")).allow);
        assert_eq!(log.recent(1)[0].reason, "whitelisted");
    }

    #[test_case(Environment::Development, true ; "development bypasses")]
    #[test_case(Environment::Production, false ; "production enforces")]
    fn test_loopback_bypass(environment: Environment, bypassed: bool) {
        let config = FirewallConfig::builder().environment(environment).build();
        let (engine, log) = engine_with(config, vec![]);
        let _ = engine.decide(&from("127.0.0.1"));

        assert_eq!(engine.stats().bypassed == 1, bypassed);
        assert_eq!(log.is_empty(), bypassed);
    }

    #[test]
    fn test_forwarded_loopback_is_not_bypassed() {
        let config = FirewallConfig::builder()
            .environment(Environment::Development)
            .proxy(ProxyConfig::trusting(["0.0.0.0/0".parse().unwrap()]))
            .build();
        let (engine, _) = engine_with(config, vec![]);
        engine
            .block_identifier("127.0.0.1", "manual", true, None)
            .unwrap();

        let request = from("198.51.100.9").with_header("cf-connecting-ip", "127.0.0.1");
        let decision = engine.decide(&request);
        assert_eq!(decision.identifier, "127.0.0.1");
        assert_eq!(decision.code, DecisionCode::IpBlocked);
        assert_eq!(engine.stats().bypassed, 0);
    }

    #[test]
    fn test_whitelist_matches_canonical_forms() {
        let config = FirewallConfig::builder()
            .whitelist("2001:DB8:0::1")
            .whitelist("::ffff:203.0.113.9")
            .build();
        let (engine, log) = engine_with(config, vec![]);
        engine
            .block_identifier("203.0.113.9", "manual", true, None)
            .unwrap();

        assert!(engine.decide(&from("203.0.113.9")).allow);
        assert!(engine.decide(&from("[2001:db8::1]")).allow);
        assert_eq!(log.by_action(EventAction::Allowed, 10).len(), 2);
        assert!(log.recent(2).iter().all(|e| e.reason == "whitelisted"));
    }

    #[tokio::test]
    async fn test_spawned_event_log_takes_precedence() {
        let background = Arc::new(MemoryLogStorage::new());
        let inline = Arc::new(MemoryLogStorage::new());
        let (events, writer) = EventLog::spawn(background.clone());
        let engine = FilterEngine::builder(FirewallConfig::default())
            .event_log(events)
            .log_storage(inline.clone())
            .build()
            .unwrap();

        assert!(engine.decide(&from("203.0.113.9")).allow);
        drop(engine);
        writer.await.unwrap();

        assert_eq!(background.len(), 1);
        assert!(inline.is_empty());
    }

    #[test]
    fn test_stats_count_each_code() {
        let config = FirewallConfig::builder()
            .rate_limit(RateLimitConfig {
                per_minute_limit: 1,
                ..RateLimitConfig::default()
            })
            .build();
        let rules = vec![RuleRecord::new("deny", RuleType::IpBlock, "192.0.2.", RuleAction::Block, 1)];
        let (engine, _) = engine_with(config, rules);

        let _ = engine.decide(&from("192.0.2.1"));
        let _ = engine.decide(&from("203.0.113.1"));
        let _ = engine.decide(&from("203.0.113.1"));

        let stats = engine.stats();
        assert_eq!(stats.rule_blocked, 1);
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.rate_limited, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_disabled_events_record_nothing() {
        let mut config = FirewallConfig::default();
        config.events.enabled = false;
        let (engine, log) = engine_with(config, vec![]);

        let _ = engine.decide(&from("203.0.113.9"));
        assert!(log.is_empty());
    }

    #[test]
    fn test_reset_rate_state_lifts_delay() {
        let config = FirewallConfig::builder()
            .rate_limit(RateLimitConfig {
                per_minute_limit: 1,
                ..RateLimitConfig::default()
            })
            .build();
        let (engine, _) = engine_with(config, vec![]);

        let _ = engine.decide(&from("203.0.113.9"));
        assert_eq!(engine.decide(&from("203.0.113.9")).code, DecisionCode::RateLimited);

        engine.reset_rate_state("203.0.113.9").unwrap();
        assert!(engine.decide(&from("203.0.113.9")).allow);
    }

    #[test]
    fn test_cleanup_purges_idle_rate_state() {
        let clock = ManualClock::starting_now();
        let rates = Arc::new(MemoryRateStorage::new(Arc::new(clock.clone())));
        let engine = FilterEngine::builder(FirewallConfig::default())
            .clock(Arc::new(clock.clone()))
            .rate_storage(rates.clone())
            .build()
            .unwrap();
        engine
            .block_identifier("198.51.100.1", "short", false, Some(Duration::from_secs(60)))
            .unwrap();

        for i in 0..200 {
            let _ = engine.decide(&from(&format!("10.{}.{}.1", i / 100, i % 100)));
        }
        assert_eq!(rates.stored_len(), 200);

        clock.advance(Duration::from_secs(3 * 3600));
        let stats = engine.cleanup().unwrap();
        assert_eq!(
            stats,
            CleanupStats {
                blocks_removed: 1,
                rate_states_removed: 200,
            }
        );
        assert_eq!(rates.stored_len(), 0);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = FirewallConfig::builder()
            .rate_limit(RateLimitConfig {
                per_minute_limit: 0,
                ..RateLimitConfig::default()
            })
            .build();
        assert!(FilterEngine::builder(config).build().is_err());
    }
}
