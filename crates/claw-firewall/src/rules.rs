//! Firewall rules and priority-ordered evaluation.
//!
//! Rules are stored as loose [`RuleRecord`]s and compiled into [`Rule`]s
//! whose [`RuleMatcher`] is a closed set of variants. A record that does not
//! compile for its type is skipped with a warning rather than failing the
//! engine.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{saturating_add, Clock};
use crate::config::RulesConfig;
use crate::error::{FirewallError, FirewallResult};
use crate::geo::GeoLocation;
use crate::request::FilterRequest;
use crate::storage::RuleStorage;

/// Rule type as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Match the client identifier.
    IpBlock,
    /// Match the resolved country.
    CountryBlock,
    /// Legacy per-rule rate limit. Not evaluated; see [`Rule::compile`].
    RateLimit,
    /// Match the user agent or URL.
    SuspiciousPattern,
}

impl RuleType {
    /// Stored name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IpBlock => "ip_block",
            Self::CountryBlock => "country_block",
            Self::RateLimit => "rate_limit",
            Self::SuspiciousPattern => "suspicious_pattern",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Deny the request.
    Block,
    /// Allow the request without rate limiting.
    Allow,
    /// Hand the request to the rate limiter.
    RateLimit,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Block => "block",
            Self::Allow => "allow",
            Self::RateLimit => "rate_limit",
        })
    }
}

/// A rule as kept by the rule storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    /// Unique rule name.
    pub name: String,
    /// Rule type.
    #[serde(rename = "type")]
    pub kind: RuleType,
    /// Type-specific value.
    pub value: String,
    /// Action on match.
    pub action: RuleAction,
    /// Whether the rule is active.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Evaluation order, lowest first.
    #[serde(default)]
    pub priority: i32,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

const fn default_enabled() -> bool {
    true
}

impl RuleRecord {
    /// Create an enabled record.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: RuleType,
        value: impl Into<String>,
        action: RuleAction,
        priority: i32,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            value: value.into(),
            action,
            enabled: true,
            priority,
            description: String::new(),
        }
    }

    /// Set the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Identifier pattern of an `ip_block` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpPattern {
    /// `a.b.c.d/len`: true subnet containment.
    Network(IpNet),
    /// Anything else: exact match or string prefix, so `10.0.0.` covers
    /// `10.0.0.42`.
    Prefix(String),
}

impl IpPattern {
    fn parse(value: &str) -> Result<Self, String> {
        if value.contains('/') {
            value
                .parse::<IpNet>()
                .map(Self::Network)
                .map_err(|e| format!("invalid network '{value}': {e}"))
        } else {
            Ok(Self::Prefix(value.to_string()))
        }
    }

    fn matches(&self, identifier: &str) -> bool {
        match self {
            Self::Network(net) => identifier
                .parse::<IpAddr>()
                .is_ok_and(|ip| net.contains(&ip)),
            Self::Prefix(prefix) => identifier == prefix || identifier.starts_with(prefix.as_str()),
        }
    }
}

/// Prefix marking a `suspicious_pattern` value as a regular expression.
pub const REGEX_PREFIX: &str = "re:";

/// Text pattern of a `suspicious_pattern` rule.
///
/// Values are literal substrings unless they start with [`REGEX_PREFIX`],
/// so path fragments like `/.env/` match literally.
#[derive(Debug, Clone)]
pub enum TextPattern {
    /// Case-sensitive substring.
    Substring(String),
    /// Regular expression, written `re:expr` in the rule value.
    Regex(Regex),
}

impl TextPattern {
    fn parse(value: &str) -> Result<Self, String> {
        match value.strip_prefix(REGEX_PREFIX) {
            Some(expr) if expr.is_empty() => Err("empty regex".into()),
            Some(expr) => Regex::new(expr)
                .map(Self::Regex)
                .map_err(|e| format!("invalid regex: {e}")),
            None => Ok(Self::Substring(value.to_string())),
        }
    }

    fn is_match(&self, haystack: &str) -> bool {
        match self {
            Self::Substring(needle) => haystack.contains(needle.as_str()),
            Self::Regex(re) => re.is_match(haystack),
        }
    }
}

/// Compiled match condition, one variant per evaluated rule type.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// Match the client identifier.
    IpBlock(IpPattern),
    /// Match the upper-cased country code.
    CountryBlock(String),
    /// Match the user agent or URL.
    SuspiciousPattern(TextPattern),
}

impl RuleMatcher {
    /// Whether the condition holds for a request.
    #[must_use]
    pub fn matches(&self, ctx: &MatchContext<'_>) -> bool {
        match self {
            Self::IpBlock(pattern) => pattern.matches(ctx.identifier),
            Self::CountryBlock(code) => ctx.geo.country.eq_ignore_ascii_case(code),
            Self::SuspiciousPattern(pattern) => {
                pattern.is_match(ctx.request.user_agent()) || pattern.is_match(&ctx.request.url)
            }
        }
    }

    /// Type this matcher was compiled from.
    #[must_use]
    pub const fn kind(&self) -> RuleType {
        match self {
            Self::IpBlock(_) => RuleType::IpBlock,
            Self::CountryBlock(_) => RuleType::CountryBlock,
            Self::SuspiciousPattern(_) => RuleType::SuspiciousPattern,
        }
    }
}

/// What a rule is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext<'a> {
    /// Normalized client identifier.
    pub identifier: &'a str,
    /// Resolved location of the client.
    pub geo: &'a GeoLocation,
    /// The request itself.
    pub request: &'a FilterRequest,
}

/// A compiled, enabled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Rule name.
    pub name: String,
    /// Evaluation order, lowest first.
    pub priority: i32,
    /// Action on match.
    pub action: RuleAction,
    /// Match condition.
    pub matcher: RuleMatcher,
    /// Free-form description.
    pub description: String,
}

impl Rule {
    /// Compile a stored record.
    ///
    /// `rate_limit` records are rejected: request thresholds come only from
    /// [`crate::config::RateLimitConfig`].
    ///
    /// # Errors
    ///
    /// Returns `FirewallError::InvalidRule` if the value does not fit the type.
    pub fn compile(record: &RuleRecord) -> FirewallResult<Self> {
        let invalid = |reason: String| FirewallError::invalid_rule(&record.name, reason);
        let value = record.value.trim();
        if value.is_empty() {
            return Err(invalid("value must not be empty".into()));
        }

        let matcher = match record.kind {
            RuleType::IpBlock => RuleMatcher::IpBlock(IpPattern::parse(value).map_err(invalid)?),
            RuleType::CountryBlock => {
                if value.len() != 2 || !value.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Err(invalid(format!(
                        "'{value}' is not a 2-letter country code"
                    )));
                }
                RuleMatcher::CountryBlock(value.to_ascii_uppercase())
            }
            RuleType::SuspiciousPattern => {
                RuleMatcher::SuspiciousPattern(TextPattern::parse(value).map_err(invalid)?)
            }
            RuleType::RateLimit => {
                return Err(invalid(
                    "rate_limit rules are not supported; set rate_limit thresholds in the \
                     firewall configuration"
                        .into(),
                ));
            }
        };

        Ok(Self {
            name: record.name.clone(),
            priority: record.priority,
            action: record.action,
            matcher,
            description: record.description.clone(),
        })
    }

    /// Whether the rule matches a request.
    #[must_use]
    pub fn matches(&self, ctx: &MatchContext<'_>) -> bool {
        self.matcher.matches(ctx)
    }

    /// Type of the rule.
    #[must_use]
    pub const fn kind(&self) -> RuleType {
        self.matcher.kind()
    }
}

/// Outcome of compiling a batch of records.
#[derive(Debug, Default)]
pub struct CompiledRules {
    /// Enabled, compiled rules in ascending priority (stable for ties).
    pub rules: Vec<Rule>,
    /// Records that were skipped, with the reason.
    pub skipped: Vec<FirewallError>,
}

/// Compile records, dropping disabled and malformed ones.
#[must_use]
pub fn compile_rules(records: &[RuleRecord]) -> CompiledRules {
    let mut compiled = CompiledRules::default();
    for record in records.iter().filter(|r| r.enabled) {
        match Rule::compile(record) {
            Ok(rule) => compiled.rules.push(rule),
            Err(e) => {
                warn!(rule = %record.name, error = %e, "Skipping rule");
                compiled.skipped.push(e);
            }
        }
    }
    compiled.rules.sort_by_key(|r| r.priority);
    compiled
}

#[derive(Debug)]
struct CachedRules {
    rules: Arc<[Rule]>,
    expires_at: DateTime<Utc>,
}

/// Priority-ordered rule evaluation over a rule storage collaborator.
pub struct RuleStore {
    storage: Arc<dyn RuleStorage>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
    cache: RwLock<Option<CachedRules>>,
}

impl fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleStore")
            .field("cache_ttl", &self.cache_ttl)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl RuleStore {
    /// Create from configuration.
    #[must_use]
    pub fn from_config(
        config: &RulesConfig,
        storage: Arc<dyn RuleStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            clock,
            cache_ttl: config.cache_ttl,
            cache: RwLock::new(None),
        }
    }

    /// Enabled, compiled rules in ascending priority.
    ///
    /// Served from cache while it is fresh. A storage failure keeps the
    /// previous rules, or none if nothing was ever loaded.
    #[must_use]
    pub fn active_rules_sorted_by_priority(&self) -> Arc<[Rule]> {
        let now = self.clock.now();
        if let Some(cached) = self.cache.read().as_ref() {
            if now < cached.expires_at {
                return Arc::clone(&cached.rules);
            }
        }

        match self.storage.find_enabled_sorted_by_priority() {
            Ok(records) => {
                let rules: Arc<[Rule]> = compile_rules(&records).rules.into();
                debug!(count = rules.len(), "Loaded firewall rules");
                *self.cache.write() = Some(CachedRules {
                    rules: Arc::clone(&rules),
                    expires_at: saturating_add(now, self.cache_ttl),
                });
                rules
            }
            Err(e) => {
                warn!(error = %e, "Rule storage unavailable, using previous rules");
                self.cache
                    .read()
                    .as_ref()
                    .map_or_else(|| Arc::from(Vec::<Rule>::new()), |c| Arc::clone(&c.rules))
            }
        }
    }

    /// First matching rule in priority order.
    #[must_use]
    pub fn evaluate(&self, ctx: &MatchContext<'_>) -> Option<Rule> {
        self.active_rules_sorted_by_priority()
            .iter()
            .find(|rule| rule.matches(ctx))
            .cloned()
    }

    /// Force the next evaluation to reload from storage.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }
}
