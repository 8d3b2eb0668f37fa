//! Firewall configuration.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{FirewallError, FirewallResult};
use crate::request::normalize;

/// Durations are written as whole seconds in configuration files.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod secs_vec {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(v: &Vec<Duration>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(Duration::as_secs))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Vec::<u64>::deserialize(d).map(|v| v.into_iter().map(Duration::from_secs).collect())
    }
}

/// Deployment mode of the protected service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Full enforcement.
    #[default]
    Production,
    /// Loopback clients bypass the engine entirely.
    Development,
}

impl Environment {
    /// Whether this is a production deployment.
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Configuration for the progressive rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled.
    pub enabled: bool,
    /// Maximum requests in any trailing minute.
    pub per_minute_limit: u32,
    /// Maximum requests in any trailing hour.
    pub per_hour_limit: u32,
    /// Cooldown imposed after the n-th violation. Once a client exceeds
    /// the number of tiers it is blocked permanently.
    #[serde(rename = "progressive_delays_secs", with = "secs_vec")]
    pub progressive_delays: Vec<Duration>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute_limit: 60,
            per_hour_limit: 1000,
            progressive_delays: vec![
                Duration::from_secs(10),
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(1800),
            ],
        }
    }
}

impl RateLimitConfig {
    /// Check limits and delay tiers.
    ///
    /// # Errors
    ///
    /// Returns `FirewallError::Config` on zero limits, an empty ladder or
    /// tiers that are not strictly increasing.
    pub fn validate(&self) -> FirewallResult<()> {
        if self.per_minute_limit == 0 {
            return Err(FirewallError::Config("per_minute_limit must be positive".into()));
        }
        if self.per_hour_limit == 0 {
            return Err(FirewallError::Config("per_hour_limit must be positive".into()));
        }
        if self.progressive_delays.is_empty() {
            return Err(FirewallError::Config(
                "progressive_delays_secs must contain at least one tier".into(),
            ));
        }
        if self.progressive_delays.iter().any(Duration::is_zero) {
            return Err(FirewallError::Config(
                "progressive_delays_secs must be non-zero".into(),
            ));
        }
        if self.progressive_delays.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FirewallError::Config(
                "progressive_delays_secs must be strictly increasing".into(),
            ));
        }
        Ok(())
    }

    /// Number of delay tiers before a permanent block.
    #[must_use]
    pub fn tiers(&self) -> usize {
        self.progressive_delays.len()
    }
}

/// Configuration for the block registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    /// Duration of a manual temporary block when none is given.
    #[serde(rename = "default_block_secs", with = "secs")]
    pub default_block_duration: Duration,
    /// Reason recorded when the rate limiter blocks permanently.
    pub permanent_reason: String,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            default_block_duration: Duration::from_secs(3600),
            permanent_reason: "rate limit violations exceeded".into(),
        }
    }
}

/// Which proxies are trusted to carry the client address in headers.
///
/// Headers are only read when the socket peer lies inside one of
/// `trusted_proxies`. Anyone else could write them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Whether to read the client address from proxy headers at all.
    pub trust_proxy_headers: bool,
    /// Headers consulted in order. Names are case-insensitive.
    pub headers: Vec<String>,
    /// Networks of the reverse proxies in front of the service.
    pub trusted_proxies: Vec<IpNet>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            trust_proxy_headers: false,
            headers: vec![
                "cf-connecting-ip".into(),
                "x-real-ip".into(),
                "x-forwarded-for".into(),
            ],
            trusted_proxies: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Trust headers from peers in `networks`.
    #[must_use]
    pub fn trusting(networks: impl IntoIterator<Item = IpNet>) -> Self {
        Self {
            trust_proxy_headers: true,
            trusted_proxies: networks.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Whether `ip` is one of the trusted proxies.
    #[must_use]
    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.trusted_proxies.iter().any(|net| net.contains(&ip))
    }
}

/// Configuration for geo enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Whether lookups are performed. Disabled resolves everything to `Unknown`.
    pub enabled: bool,
    /// Maximum cached lookups before the cache is flushed.
    pub cache_capacity: usize,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_capacity: 10_000,
        }
    }
}

/// Configuration for the compiled rule cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// How long compiled rules are reused before reloading from storage.
    /// Zero reloads on every request.
    #[serde(rename = "cache_ttl_secs", with = "secs")]
    pub cache_ttl: Duration,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
        }
    }
}

/// Configuration for the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Whether decisions are recorded.
    pub enabled: bool,
    /// Header values replaced with `[redacted]` before recording.
    pub redact_headers: Vec<String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_headers: vec![
                "authorization".into(),
                "cookie".into(),
                "proxy-authorization".into(),
                "set-cookie".into(),
            ],
        }
    }
}

/// Main firewall configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Deployment mode.
    pub environment: Environment,
    /// Rate limiting settings.
    pub rate_limit: RateLimitConfig,
    /// Block registry settings.
    pub blocklist: BlocklistConfig,
    /// Client address extraction settings.
    pub proxy: ProxyConfig,
    /// Geo enrichment settings.
    pub geo: GeoConfig,
    /// Rule cache settings.
    pub rules: RulesConfig,
    /// Event log settings.
    pub events: EventsConfig,
    /// Identifiers that are always allowed.
    pub whitelist: HashSet<String>,
}

impl FirewallConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> FirewallConfigBuilder {
        FirewallConfigBuilder::default()
    }

    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or fails validation.
    pub fn from_json_str(json: &str) -> FirewallResult<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.normalize_whitelist()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> FirewallResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns `FirewallError::Config` describing the first problem found.
    pub fn validate(&self) -> FirewallResult<()> {
        self.rate_limit.validate()?;
        if self.proxy.trust_proxy_headers {
            if self.proxy.headers.iter().any(|h| h.trim().is_empty()) {
                return Err(FirewallError::Config("proxy header names must not be empty".into()));
            }
            if self.proxy.trusted_proxies.is_empty() {
                return Err(FirewallError::Config(
                    "trust_proxy_headers requires at least one trusted_proxies network".into(),
                ));
            }
        }
        Ok(())
    }

    /// Rewrite whitelist entries into the form identifiers are extracted in,
    /// so `2001:DB8::1` and `::ffff:1.2.3.4` match their clients.
    ///
    /// # Errors
    ///
    /// Returns `FirewallError::Config` if an entry is not an IP address.
    pub fn normalize_whitelist(&mut self) -> FirewallResult<()> {
        self.whitelist = self
            .whitelist
            .iter()
            .map(|entry| {
                entry
                    .trim()
                    .parse::<IpAddr>()
                    .map(normalize)
                    .map_err(|_| {
                        FirewallError::Config(format!("whitelist entry '{entry}' is not an IP address"))
                    })
            })
            .collect::<FirewallResult<_>>()?;
        Ok(())
    }

    /// Check if an identifier is whitelisted.
    #[must_use]
    pub fn is_whitelisted(&self, identifier: &str) -> bool {
        self.whitelist.contains(identifier)
    }
}

/// Builder for `FirewallConfig`.
#[derive(Debug, Clone, Default)]
pub struct FirewallConfigBuilder {
    config: FirewallConfig,
}

impl FirewallConfigBuilder {
    /// Set the deployment mode.
    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    /// Set rate limit configuration.
    #[must_use]
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Set blocklist configuration.
    #[must_use]
    pub fn blocklist(mut self, config: BlocklistConfig) -> Self {
        self.config.blocklist = config;
        self
    }

    /// Set proxy configuration.
    #[must_use]
    pub fn proxy(mut self, config: ProxyConfig) -> Self {
        self.config.proxy = config;
        self
    }

    /// Set geo configuration.
    #[must_use]
    pub fn geo(mut self, config: GeoConfig) -> Self {
        self.config.geo = config;
        self
    }

    /// Set rule cache configuration.
    #[must_use]
    pub fn rules(mut self, config: RulesConfig) -> Self {
        self.config.rules = config;
        self
    }

    /// Set event log configuration.
    #[must_use]
    pub fn events(mut self, config: EventsConfig) -> Self {
        self.config.events = config;
        self
    }

    /// Add a whitelisted identifier.
    #[must_use]
    pub fn whitelist(mut self, identifier: impl Into<String>) -> Self {
        self.config.whitelist.insert(identifier.into());
        self
    }

    /// Build the configuration without validating it.
    #[must_use]
    pub fn build(self) -> FirewallConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FirewallConfig::default();

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.rate_limit.per_minute_limit, 60);
        assert_eq!(config.rate_limit.per_hour_limit, 1000);
        assert_eq!(config.rate_limit.tiers(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = FirewallConfig::builder()
            .environment(Environment::Development)
            .whitelist("203.0.113.7")
            .build();

        assert!(!config.environment.is_production());
        assert!(config.is_whitelisted("203.0.113.7"));
        assert!(!config.is_whitelisted("203.0.113.8"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = RateLimitConfig {
            per_minute_limit: 0,
            ..RateLimitConfig::default()
        };
        assert!(matches!(config.validate(), Err(FirewallError::Config(_))));

        let config = RateLimitConfig {
            per_hour_limit: 0,
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_increasing_delays() {
        let config = RateLimitConfig {
            progressive_delays: vec![Duration::from_secs(60), Duration::from_secs(60)],
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RateLimitConfig {
            progressive_delays: vec![Duration::from_secs(60), Duration::from_secs(10)],
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_or_zero_delays() {
        let config = RateLimitConfig {
            progressive_delays: vec![],
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RateLimitConfig {
            progressive_delays: vec![Duration::ZERO, Duration::from_secs(5)],
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_uses_seconds_and_defaults() {
        let json = r#"{
            "environment": "development",
            "rate_limit": { "per_minute_limit": 3, "progressive_delays_secs": [10, 20] },
            "rules": { "cache_ttl_secs": 0 },
            "whitelist": ["10.1.1.1"]
        }"#;
        let config = FirewallConfig::from_json_str(json).unwrap();

        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.rate_limit.per_minute_limit, 3);
        assert_eq!(config.rate_limit.per_hour_limit, 1000);
        assert_eq!(
            config.rate_limit.progressive_delays,
            vec![Duration::from_secs(10), Duration::from_secs(20)]
        );
        assert_eq!(config.rules.cache_ttl, Duration::ZERO);
        assert!(config.is_whitelisted("10.1.1.1"));
    }

    #[test]
    fn test_from_json_validates() {
        let json = r#"{ "rate_limit": { "progressive_delays_secs": [30, 10] } }"#;
        assert!(matches!(
            FirewallConfig::from_json_str(json),
            Err(FirewallError::Config(_))
        ));
    }

    #[test]
    fn test_from_json_malformed() {
        assert!(matches!(
            FirewallConfig::from_json_str("{ not json"),
            Err(FirewallError::Json(_))
        ));
    }

    #[test]
    fn test_json_roundtrip_keeps_seconds() {
        let config = FirewallConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["blocklist"]["default_block_secs"], 3600);
        assert_eq!(json["rate_limit"]["progressive_delays_secs"][0], 10);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firewall.json");
        std::fs::write(&path, r#"{ "geo": { "enabled": false } }"#).unwrap();

        let config = FirewallConfig::load(&path).unwrap();
        assert!(!config.geo.enabled);
        assert_eq!(config.geo.cache_capacity, 10_000);
    }

    #[test]
    fn test_validate_rejects_blank_proxy_header() {
        let config = FirewallConfig::builder()
            .proxy(ProxyConfig {
                headers: vec![" ".into()],
                ..ProxyConfig::trusting(["10.0.0.0/8".parse().unwrap()])
            })
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_trust_without_proxies() {
        let config = FirewallConfig::builder()
            .proxy(ProxyConfig {
                trust_proxy_headers: true,
                ..ProxyConfig::default()
            })
            .build();
        assert!(matches!(config.validate(), Err(FirewallError::Config(_))));

        let json = r#"{ "proxy": { "trust_proxy_headers": true, "trusted_proxies": ["10.0.0.0/8"] } }"#;
        let config = FirewallConfig::from_json_str(json).unwrap();
        assert!(config.proxy.is_trusted("10.4.5.6".parse().unwrap()));
        assert!(!config.proxy.is_trusted("203.0.113.1".parse().unwrap()));
    }

    #[test]
    fn test_whitelist_entries_are_normalized() {
        let json = r#"{ "whitelist": ["2001:DB8:0::1", "::ffff:1.2.3.4", " 10.1.1.1 "] }"#;
        let config = FirewallConfig::from_json_str(json).unwrap();

        assert!(config.is_whitelisted("2001:db8::1"));
        assert!(config.is_whitelisted("1.2.3.4"));
        assert!(config.is_whitelisted("10.1.1.1"));
    }

    #[test]
    fn test_whitelist_rejects_non_addresses() {
        let json = r#"{ "whitelist": ["office"] }"#;
        assert!(matches!(
            FirewallConfig::from_json_str(json),
            Err(FirewallError::Config(_))
        ));
    }

    #[test]
    fn test_default_sections() {
        let proxy = ProxyConfig::default();
        assert!(!proxy.trust_proxy_headers);
        assert!(proxy.trusted_proxies.is_empty());
        assert_eq!(proxy.headers[0], "cf-connecting-ip");

        let events = EventsConfig::default();
        assert!(events.redact_headers.contains(&"authorization".to_string()));

        let blocklist = BlocklistConfig::default();
        assert_eq!(blocklist.permanent_reason, "rate limit violations exceeded");
    }
}
