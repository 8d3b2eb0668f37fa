//! Geographic enrichment of client identifiers.
//!
//! Geo data is advisory: lookups never fail a request. Private and loopback
//! addresses resolve to [`GeoLocation::local`] without touching the lookup
//! collaborator, and any failure resolves to [`GeoLocation::unknown`].

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GeoConfig;
use crate::error::FirewallResult;

const LOCAL: &str = "Local";
const UNKNOWN: &str = "Unknown";

/// Resolved location of a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeoLocation {
    /// Country code (normally ISO 3166-1 alpha-2).
    pub country: String,
    /// Region or state.
    pub region: String,
    /// City.
    pub city: String,
}

impl GeoLocation {
    /// Create a location.
    #[must_use]
    pub fn new(
        country: impl Into<String>,
        region: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        Self {
            country: country.into(),
            region: region.into(),
            city: city.into(),
        }
    }

    /// Location of private and loopback clients.
    #[must_use]
    pub fn local() -> Self {
        Self::new(LOCAL, LOCAL, LOCAL)
    }

    /// Location when nothing could be resolved.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(UNKNOWN, UNKNOWN, UNKNOWN)
    }

    /// Whether this is the `Local` classification.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.country == LOCAL
    }

    /// Whether this is the `Unknown` classification.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.country == UNKNOWN
    }
}

impl Default for GeoLocation {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for GeoLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.country, self.region, self.city)
    }
}

/// External geo-IP database.
pub trait GeoLookup: Send + Sync {
    /// Look up an identifier. `Ok(None)` means the database has no record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database itself failed.
    fn lookup(&self, identifier: &str) -> FirewallResult<Option<GeoLocation>>;
}

impl<F> GeoLookup for F
where
    F: Fn(&str) -> FirewallResult<Option<GeoLocation>> + Send + Sync,
{
    fn lookup(&self, identifier: &str) -> FirewallResult<Option<GeoLocation>> {
        self(identifier)
    }
}

/// Lookup that knows nothing. Used when no geo database is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeoLookup;

impl GeoLookup for NoGeoLookup {
    fn lookup(&self, _identifier: &str) -> FirewallResult<Option<GeoLocation>> {
        Ok(None)
    }
}

/// Resolves identifiers to locations with caching.
pub struct GeoResolver {
    enabled: bool,
    lookup: Arc<dyn GeoLookup>,
    cache: RwLock<HashMap<IpAddr, GeoLocation>>,
    cache_capacity: usize,
}

impl fmt::Debug for GeoResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoResolver")
            .field("enabled", &self.enabled)
            .field("cached", &self.cache.read().len())
            .field("cache_capacity", &self.cache_capacity)
            .finish_non_exhaustive()
    }
}

impl GeoResolver {
    /// Create a resolver around a lookup collaborator.
    #[must_use]
    pub fn new(lookup: Arc<dyn GeoLookup>) -> Self {
        Self::from_config(&GeoConfig::default(), lookup)
    }

    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &GeoConfig, lookup: Arc<dyn GeoLookup>) -> Self {
        Self {
            enabled: config.enabled,
            lookup,
            cache: RwLock::new(HashMap::new()),
            cache_capacity: config.cache_capacity,
        }
    }

    /// A resolver that never looks anything up.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            lookup: Arc::new(NoGeoLookup),
            cache: RwLock::new(HashMap::new()),
            cache_capacity: 0,
        }
    }

    /// Resolve an identifier.
    #[must_use]
    pub fn resolve(&self, identifier: &str) -> GeoLocation {
        let Ok(ip) = identifier.parse::<IpAddr>() else {
            return GeoLocation::unknown();
        };

        if is_local(&ip) {
            return GeoLocation::local();
        }

        if !self.enabled {
            return GeoLocation::unknown();
        }

        if let Some(cached) = self.cache.read().get(&ip) {
            return cached.clone();
        }

        let location = match self.lookup.lookup(identifier) {
            Ok(Some(location)) => location,
            Ok(None) => {
                debug!(identifier = %identifier, "No geo record");
                GeoLocation::unknown()
            }
            Err(e) => {
                // Errors are not cached so the next request retries.
                warn!(identifier = %identifier, error = %e, "Geo lookup failed");
                return GeoLocation::unknown();
            }
        };

        if self.cache_capacity > 0 {
            let mut cache = self.cache.write();
            if cache.len() >= self.cache_capacity {
                cache.clear();
            }
            cache.insert(ip, location.clone());
        }

        location
    }

    /// Number of cached lookups.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    /// Drop all cached lookups.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Whether external lookups are enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Loopback, RFC 1918, link-local and IPv6 unique-local ranges.
#[must_use]
pub fn is_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_local(&IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirewallError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    /// Lookup that counts calls and returns a fixed answer.
    #[derive(Default)]
    struct CountingLookup {
        calls: AtomicUsize,
    }

    impl GeoLookup for CountingLookup {
        fn lookup(&self, _identifier: &str) -> FirewallResult<Option<GeoLocation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(GeoLocation::new("DE", "Berlin", "Berlin")))
        }
    }

    #[test_case("127.0.0.1" ; "loopback")]
    #[test_case("10.1.2.3" ; "ten slash eight")]
    #[test_case("172.16.0.9" ; "one seventy two")]
    #[test_case("172.31.255.1" ; "one seventy two upper")]
    #[test_case("192.168.1.1" ; "one ninety two")]
    #[test_case("169.254.0.1" ; "link local")]
    #[test_case("::1" ; "v6 loopback")]
    #[test_case("fd00::1" ; "v6 unique local")]
    #[test_case("::ffff:192.168.0.1" ; "mapped private")]
    fn test_local_ranges_skip_lookup(identifier: &str) {
        let lookup = Arc::new(CountingLookup::default());
        let resolver = GeoResolver::new(lookup.clone());

        assert_eq!(resolver.resolve(identifier), GeoLocation::local());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[test_case("172.32.0.1" ; "just outside 172.16/12")]
    #[test_case("8.8.8.8" ; "public v4")]
    #[test_case("2001:db8::1" ; "public v6")]
    fn test_public_addresses_are_looked_up(identifier: &str) {
        let lookup = Arc::new(CountingLookup::default());
        let resolver = GeoResolver::new(lookup.clone());

        assert_eq!(resolver.resolve(identifier).country, "DE");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lookups_are_cached() {
        let lookup = Arc::new(CountingLookup::default());
        let resolver = GeoResolver::new(lookup.clone());

        for _ in 0..5 {
            let _ = resolver.resolve("8.8.8.8");
        }
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached_count(), 1);

        resolver.clear_cache();
        let _ = resolver.resolve("8.8.8.8");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_flushes_when_full() {
        let config = GeoConfig {
            enabled: true,
            cache_capacity: 2,
        };
        let resolver = GeoResolver::from_config(&config, Arc::new(CountingLookup::default()));

        let _ = resolver.resolve("8.8.8.8");
        let _ = resolver.resolve("8.8.4.4");
        assert_eq!(resolver.cached_count(), 2);
        let _ = resolver.resolve("1.1.1.1");
        assert_eq!(resolver.cached_count(), 1);
    }

    #[test]
    fn test_lookup_error_is_unknown() {
        let failing = |identifier: &str| -> FirewallResult<Option<GeoLocation>> {
            Err(FirewallError::GeoLookup {
                identifier: identifier.to_string(),
                reason: "database offline".into(),
            })
        };
        let resolver = GeoResolver::new(Arc::new(failing));

        assert_eq!(resolver.resolve("8.8.8.8"), GeoLocation::unknown());
        assert_eq!(resolver.cached_count(), 0);
    }

    #[test]
    fn test_not_found_is_unknown() {
        let resolver = GeoResolver::new(Arc::new(NoGeoLookup));
        assert!(resolver.resolve("8.8.8.8").is_unknown());
    }

    #[test]
    fn test_non_ip_identifier_is_unknown() {
        let lookup = Arc::new(CountingLookup::default());
        let resolver = GeoResolver::new(lookup.clone());

        assert!(resolver.resolve("10.0.0.0/8").is_unknown());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disabled_resolver() {
        let resolver = GeoResolver::disabled();
        assert!(!resolver.is_enabled());
        assert!(resolver.resolve("8.8.8.8").is_unknown());
        assert!(resolver.resolve("127.0.0.1").is_local());
    }

    #[test]
    fn test_display() {
        let loc = GeoLocation::new("US", "CA", "San Francisco");
        assert_eq!(loc.to_string(), "US/CA/San Francisco");
    }
}
