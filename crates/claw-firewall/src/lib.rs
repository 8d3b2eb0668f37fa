//! # claw-firewall
//!
//! Request filtering and adaptive rate limiting for HTTP gateways.
//!
//! Every inbound request is reduced to a client identifier (normally an IP
//! address) and passed through a fixed pipeline:
//!
//! - [`GeoResolver`] - Advisory location lookup with a local short-circuit
//! - [`BlockRegistry`] - Blocked addresses and networks, with expiry
//! - [`RuleStore`] - Priority-ordered `ip_block`, `country_block` and
//!   `suspicious_pattern` rules, first match wins
//! - [`RateLimiter`] - Sliding minute/hour windows with progressive delays,
//!   escalating to a permanent block
//! - [`EventLog`] - Fire-and-forget record of every decision
//!
//! [`FilterEngine`] ties them together and returns a [`Decision`] carrying a
//! stable [`DecisionCode`]. Infrastructure failures never deny a request:
//! each stage logs the error and lets the request through.
//!
//! Persistence is pluggable through the traits in [`storage`]; the
//! [`memory`] module has in-process implementations.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use claw_firewall::{
//!     DecisionCode, FilterEngine, FilterRequest, FirewallConfig, MemoryRuleStorage,
//!     RuleAction, RuleRecord, RuleType,
//! };
//!
//! let rules = MemoryRuleStorage::new(vec![RuleRecord::new(
//!     "office-range",
//!     RuleType::IpBlock,
//!     "10.0.0.",
//!     RuleAction::Block,
//!     5,
//! )]);
//! let engine = FilterEngine::builder(FirewallConfig::default())
//!     .rule_storage(Arc::new(rules))
//!     .build()
//!     .expect("default configuration is valid");
//!
//! let request = FilterRequest::new("GET", "/").with_remote_addr("10.0.0.42:41000");
//! let decision = engine.decide(&request);
//! assert_eq!(decision.code, DecisionCode::RuleBlocked);
//! assert_eq!(decision.http_status(), 403);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod blocklist;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod geo;
mod locks;
pub mod memory;
pub mod rate_limit;
pub mod request;
pub mod rules;
pub mod storage;

// Re-export main types
pub use blocklist::{BlockRegistry, BlockedEntry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BlocklistConfig, Environment, EventsConfig, FirewallConfig, FirewallConfigBuilder, GeoConfig,
    ProxyConfig, RateLimitConfig, RulesConfig,
};
pub use engine::{
    CleanupStats, Decision, DecisionCode, EngineStats, FilterEngine, FilterEngineBuilder,
};
pub use error::{FirewallError, FirewallResult, StorageError};
pub use events::{EventAction, EventLog, LogEvent, TracingLogStorage};
pub use geo::{GeoLocation, GeoLookup, GeoResolver, NoGeoLookup};
pub use memory::{MemoryBlockStorage, MemoryLogStorage, MemoryRateStorage, MemoryRuleStorage};
pub use rate_limit::{RateLimitState, RateLimiter, RateOutcome, RateState, RateStatus};
pub use request::{extract_identifier, peer_address, FilterRequest};
pub use rules::{compile_rules, Rule, RuleAction, RuleMatcher, RuleRecord, RuleStore, RuleType};
pub use storage::{BlockStorage, LogStorage, RateStorage, RuleStorage, StorageResult};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::FirewallConfig;
    pub use crate::engine::{Decision, DecisionCode, FilterEngine};
    pub use crate::error::{FirewallError, FirewallResult};
    pub use crate::events::{EventAction, EventLog};
    pub use crate::request::FilterRequest;
    pub use crate::rules::{RuleAction, RuleRecord, RuleType};
    pub use crate::storage::{BlockStorage, LogStorage, RateStorage, RuleStorage};
}
