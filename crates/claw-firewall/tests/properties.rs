//! Property tests for the rate limiter and rule ordering.

use std::sync::Arc;
use std::time::Duration;

use claw_firewall::{
    Clock, DecisionCode, FilterEngine, FilterRequest, FirewallConfig, ManualClock,
    MemoryRuleStorage, RateLimitConfig, RuleAction, RuleRecord, RuleType,
};
use proptest::prelude::*;

fn engine(per_minute: u32, per_hour: u32, delays: Vec<u64>) -> (FilterEngine, ManualClock) {
    let clock = ManualClock::starting_now();
    let config = FirewallConfig::builder()
        .rate_limit(RateLimitConfig {
            enabled: true,
            per_minute_limit: per_minute,
            per_hour_limit: per_hour,
            progressive_delays: delays.into_iter().map(Duration::from_secs).collect(),
        })
        .build();
    let engine = FilterEngine::builder(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    (engine, clock)
}

fn request() -> FilterRequest {
    FilterRequest::new("GET", "/").with_remote_addr("203.0.113.77")
}

/// Strictly increasing, non-zero delay tiers that together stay under an hour.
fn delay_tiers() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..120, 1..6).prop_map(|steps| {
        steps
            .iter()
            .scan(0u64, |acc, step| {
                *acc += step;
                Some(*acc)
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn limit_plus_one_within_a_minute_is_limited(
        limit in 1u32..30,
        gaps in prop::collection::vec(0u64..=2, 30),
    ) {
        let (engine, clock) = engine(limit, 10_000, vec![10]);
        let start = clock.now();

        let mut elapsed = 0u64;
        for gap in gaps.iter().take(limit as usize) {
            elapsed = (elapsed + gap).min(59);
            clock.set(start + chrono::Duration::seconds(elapsed as i64));
            prop_assert!(engine.decide(&request()).allow);
        }
        let decision = engine.decide(&request());
        prop_assert_eq!(decision.code, DecisionCode::RateLimited);
    }

    #[test]
    fn delays_follow_tiers_then_block(delays in delay_tiers()) {
        let (engine, clock) = engine(1, 1, delays.clone());
        prop_assert!(engine.decide(&request()).allow);

        let mut previous = None;
        for delay in &delays {
            let now = clock.now();
            let decision = engine.decide(&request());
            let until = decision.retry_after.unwrap();
            prop_assert_eq!(until, now + chrono::Duration::seconds(*delay as i64));
            prop_assert!(previous.is_none_or(|p| p <= until));
            previous = Some(until);
            clock.set(until);
        }

        let terminal = engine.decide(&request());
        prop_assert_eq!(terminal.code, DecisionCode::IpBlockedRateLimit);
        let entry = engine.blocklist().is_blocked("203.0.113.77").unwrap();
        prop_assert!(entry.permanent);
        prop_assert_eq!(entry.attempts as usize, delays.len() + 1);
        prop_assert_eq!(engine.decide(&request()).code, DecisionCode::IpBlocked);
    }

    #[test]
    fn lowest_priority_matching_rule_triggers(
        priorities in prop::collection::vec(-100i32..100, 1..8),
    ) {
        let records: Vec<_> = priorities
            .iter()
            .enumerate()
            .map(|(i, p)| {
                RuleRecord::new(format!("rule-{i}"), RuleType::IpBlock, "192.0.2.", RuleAction::Block, *p)
            })
            .collect();
        let min = *priorities.iter().min().unwrap();
        let first_min = priorities.iter().position(|p| *p == min).unwrap();

        let engine = FilterEngine::builder(FirewallConfig::default())
            .rule_storage(Arc::new(MemoryRuleStorage::new(records)))
            .build()
            .unwrap();
        let decision = engine.decide(&FilterRequest::new("GET", "/").with_remote_addr("192.0.2.9"));

        let expected = format!("rule-{first_min}");
        prop_assert_eq!(decision.triggering_rule.as_deref(), Some(expected.as_str()));
    }
}
