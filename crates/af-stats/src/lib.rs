//! AccountFlow Stats
//!
//! Consumes account lifecycle events and maintains a running aggregate.
//! Delivery is at-least-once; the dedup window makes application
//! effectively-once.

pub mod aggregator;
pub mod api;
pub mod dedup;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use af_common::AccountEventType;

pub use aggregator::{AggregatorConfig, ApplyOutcome, LifecycleAggregator};
pub use api::stats_router;
pub use dedup::DedupWindow;
pub use store::{AppliedEvent, InMemoryStatsStore, StatsStore};

/// Consumer group the aggregator subscribes under
pub const STATS_CONSUMER_GROUP: &str = "stats-aggregator";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    /// Creates minus deletes. Not clamped at zero: a delete may be applied
    /// before the create of the same account was seen by this aggregate.
    pub total_accounts: i64,
    pub last_updated: Option<DateTime<Utc>>,
    pub applied_events: u64,
}

impl AggregateStats {
    pub fn apply(&mut self, event_type: AccountEventType, now: DateTime<Utc>) {
        self.total_accounts += event_type.account_delta();
        self.last_updated = Some(now);
        self.applied_events += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_camel_case() {
        let mut stats = AggregateStats::default();
        stats.apply(AccountEventType::Created, Utc::now());

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalAccounts"], 1);
        assert_eq!(json["appliedEvents"], 1);
        assert!(json["lastUpdated"].is_string());
    }
}
