use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use af_common::Result;
use crate::AggregateStats;

/// An event id that has been applied, with the account it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEvent {
    pub event_id: String,
    pub account_id: i64,
}

/// Durable home of the aggregate.
///
/// `persist` writes the new snapshot and the id that produced it together;
/// the aggregator only acknowledges an event after it returns Ok.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn persist(&self, snapshot: &AggregateStats, applied: &AppliedEvent) -> Result<()>;

    async fn load(&self) -> Result<Option<AggregateStats>>;

    /// Most recently applied ids, oldest first
    async fn recent_events(&self, limit: usize) -> Result<Vec<AppliedEvent>>;
}

#[derive(Default)]
pub struct InMemoryStatsStore {
    snapshot: Mutex<Option<AggregateStats>>,
    applied: Mutex<VecDeque<AppliedEvent>>,
    retention: usize,
}

impl InMemoryStatsStore {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            ..Default::default()
        }
    }
}

#[async_trait]
impl StatsStore for InMemoryStatsStore {
    async fn persist(&self, snapshot: &AggregateStats, applied: &AppliedEvent) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());

        let mut log = self.applied.lock();
        log.push_back(applied.clone());
        while log.len() > self.retention {
            log.pop_front();
        }
        Ok(())
    }

    async fn load(&self) -> Result<Option<AggregateStats>> {
        Ok(self.snapshot.lock().clone())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<AppliedEvent>> {
        let log = self.applied.lock();
        let skip = log.len().saturating_sub(limit);
        Ok(log.iter().skip(skip).cloned().collect())
    }
}
