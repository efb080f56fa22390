//! LifecycleAggregator - the only writer of AggregateStats
//!
//! Per event:
//! 1. lock the dedup shard for the account; a known id is acknowledged as-is
//! 2. lock the aggregate, apply the delta to a copy and persist it
//! 3. swap the copy in, then remember the id
//!
//! Returning Ok is what lets the subscription commit the offset, so nothing
//! is acknowledged before it is durably applied.

use std::sync::Arc;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use af_broker::LifecycleHandler;
use af_common::{AccountLifecycleEvent, Result};
use crate::dedup::DedupWindow;
use crate::store::{AppliedEvent, StatsStore};
use crate::AggregateStats;

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(AggregateStats),
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Applied ids remembered for deduplication
    pub dedup_window: usize,
    pub dedup_shards: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            dedup_window: 100_000,
            dedup_shards: 16,
        }
    }
}

pub struct LifecycleAggregator {
    dedup: DedupWindow,
    dedup_window: usize,
    aggregate: Mutex<AggregateStats>,
    store: Arc<dyn StatsStore>,
}

impl LifecycleAggregator {
    pub fn new(store: Arc<dyn StatsStore>, config: AggregatorConfig) -> Self {
        Self {
            dedup: DedupWindow::new(config.dedup_window, config.dedup_shards),
            dedup_window: config.dedup_window,
            aggregate: Mutex::new(AggregateStats::default()),
            store,
        }
    }

    /// Rebuild the aggregate and dedup window from the store
    pub async fn restore(store: Arc<dyn StatsStore>, config: AggregatorConfig) -> Result<Self> {
        let aggregator = Self::new(store.clone(), config);

        if let Some(snapshot) = store.load().await? {
            *aggregator.aggregate.lock().await = snapshot;
        }
        let recent = store.recent_events(aggregator.dedup_window).await?;
        for applied in &recent {
            aggregator.dedup.lock_shard(applied.account_id).await.insert(&applied.event_id);
        }

        let snapshot = aggregator.snapshot().await;
        info!(
            total_accounts = snapshot.total_accounts,
            remembered_events = recent.len(),
            "Aggregate restored"
        );
        Ok(aggregator)
    }

    pub async fn apply(&self, event: &AccountLifecycleEvent) -> Result<ApplyOutcome> {
        let mut shard = self.dedup.lock_shard(event.account_id()).await;
        if shard.contains(event.event_id()) {
            metrics::counter!("af_consumer_duplicates_total").increment(1);
            debug!(event_id = %event.event_id(), account_id = event.account_id(), "Duplicate event ignored");
            return Ok(ApplyOutcome::Duplicate);
        }

        let snapshot = {
            let mut current = self.aggregate.lock().await;
            let mut next = current.clone();
            next.apply(event.event_type(), Utc::now());

            self.store
                .persist(
                    &next,
                    &AppliedEvent {
                        event_id: event.event_id().to_string(),
                        account_id: event.account_id(),
                    },
                )
                .await?;

            *current = next.clone();
            next
        };
        shard.insert(event.event_id());

        metrics::gauge!("af_stats_total_accounts").set(snapshot.total_accounts as f64);
        debug!(
            event_id = %event.event_id(),
            account_id = event.account_id(),
            event_type = ?event.event_type(),
            total_accounts = snapshot.total_accounts,
            "Lifecycle event applied"
        );

        Ok(ApplyOutcome::Applied(snapshot))
    }

    pub async fn snapshot(&self) -> AggregateStats {
        self.aggregate.lock().await.clone()
    }

    pub async fn remembered_events(&self) -> usize {
        self.dedup.len().await
    }
}

#[async_trait]
impl LifecycleHandler for LifecycleAggregator {
    async fn on_event(&self, event: &AccountLifecycleEvent) -> Result<()> {
        self.apply(event).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use af_common::{AccountEventType, AccountFlowError, AccountSnapshot};
    use crate::store::InMemoryStatsStore;

    fn event(id: &str, account_id: i64, event_type: AccountEventType) -> AccountLifecycleEvent {
        AccountLifecycleEvent::from_parts(
            id.to_string(),
            account_id,
            event_type,
            Utc::now(),
            AccountSnapshot::new("u", "USER", vec![]),
        )
    }

    fn aggregator() -> LifecycleAggregator {
        LifecycleAggregator::new(Arc::new(InMemoryStatsStore::new(1000)), AggregatorConfig::default())
    }

    /// Fails the first `fail_first` persists
    struct FlakyStore {
        inner: InMemoryStatsStore,
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatsStore for FlakyStore {
        async fn persist(&self, snapshot: &AggregateStats, applied: &AppliedEvent) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(AccountFlowError::Storage("write failed".to_string()));
            }
            self.inner.persist(snapshot, applied).await
        }

        async fn load(&self) -> Result<Option<AggregateStats>> {
            self.inner.load().await
        }

        async fn recent_events(&self, limit: usize) -> Result<Vec<AppliedEvent>> {
            self.inner.recent_events(limit).await
        }
    }

    #[tokio::test]
    async fn test_redelivery_is_a_no_op() {
        let aggregator = aggregator();
        let created = event("e-42", 42, AccountEventType::Created);

        assert!(matches!(aggregator.apply(&created).await.unwrap(), ApplyOutcome::Applied(_)));
        assert_eq!(aggregator.apply(&created).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(aggregator.apply(&created).await.unwrap(), ApplyOutcome::Duplicate);

        let stats = aggregator.snapshot().await;
        assert_eq!(stats.total_accounts, 1);
        assert_eq!(stats.applied_events, 1);
        assert!(stats.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_deltas_by_event_type() {
        let aggregator = aggregator();
        aggregator.apply(&event("c1", 1, AccountEventType::Created)).await.unwrap();
        aggregator.apply(&event("c2", 2, AccountEventType::Created)).await.unwrap();
        aggregator.apply(&event("u1", 1, AccountEventType::Updated)).await.unwrap();
        aggregator.apply(&event("d2", 2, AccountEventType::Deleted)).await.unwrap();

        let stats = aggregator.snapshot().await;
        assert_eq!(stats.total_accounts, 1);
        assert_eq!(stats.applied_events, 4);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_aggregate_and_window_untouched() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStatsStore::new(100),
            fail_first: 1,
            calls: AtomicUsize::new(0),
        });
        let aggregator = LifecycleAggregator::new(store, AggregatorConfig::default());
        let created = event("e-1", 1, AccountEventType::Created);

        assert!(aggregator.on_event(&created).await.is_err());
        assert_eq!(aggregator.snapshot().await.total_accounts, 0);
        assert_eq!(aggregator.remembered_events().await, 0);

        // Redelivery after the failure applies normally
        aggregator.on_event(&created).await.unwrap();
        assert_eq!(aggregator.snapshot().await.total_accounts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_accounts_are_serialized_on_the_aggregate() {
        let aggregator = Arc::new(aggregator());
        let mut handles = Vec::new();
        for account_id in 0..50i64 {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("c-{}", account_id);
                aggregator.apply(&event(&id, account_id, AccountEventType::Created)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = aggregator.snapshot().await;
        assert_eq!(stats.total_accounts, 50);
        assert_eq!(stats.applied_events, 50);
    }

    #[tokio::test]
    async fn test_cross_account_order_does_not_matter() {
        let a = vec![
            event("a1", 1, AccountEventType::Created),
            event("b1", 2, AccountEventType::Created),
            event("b2", 2, AccountEventType::Deleted),
        ];
        // Account 2's delete lands before account 1's create
        let b = vec![a[1].clone(), a[2].clone(), a[0].clone()];

        let first = aggregator();
        for e in &a {
            first.apply(e).await.unwrap();
        }
        let second = aggregator();
        for e in &b {
            second.apply(e).await.unwrap();
        }

        assert_eq!(first.snapshot().await.total_accounts, second.snapshot().await.total_accounts);
    }

    #[tokio::test]
    async fn test_restore_remembers_applied_ids() {
        let store = Arc::new(InMemoryStatsStore::new(1000));
        let created = event("e-9", 9, AccountEventType::Created);
        {
            let aggregator = LifecycleAggregator::new(store.clone(), AggregatorConfig::default());
            aggregator.apply(&created).await.unwrap();
        }

        let restored = LifecycleAggregator::restore(store, AggregatorConfig::default())
            .await
            .unwrap();
        assert_eq!(restored.snapshot().await.total_accounts, 1);
        assert_eq!(restored.apply(&created).await.unwrap(), ApplyOutcome::Duplicate);
    }
}
