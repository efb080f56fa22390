//! AccountFlow Broker
//!
//! Broker client seams used by the publisher and consumers:
//! - BrokerPublisher / BrokerConsumer: explicitly constructed clients, no global registry
//! - InMemoryBroker: partitioned append-only log with consumer-group offsets
//! - SubscriptionLoop: explicit subscribe + dispatch loop with commit-after-apply

pub mod memory;
pub mod partition;
pub mod subscription;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use af_common::{AccountLifecycleEvent, Result};

pub use memory::InMemoryBroker;
pub use partition::partition_for;
pub use subscription::{PartitionPoll, SubscriptionConfig, SubscriptionLoop, SubscriptionStats};

/// A record as stored on a partition
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: String,
    pub published_at: DateTime<Utc>,
}

/// Broker acknowledgment of a durable append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    fn identifier(&self) -> &str;

    /// Append to the partition chosen by `key`. Returns only once the broker
    /// has durably accepted the record.
    async fn publish(&self, topic: &str, key: &str, payload: String) -> Result<PublishReceipt>;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    fn identifier(&self) -> &str;

    fn partition_count(&self) -> u32;

    /// Records from the group's committed offset onwards. Uncommitted records
    /// are returned again on the next fetch.
    async fn fetch(&self, group: &str, topic: &str, partition: u32, max: usize) -> Result<Vec<BrokerRecord>>;

    /// Advance the group's offset. Offsets never move backwards.
    async fn commit(&self, group: &str, topic: &str, partition: u32, next_offset: u64) -> Result<()>;
}

/// Receives decoded lifecycle events from a subscription
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    async fn on_event(&self, event: &AccountLifecycleEvent) -> Result<()>;
}
