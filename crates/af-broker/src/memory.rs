//! In-memory partitioned broker
//!
//! Embedded broker for development and tests. Each (topic, partition) is an
//! append-only log with bounded retention; each consumer group keeps its own
//! committed offset per partition.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use af_common::{AccountFlowError, Result};
use crate::{partition_for, BrokerConsumer, BrokerPublisher, BrokerRecord, PublishReceipt};

#[derive(Default)]
struct PartitionLog {
    /// Offset of the first retained record
    base_offset: u64,
    records: VecDeque<BrokerRecord>,
}

impl PartitionLog {
    fn end_offset(&self) -> u64 {
        self.base_offset + self.records.len() as u64
    }
}

pub struct InMemoryBroker {
    identifier: String,
    partitions: u32,
    retention: usize,
    logs: DashMap<(String, u32), PartitionLog>,
    committed: DashMap<(String, String, u32), u64>,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new(partitions: u32, retention: usize) -> Self {
        Self {
            identifier: "in-memory-broker".to_string(),
            partitions: partitions.max(1),
            retention: retention.max(1),
            logs: DashMap::new(),
            committed: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: publish, fetch and commit fail while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(AccountFlowError::Broker("broker unavailable".to_string()))
        }
    }

    /// Every retained record on a topic, partition by partition
    pub fn records(&self, topic: &str) -> Vec<BrokerRecord> {
        (0..self.partitions)
            .filter_map(|p| {
                self.logs
                    .get(&(topic.to_string(), p))
                    .map(|log| log.records.iter().cloned().collect::<Vec<_>>())
            })
            .flatten()
            .collect()
    }

    pub fn end_offset(&self, topic: &str, partition: u32) -> u64 {
        self.logs
            .get(&(topic.to_string(), partition))
            .map(|log| log.end_offset())
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> u64 {
        self.committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|o| *o)
            .unwrap_or(0)
    }

    /// Records not yet committed by `group` across all partitions of `topic`
    pub fn lag(&self, group: &str, topic: &str) -> u64 {
        (0..self.partitions)
            .map(|p| {
                self.end_offset(topic, p)
                    .saturating_sub(self.committed_offset(group, topic, p))
            })
            .sum()
    }
}

#[async_trait]
impl BrokerPublisher for InMemoryBroker {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn publish(&self, topic: &str, key: &str, payload: String) -> Result<PublishReceipt> {
        self.ensure_available()?;

        let partition = partition_for(key, self.partitions);
        let mut log = self.logs.entry((topic.to_string(), partition)).or_default();

        let offset = log.end_offset();
        log.records.push_back(BrokerRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.to_string(),
            payload,
            published_at: Utc::now(),
        });

        while log.records.len() > self.retention {
            log.records.pop_front();
            log.base_offset += 1;
        }

        debug!(topic = %topic, partition = partition, offset = offset, "Record appended");

        Ok(PublishReceipt {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryBroker {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn partition_count(&self) -> u32 {
        self.partitions
    }

    async fn fetch(&self, group: &str, topic: &str, partition: u32, max: usize) -> Result<Vec<BrokerRecord>> {
        self.ensure_available()?;

        let committed = self.committed_offset(group, topic, partition);
        let log = match self.logs.get(&(topic.to_string(), partition)) {
            Some(log) => log,
            None => return Ok(Vec::new()),
        };

        if committed < log.base_offset {
            warn!(
                group = %group,
                topic = %topic,
                partition = partition,
                committed = committed,
                base_offset = log.base_offset,
                "Committed offset fell behind retention, skipping trimmed records"
            );
        }

        let start = committed.saturating_sub(log.base_offset) as usize;
        Ok(log.records.iter().skip(start).take(max).cloned().collect())
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, next_offset: u64) -> Result<()> {
        self.ensure_available()?;

        let end = self.end_offset(topic, partition);
        let mut offset = self
            .committed
            .entry((group.to_string(), topic.to_string(), partition))
            .or_insert(0);
        *offset = (*offset).max(next_offset.min(end));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_fetch_commit() {
        let broker = InMemoryBroker::new(1, 100);
        broker.publish("t", "1", "a".to_string()).await.unwrap();
        broker.publish("t", "1", "b".to_string()).await.unwrap();

        let records = broker.fetch("g", "t", 0, 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, "a");

        // Nothing committed yet: same records come back
        let again = broker.fetch("g", "t", 0, 10).await.unwrap();
        assert_eq!(again[0].offset, 0);

        broker.commit("g", "t", 0, 1).await.unwrap();
        let rest = broker.fetch("g", "t", 0, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, "b");
        assert_eq!(broker.lag("g", "t"), 1);

        // Other groups are independent
        assert_eq!(broker.fetch("other", "t", 0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_never_moves_backwards() {
        let broker = InMemoryBroker::new(1, 100);
        for i in 0..3 {
            broker.publish("t", "k", i.to_string()).await.unwrap();
        }
        broker.commit("g", "t", 0, 2).await.unwrap();
        broker.commit("g", "t", 0, 1).await.unwrap();
        assert_eq!(broker.committed_offset("g", "t", 0), 2);

        broker.commit("g", "t", 0, 99).await.unwrap();
        assert_eq!(broker.committed_offset("g", "t", 0), 3);
    }

    #[tokio::test]
    async fn test_same_key_keeps_order_on_one_partition() {
        let broker = InMemoryBroker::new(4, 100);
        let mut partitions = std::collections::HashSet::new();
        for i in 0..5 {
            let receipt = broker.publish("t", "42", i.to_string()).await.unwrap();
            partitions.insert(receipt.partition);
        }
        assert_eq!(partitions.len(), 1);

        let partition = *partitions.iter().next().unwrap();
        let payloads: Vec<String> = broker
            .fetch("g", "t", partition, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.payload)
            .collect();
        assert_eq!(payloads, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_retention_trims_oldest() {
        let broker = InMemoryBroker::new(1, 2);
        for i in 0..4 {
            broker.publish("t", "k", i.to_string()).await.unwrap();
        }
        let records = broker.fetch("g", "t", 0, 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 2);
        assert_eq!(broker.end_offset("t", 0), 4);
    }

    #[tokio::test]
    async fn test_unavailable_broker_rejects() {
        let broker = InMemoryBroker::new(1, 10);
        broker.set_available(false);
        assert!(broker.publish("t", "k", "x".to_string()).await.is_err());
        assert!(broker.fetch("g", "t", 0, 1).await.is_err());

        broker.set_available(true);
        assert!(broker.publish("t", "k", "x".to_string()).await.is_ok());
    }
}
