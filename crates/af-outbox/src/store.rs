use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use af_common::{DeliveryState, Result};
use crate::record::OutboxRecord;

/// Durable home of outbox records.
///
/// Records only reach the store as part of a committed transaction, so
/// everything `fetch_unsent` returns is eligible for sending.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist the records of a transaction that is committing
    async fn insert_committed(&self, records: &[OutboxRecord]) -> Result<()>;

    /// Records neither acknowledged nor dead-lettered, oldest first
    async fn fetch_unsent(&self, limit: u32) -> Result<Vec<OutboxRecord>>;

    /// Unsent records for one partition key, oldest first
    async fn fetch_unsent_for_key(&self, partition_key: &str, limit: u32) -> Result<Vec<OutboxRecord>>;

    async fn get(&self, id: &str) -> Result<Option<OutboxRecord>>;

    async fn mark_sent(&self, id: &str, attempts: u32) -> Result<()>;

    /// Broker acknowledged the record; it is removed from the outbox
    async fn mark_acked(&self, id: &str) -> Result<()>;

    async fn record_failure(
        &self,
        id: &str,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    /// Retry ceiling reached; the record leaves the outbox for the dead-letter log
    async fn mark_dead_lettered(&self, id: &str, attempts: u32, error: &str) -> Result<()>;
}

/// Outbox kept in process memory, in commit order
#[derive(Default)]
pub struct InMemoryOutboxStore {
    records: Mutex<Vec<OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn update<F>(&self, id: &str, apply: F)
    where
        F: FnOnce(&mut OutboxRecord),
    {
        if let Some(record) = self.records.lock().iter_mut().find(|r| r.id == id) {
            apply(record);
        }
    }

    fn remove(&self, id: &str) {
        self.records.lock().retain(|r| r.id != id);
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert_committed(&self, records: &[OutboxRecord]) -> Result<()> {
        self.records.lock().extend(records.iter().cloned());
        Ok(())
    }

    async fn fetch_unsent(&self, limit: u32) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| !r.state.is_terminal())
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn fetch_unsent_for_key(&self, partition_key: &str, limit: u32) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.partition_key == partition_key && !r.state.is_terminal())
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxRecord>> {
        Ok(self.records.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn mark_sent(&self, id: &str, attempts: u32) -> Result<()> {
        self.update(id, |r| {
            r.state = DeliveryState::Sent;
            r.attempts = attempts;
        });
        Ok(())
    }

    async fn mark_acked(&self, id: &str) -> Result<()> {
        self.remove(id);
        Ok(())
    }

    async fn record_failure(
        &self,
        id: &str,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.update(id, |r| {
            r.state = DeliveryState::RetryScheduled;
            r.attempts = attempts;
            r.next_attempt_at = next_attempt_at;
            r.last_error = Some(error.to_string());
        });
        Ok(())
    }

    async fn mark_dead_lettered(&self, id: &str, _attempts: u32, _error: &str) -> Result<()> {
        self.remove(id);
        Ok(())
    }
}
