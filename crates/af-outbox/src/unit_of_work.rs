//! Unit of work with an attached outbox
//!
//! Domain writes and lifecycle events are staged together. On commit the
//! outbox records are persisted first, then the writes are applied, and only
//! then are the events handed to the publisher. A rollback (or dropping the
//! unit unfinished) discards both.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use af_common::{AccountFlowError, AccountLifecycleEvent, Result};
use crate::publisher::OutboxPublisher;
use crate::record::OutboxRecord;
use crate::store::OutboxStore;

type StagedWrite = Box<dyn FnOnce() + Send>;

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub transaction_id: String,
    /// Events persisted to the outbox by this commit
    pub staged_events: usize,
    /// Events handed straight to a delivery worker; the rest wait for recovery
    pub queued_events: usize,
}

/// Opens units of work bound to one outbox store and publisher
#[derive(Clone)]
pub struct TransactionManager {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<OutboxPublisher>,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<OutboxPublisher>) -> Self {
        Self { store, publisher }
    }

    pub fn begin(&self) -> UnitOfWork {
        let unit = UnitOfWork {
            id: Uuid::new_v4().to_string(),
            store: Arc::clone(&self.store),
            publisher: Arc::clone(&self.publisher),
            staged_events: Vec::new(),
            staged_writes: Vec::new(),
            finished: false,
        };
        debug!(transaction_id = %unit.id, "Unit of work opened");
        unit
    }

    pub fn publisher(&self) -> &Arc<OutboxPublisher> {
        &self.publisher
    }
}

pub struct UnitOfWork {
    id: String,
    store: Arc<dyn OutboxStore>,
    publisher: Arc<OutboxPublisher>,
    staged_events: Vec<OutboxRecord>,
    staged_writes: Vec<StagedWrite>,
    finished: bool,
}

impl UnitOfWork {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stage an event for publication once this unit commits.
    /// Events are published in the order they were recorded.
    pub fn record_for_publication(&mut self, event: AccountLifecycleEvent) -> Result<()> {
        if self.finished {
            return Err(AccountFlowError::TransactionClosed);
        }
        debug!(
            transaction_id = %self.id,
            event_id = %event.event_id(),
            event_type = ?event.event_type(),
            account_id = event.account_id(),
            "Event staged for publication"
        );
        self.staged_events.push(OutboxRecord::staged(event));
        Ok(())
    }

    /// Stage a domain write; it runs only if the commit succeeds
    pub fn stage_write<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.finished {
            return Err(AccountFlowError::TransactionClosed);
        }
        self.staged_writes.push(Box::new(write));
        Ok(())
    }

    pub fn staged_count(&self) -> usize {
        self.staged_events.len()
    }

    /// Commit the unit. Publication happens after this returns success and
    /// never turns a successful commit into a failure.
    pub async fn commit(mut self) -> Result<CommitOutcome> {
        let records = std::mem::take(&mut self.staged_events);
        let writes = std::mem::take(&mut self.staged_writes);

        if !records.is_empty() {
            if let Err(e) = self.store.insert_committed(&records).await {
                warn!(transaction_id = %self.id, error = %e, "Commit failed, nothing applied");
                self.finished = true;
                return Err(e);
            }
        }

        for write in writes {
            write();
        }
        self.finished = true;

        let staged_events = records.len();
        let queued_events = self.publisher.flush_after_commit(records);

        info!(
            transaction_id = %self.id,
            staged_events = staged_events,
            queued_events = queued_events,
            "Unit of work committed"
        );

        Ok(CommitOutcome {
            transaction_id: self.id.clone(),
            staged_events,
            queued_events,
        })
    }

    pub fn rollback(mut self) {
        self.discard("rolled back");
    }

    fn discard(&mut self, reason: &str) {
        if self.finished {
            return;
        }
        debug!(
            transaction_id = %self.id,
            discarded_events = self.staged_events.len(),
            discarded_writes = self.staged_writes.len(),
            "Unit of work {}", reason
        );
        self.staged_events.clear();
        self.staged_writes.clear();
        self.finished = true;
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        self.discard("dropped without commit");
    }
}
