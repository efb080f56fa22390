//! AccountFlow Outbox
//!
//! Transactional outbox for account lifecycle events:
//! - UnitOfWork / TransactionManager: stage domain writes and events together
//! - OutboxStore: durable committed-but-unacknowledged records
//! - OutboxPublisher: ordered, bounded, retried delivery after commit

pub mod publisher;
pub mod record;
pub mod store;
pub mod unit_of_work;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use publisher::{DeliveryReport, OutboxPublisher, OutboxPublisherConfig};
pub use record::OutboxRecord;
pub use store::{InMemoryOutboxStore, OutboxStore};
pub use unit_of_work::{CommitOutcome, TransactionManager, UnitOfWork};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteOutboxStore, SqliteUnitOfWork};
