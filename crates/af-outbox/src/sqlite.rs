//! SQLite outbox store
//!
//! Outbox rows live in the same database as the domain tables, so a
//! `SqliteUnitOfWork` can write both inside one database transaction.
//!
//! `SqliteUnitOfWork` is the seam for services whose entities live in SQLite.
//! The in-memory `AccountService` stages its writes through the generic
//! `TransactionManager` instead, which uses `SqliteOutboxStore` only as the
//! durable outbox; there the entity write and the outbox row do not share a
//! database transaction.

use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info};

use af_common::{AccountFlowError, AccountLifecycleEvent, DeliveryState, Result};
use crate::publisher::OutboxPublisher;
use crate::record::OutboxRecord;
use crate::store::OutboxStore;
use crate::unit_of_work::CommitOutcome;

fn storage(e: sqlx::Error) -> AccountFlowError {
    AccountFlowError::Storage(e.to_string())
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AccountFlowError::Storage(format!("invalid timestamp {}", ms)))
}

async fn insert_record(conn: &mut SqliteConnection, record: &OutboxRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox_records
            (id, topic, partition_key, payload, status, attempts, next_attempt_at, last_error, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.topic)
    .bind(&record.partition_key)
    .bind(record.event.encode()?)
    .bind(record.state.as_str())
    .bind(record.attempts as i64)
    .bind(record.next_attempt_at.timestamp_millis())
    .bind(&record.last_error)
    .bind(record.created_at.timestamp_millis())
    .execute(conn)
    .await
    .map_err(storage)?;
    Ok(())
}

pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                topic TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at BIGINT NOT NULL,
                last_error TEXT,
                created_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox_records(status)")
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_outbox_partition_key ON outbox_records(partition_key, seq)")
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        info!("Outbox schema ready (SQLite)");
        Ok(())
    }

    /// Open a database transaction whose outbox rows are flushed to
    /// `publisher` after it commits
    pub async fn begin(&self, publisher: Arc<OutboxPublisher>) -> Result<SqliteUnitOfWork> {
        let tx = self.pool.begin().await.map_err(storage)?;
        Ok(SqliteUnitOfWork {
            id: uuid::Uuid::new_v4().to_string(),
            tx,
            publisher,
            staged: Vec::new(),
        })
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<OutboxRecord> {
        let payload: String = row.get("payload");
        let status: String = row.get("status");
        let event = AccountLifecycleEvent::decode(&payload)?;

        Ok(OutboxRecord {
            id: row.get("id"),
            topic: row.get("topic"),
            partition_key: row.get("partition_key"),
            event,
            state: DeliveryState::parse(&status)
                .ok_or_else(|| AccountFlowError::Storage(format!("unknown status {}", status)))?,
            attempts: row.get::<i64, _>("attempts") as u32,
            next_attempt_at: millis_to_datetime(row.get("next_attempt_at"))?,
            last_error: row.get("last_error"),
            created_at: millis_to_datetime(row.get("created_at"))?,
        })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM outbox_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn insert_committed(&self, records: &[OutboxRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for record in records {
            insert_record(&mut tx, record).await?;
        }
        tx.commit().await.map_err(storage)
    }

    async fn fetch_unsent(&self, limit: u32) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM outbox_records WHERE status NOT IN ('ACKED', 'DEAD_LETTERED') ORDER BY seq LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn fetch_unsent_for_key(&self, partition_key: &str, limit: u32) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM outbox_records
            WHERE partition_key = ? AND status NOT IN ('ACKED', 'DEAD_LETTERED')
            ORDER BY seq LIMIT ?
            "#,
        )
        .bind(partition_key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxRecord>> {
        let row = sqlx::query("SELECT * FROM outbox_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn mark_sent(&self, id: &str, attempts: u32) -> Result<()> {
        sqlx::query("UPDATE outbox_records SET status = 'SENT', attempts = ? WHERE id = ?")
            .bind(attempts as i64)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn mark_acked(&self, id: &str) -> Result<()> {
        self.delete(id).await
    }

    async fn record_failure(
        &self,
        id: &str,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_records
            SET status = 'RETRY_SCHEDULED', attempts = ?, next_attempt_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(attempts as i64)
        .bind(next_attempt_at.timestamp_millis())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn mark_dead_lettered(&self, id: &str, attempts: u32, error: &str) -> Result<()> {
        debug!(event_id = %id, attempts = attempts, error = %error, "Removing dead-lettered outbox row");
        self.delete(id).await
    }
}

/// A database transaction with an attached outbox
pub struct SqliteUnitOfWork {
    id: String,
    tx: Transaction<'static, Sqlite>,
    publisher: Arc<OutboxPublisher>,
    staged: Vec<OutboxRecord>,
}

impl SqliteUnitOfWork {
    /// Connection for domain writes that must commit with the outbox rows
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn record_for_publication(&mut self, event: AccountLifecycleEvent) -> Result<()> {
        let record = OutboxRecord::staged(event);
        insert_record(&mut self.tx, &record).await?;
        self.staged.push(record);
        Ok(())
    }

    pub async fn commit(self) -> Result<CommitOutcome> {
        let Self { id, tx, publisher, staged } = self;
        tx.commit().await.map_err(storage)?;

        let staged_events = staged.len();
        let queued_events = publisher.flush_after_commit(staged);
        debug!(transaction_id = %id, staged_events = staged_events, "SQLite unit of work committed");
        Ok(CommitOutcome {
            transaction_id: id,
            staged_events,
            queued_events,
        })
    }

    /// Roll back; dropping the unit has the same effect
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use sqlx::sqlite::SqlitePoolOptions;
    use af_broker::{BrokerPublisher, InMemoryBroker};
    use af_common::{
        AccountEventType, AccountSnapshot, DeadLetterRouter, InMemoryDeadLetterLog, WarningService,
        TOPIC_ACCOUNT_CREATED,
    };
    use crate::publisher::OutboxPublisherConfig;

    async fn setup() -> (Arc<SqliteOutboxStore>, Arc<OutboxPublisher>, Arc<InMemoryBroker>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Arc::new(SqliteOutboxStore::new(pool));
        store.init_schema().await.unwrap();

        sqlx::query("CREATE TABLE accounts (id INTEGER PRIMARY KEY, username TEXT NOT NULL)")
            .execute(store.pool())
            .await
            .unwrap();

        let broker = Arc::new(InMemoryBroker::new(2, 100));
        let publisher = OutboxPublisher::new(
            store.clone(),
            broker.clone() as Arc<dyn BrokerPublisher>,
            DeadLetterRouter::new(
                Arc::new(InMemoryDeadLetterLog::new()),
                Arc::new(WarningService::default()),
                "outbox",
            ),
            OutboxPublisherConfig::default(),
        );
        (store, publisher, broker)
    }

    fn created(account_id: i64) -> AccountLifecycleEvent {
        AccountLifecycleEvent::new(
            account_id,
            AccountEventType::Created,
            Utc::now(),
            AccountSnapshot::new("bob", "USER", vec!["ops".to_string()]),
        )
    }

    async fn account_count(store: &SqliteOutboxStore) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM accounts")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .get("n")
    }

    #[tokio::test]
    async fn test_row_and_event_commit_together() {
        let (store, publisher, broker) = setup().await;

        let mut uow = store.begin(publisher.clone()).await.unwrap();
        sqlx::query("INSERT INTO accounts (id, username) VALUES (42, 'bob')")
            .execute(uow.connection())
            .await
            .unwrap();
        uow.record_for_publication(created(42)).await.unwrap();
        uow.commit().await.unwrap();

        assert!(publisher.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(account_count(&store).await, 1);
        assert_eq!(broker.records(TOPIC_ACCOUNT_CREATED).len(), 1);
        assert!(store.fetch_unsent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_discards_row_and_event() {
        let (store, publisher, broker) = setup().await;

        let mut uow = store.begin(publisher.clone()).await.unwrap();
        sqlx::query("INSERT INTO accounts (id, username) VALUES (7, 'bob')")
            .execute(uow.connection())
            .await
            .unwrap();
        uow.record_for_publication(created(7)).await.unwrap();
        uow.rollback().await.unwrap();

        assert_eq!(account_count(&store).await, 0);
        assert!(store.fetch_unsent(10).await.unwrap().is_empty());
        assert!(broker.records(TOPIC_ACCOUNT_CREATED).is_empty());
    }

    #[tokio::test]
    async fn test_unsent_rows_survive_and_recover() {
        let (store, publisher, broker) = setup().await;

        let record = OutboxRecord::staged(created(3));
        store.insert_committed(&[record.clone()]).await.unwrap();
        store
            .record_failure(&record.id, 2, Utc::now(), "timeout")
            .await
            .unwrap();

        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, DeliveryState::RetryScheduled);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.event.account_id(), 3);

        assert_eq!(publisher.recover_pending().await.unwrap(), 1);
        assert!(publisher.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(broker.records(TOPIC_ACCOUNT_CREATED).len(), 1);
        assert!(store.get(&record.id).await.unwrap().is_none());
        assert_eq!(publisher.delivery_report(&record.id).unwrap().attempts, 3);
    }
}
