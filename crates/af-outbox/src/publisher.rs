//! OutboxPublisher - hands committed events to the broker
//!
//! Delivery runs on background tasks, never on the committing caller:
//! - one FIFO worker per partition key keeps per-account commit order
//! - a semaphore bounds concurrent broker sends across all workers
//! - failures back off exponentially on the worker task and retry
//! - after the retry ceiling the record is dead-lettered and alerted on

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{info, warn, error, debug};

use af_broker::BrokerPublisher;
use af_common::{
    DeadLetter, DeadLetterRouter, DeadLetterSource, DeliveryState, Result, RetryPolicy,
};
use crate::record::OutboxRecord;
use crate::store::OutboxStore;

#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    pub retry: RetryPolicy,
    /// Broker sends in flight at once across all partition keys
    pub max_concurrent_deliveries: usize,
    /// Buffered records per partition key before hand-off falls back to recovery
    pub group_channel_capacity: usize,
    pub recovery_batch_size: u32,
    /// Idle partition-key workers exit after this long
    pub idle_worker_timeout: Duration,
    /// Terminal delivery reports kept for telemetry
    pub report_retention: usize,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent_deliveries: 16,
            group_channel_capacity: 256,
            recovery_batch_size: 100,
            idle_worker_timeout: Duration::from_secs(60),
            report_retention: 10_000,
        }
    }
}

/// Delivery telemetry for one event
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub event_id: String,
    pub state: DeliveryState,
    /// Send attempts made so far, the first one included
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Hand-off side of one partition key's delivery worker
struct GroupQueue {
    tx: mpsc::Sender<OutboxRecord>,
    /// Non-zero while the key's newer records wait in the store behind a
    /// failed hand-off; bumped on every record deferred since
    deferred: u64,
}

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn BrokerPublisher>,
    dead_letters: DeadLetterRouter,
    config: OutboxPublisherConfig,

    semaphore: Arc<Semaphore>,

    /// Per partition-key FIFO queues
    group_queues: DashMap<String, GroupQueue>,

    /// Record ids queued or being delivered
    in_flight: DashSet<String>,

    reports: DashMap<String, DeliveryReport>,
    terminal_order: Mutex<VecDeque<String>>,

    running: AtomicBool,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn BrokerPublisher>,
        dead_letters: DeadLetterRouter,
        config: OutboxPublisherConfig,
    ) -> Arc<Self> {
        info!(
            broker = %broker.identifier(),
            max_attempts = config.retry.max_attempts,
            max_concurrent = config.max_concurrent_deliveries,
            "Outbox publisher created"
        );

        Arc::new(Self {
            store,
            broker,
            dead_letters,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1))),
            config,
            group_queues: DashMap::new(),
            in_flight: DashSet::new(),
            reports: DashMap::new(),
            terminal_order: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
        })
    }

    /// Hand the records of a committed transaction to the delivery workers.
    ///
    /// Called once per transaction by the transaction manager, after commit.
    /// Never blocks and never fails: anything that cannot be queued now stays
    /// in the store for `recover_pending`. Returns how many were queued.
    pub fn flush_after_commit(self: &Arc<Self>, records: Vec<OutboxRecord>) -> usize {
        let mut queued = 0;
        for record in records {
            self.set_report(&record.id, DeliveryState::Staged, record.attempts, None);
            if self.enqueue(record) {
                queued += 1;
            }
        }
        queued
    }

    /// Re-queue records that were committed but never acknowledged, e.g.
    /// after a crash or a full hand-off channel.
    pub async fn recover_pending(self: &Arc<Self>) -> Result<usize> {
        let records = self.store.fetch_unsent(self.config.recovery_batch_size).await?;
        let mut queued = 0;
        for record in records {
            if self.in_flight.contains(&record.id) {
                continue;
            }
            if self.enqueue(record) {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(recovered = queued, "Re-queued unsent outbox records");
        }
        Ok(queued)
    }

    /// Run `recover_pending` on an interval until shutdown
    pub fn spawn_recovery(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = publisher.recover_pending().await {
                            warn!(error = %e, "Outbox recovery sweep failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Outbox recovery task shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub fn delivery_report(&self, event_id: &str) -> Option<DeliveryReport> {
        self.reports.get(event_id).map(|r| r.clone())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait until nothing is queued, deferred or being delivered
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.in_flight.is_empty() || self.group_queues.iter().any(|q| q.deferred > 0) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Stop accepting hand-offs; queued records finish or stay in the store
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(in_flight = self.in_flight.len(), "Outbox publisher shutting down");
        }
    }

    fn enqueue(self: &Arc<Self>, record: OutboxRecord) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            debug!(event_id = %record.id, "Publisher stopped, leaving record for recovery");
            return false;
        }

        // Hand-off happens under the key's map entry so it cannot race the
        // worker's idle exit or the end of a deferred drain
        let key = record.partition_key.clone();
        let mut queue = self
            .group_queues
            .entry(key.clone())
            .or_insert_with(|| self.spawn_group_worker(&key, 0));

        if queue.deferred > 0 {
            // Earlier records for this key are waiting in the store
            queue.deferred += 1;
            debug!(event_id = %record.id, partition_key = %key, "Key deferred, record left in the store");
            return false;
        }
        if !self.in_flight.insert(record.id.clone()) {
            return false;
        }

        let id = record.id.clone();
        match queue.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.in_flight.remove(&id);
                queue.deferred = 1;
                warn!(event_id = %id, partition_key = %key, "Delivery queue full, key deferred to the store");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.in_flight.remove(&id);
                *queue = self.spawn_group_worker(&key, 1);
                warn!(event_id = %id, partition_key = %key, "Delivery worker gone, restarted from the store");
                false
            }
        }
    }

    fn spawn_group_worker(self: &Arc<Self>, key: &str, deferred: u64) -> GroupQueue {
        let (tx, rx) = mpsc::channel(self.config.group_channel_capacity.max(1));
        let publisher = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            publisher.run_group_worker(key, rx).await;
        });
        GroupQueue { tx, deferred }
    }

    fn is_deferred(&self, key: &str) -> bool {
        self.group_queues.get(key).map(|q| q.deferred > 0).unwrap_or(false)
    }

    async fn run_group_worker(&self, key: String, mut rx: mpsc::Receiver<OutboxRecord>) {
        debug!(partition_key = %key, "Delivery worker started");

        loop {
            // Nothing new is queued while deferred, so once the channel is
            // empty the store holds the rest of this key in commit order
            if rx.is_empty() && self.is_deferred(&key) {
                self.drain_deferred(&key).await;
                continue;
            }

            match tokio::time::timeout(self.config.idle_worker_timeout, rx.recv()).await {
                Ok(Some(record)) => self.deliver(record).await,
                Ok(None) => break,
                Err(_) => {
                    let removed = self
                        .group_queues
                        .remove_if(&key, |_, q| q.deferred == 0 && rx.is_empty())
                        .is_some();
                    if removed {
                        break;
                    }
                }
            }
        }

        debug!(partition_key = %key, "Delivery worker exited");
    }

    /// Deliver a deferred key's records from the store, oldest first, then
    /// resume direct hand-off once nothing more was deferred meanwhile
    async fn drain_deferred(&self, key: &str) {
        loop {
            let Some(seen) = self.group_queues.get(key).map(|q| q.deferred) else {
                return;
            };
            if seen == 0 {
                return;
            }

            match self.store.fetch_unsent_for_key(key, self.config.recovery_batch_size).await {
                Ok(records) if !records.is_empty() => {
                    debug!(partition_key = %key, records = records.len(), "Draining deferred records");
                    let mut delivered = 0;
                    for record in records {
                        if self.in_flight.insert(record.id.clone()) {
                            self.deliver(record).await;
                            delivered += 1;
                        }
                    }
                    if delivered == 0 {
                        tokio::time::sleep(self.config.retry.backoff_for(1)).await;
                    }
                }
                Ok(_) => {
                    if let Some(mut queue) = self.group_queues.get_mut(key) {
                        if queue.deferred == seen {
                            queue.deferred = 0;
                            debug!(partition_key = %key, "Deferred key drained");
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(partition_key = %key, error = %e, "Failed to load deferred records");
                    tokio::time::sleep(self.config.retry.backoff_for(1)).await;
                }
            }
        }
    }

    async fn deliver(&self, record: OutboxRecord) {
        let id = record.id.clone();

        match self.store.get(&id).await {
            Ok(None) => {
                debug!(event_id = %id, "Record already settled, skipping");
                self.in_flight.remove(&id);
                return;
            }
            Ok(Some(_)) => {}
            Err(e) => warn!(event_id = %id, error = %e, "Outbox lookup failed, delivering anyway"),
        }

        let wait = record.next_attempt_at - Utc::now();
        if let Ok(wait) = wait.to_std() {
            tokio::time::sleep(wait).await;
        }

        let payload = match record.event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.dead_letter(&record, String::new(), record.attempts, e.to_string()).await;
                self.in_flight.remove(&id);
                return;
            }
        };

        let mut attempts = record.attempts;
        loop {
            attempts += 1;
            self.set_report(&id, DeliveryState::Sent, attempts, None);
            if let Err(e) = self.store.mark_sent(&id, attempts).await {
                warn!(event_id = %id, error = %e, "Failed to record send attempt");
            }
            metrics::counter!("af_outbox_publish_attempts_total").increment(1);

            let result = match self.semaphore.acquire().await {
                Ok(_permit) => {
                    self.broker
                        .publish(&record.topic, &record.partition_key, payload.clone())
                        .await
                }
                Err(_) => {
                    error!(event_id = %id, "Delivery semaphore closed");
                    break;
                }
            };

            match result {
                Ok(receipt) => {
                    if let Err(e) = self.store.mark_acked(&id).await {
                        // Broker has it; a later recovery resend is deduplicated downstream
                        warn!(event_id = %id, error = %e, "Failed to clear acknowledged outbox record");
                    }
                    self.set_report(&id, DeliveryState::Acked, attempts, None);
                    metrics::counter!("af_outbox_published_total").increment(1);
                    debug!(
                        event_id = %id,
                        topic = %receipt.topic,
                        partition = receipt.partition,
                        offset = receipt.offset,
                        attempts = attempts,
                        "Event published"
                    );
                    break;
                }
                Err(e) => {
                    let reason = e.to_string();
                    if self.config.retry.is_exhausted(attempts) {
                        self.dead_letter(&record, payload, attempts, reason).await;
                        break;
                    }

                    let delay = self.config.retry.backoff_for(attempts);
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    if let Err(e) = self.store.record_failure(&id, attempts, next_attempt_at, &reason).await {
                        warn!(event_id = %id, error = %e, "Failed to record publish failure");
                    }
                    self.set_report(&id, DeliveryState::RetryScheduled, attempts, Some(reason.clone()));
                    warn!(
                        event_id = %id,
                        attempt = attempts,
                        max_attempts = self.config.retry.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Publish failed, retry scheduled"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.in_flight.remove(&id);
    }

    async fn dead_letter(&self, record: &OutboxRecord, payload: String, attempts: u32, reason: String) {
        if let Err(e) = self.store.mark_dead_lettered(&record.id, attempts, &reason).await {
            warn!(event_id = %record.id, error = %e, "Failed to move outbox record out of the outbox");
        }
        self.set_report(&record.id, DeliveryState::DeadLettered, attempts, Some(reason.clone()));
        metrics::counter!("af_outbox_dead_lettered_total").increment(1);

        self.dead_letters
            .route(
                DeadLetter::new(DeadLetterSource::Publication, record.topic.clone(), payload, attempts, reason)
                    .with_event_id(record.id.clone()),
            )
            .await;
    }

    fn set_report(&self, event_id: &str, state: DeliveryState, attempts: u32, last_error: Option<String>) {
        self.reports.insert(
            event_id.to_string(),
            DeliveryReport {
                event_id: event_id.to_string(),
                state,
                attempts,
                last_error,
                updated_at: Utc::now(),
            },
        );

        if state.is_terminal() {
            let mut order = self.terminal_order.lock();
            order.push_back(event_id.to_string());
            while order.len() > self.config.report_retention {
                if let Some(oldest) = order.pop_front() {
                    self.reports.remove_if(&oldest, |_, r| r.state.is_terminal());
                }
            }
        }
    }
}
