//! SubscriptionLoop - explicit topic subscription and dispatch
//!
//! Subscribes a consumer group to a set of topics at startup and runs a
//! fixed pool of workers. Each worker owns a disjoint set of
//! (topic, partition) pairs and dispatches their records one at a time to a
//! `LifecycleHandler`:
//! - offsets are committed only after the handler returns Ok
//! - a handler error or timeout leaves the offset in place so the record is
//!   redelivered after a backoff; only that partition waits
//! - a per-event poison counter dead-letters the record once the retry
//!   ceiling is reached, then the partition moves on
//! - unparseable records are dead-lettered and skipped immediately

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn, error, debug};

use af_common::{
    AccountLifecycleEvent, DeadLetter, DeadLetterRouter, DeadLetterSource, Result, RetryPolicy,
};
use crate::{BrokerConsumer, BrokerRecord, LifecycleHandler};

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Consumer group; offsets are tracked per group
    pub group: String,
    pub topics: Vec<String>,
    pub worker_count: usize,
    pub poll_batch_size: usize,
    pub idle_poll_interval: Duration,
    /// Upper bound on a single `on_event` call
    pub processing_timeout: Duration,
    pub retry: RetryPolicy,
}

impl SubscriptionConfig {
    pub fn new(group: impl Into<String>, topics: &[&str]) -> Self {
        Self {
            group: group.into(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            worker_count: 4,
            poll_batch_size: 64,
            idle_poll_interval: Duration::from_millis(50),
            processing_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of draining one fetched batch from a partition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionPoll {
    /// Records committed during this poll
    pub committed: usize,
    /// Set when a record failed and must be redelivered after this delay
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionStats {
    pub processed: u64,
    pub failures: u64,
    pub dead_lettered: u64,
    pub malformed: u64,
}

enum RecordOutcome {
    Commit,
    RetryAfter(Duration),
}

pub struct SubscriptionLoop {
    consumer: Arc<dyn BrokerConsumer>,
    handler: Arc<dyn LifecycleHandler>,
    dead_letters: DeadLetterRouter,
    config: SubscriptionConfig,

    /// Failed processing attempts per event id
    poison_counts: DashMap<String, u32>,

    processed: AtomicU64,
    failures: AtomicU64,
    dead_lettered: AtomicU64,
    malformed: AtomicU64,

    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionLoop {
    /// Subscribe `handler` to the configured topics. Nothing is consumed until `start`.
    pub fn subscribe(
        consumer: Arc<dyn BrokerConsumer>,
        handler: Arc<dyn LifecycleHandler>,
        dead_letters: DeadLetterRouter,
        config: SubscriptionConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            group = %config.group,
            topics = ?config.topics,
            broker = %consumer.identifier(),
            "Subscribed to lifecycle topics"
        );

        Self {
            consumer,
            handler,
            dead_letters,
            config,
            poison_counts: DashMap::new(),
            processed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn group(&self) -> &str {
        &self.config.group
    }

    /// Spread (topic, partition) pairs round-robin over the worker pool
    pub fn assignments(&self) -> Vec<Vec<(String, u32)>> {
        let worker_count = self.config.worker_count.max(1);
        let mut assignments: Vec<Vec<(String, u32)>> = vec![Vec::new(); worker_count];

        let pairs = self.config.topics.iter().flat_map(|topic| {
            (0..self.consumer.partition_count()).map(move |p| (topic.clone(), p))
        });
        for (i, pair) in pairs.enumerate() {
            assignments[i % worker_count].push(pair);
        }

        assignments.retain(|a| !a.is_empty());
        assignments
    }

    /// Spawn the worker pool
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let assignments = self.assignments();
        info!(
            group = %self.config.group,
            workers = assignments.len(),
            "Starting subscription workers"
        );

        let mut workers = self.workers.lock();
        for (worker_id, assignment) in assignments.into_iter().enumerate() {
            let this = Arc::clone(self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                this.run_worker(worker_id, assignment, shutdown_rx).await;
            }));
        }
    }

    /// Stop all workers and wait for in-flight records to finish
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(group = %self.config.group, "Subscription shutting down");
        let _ = self.shutdown_tx.send(());

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(group = %self.config.group, error = %e, "Subscription worker panicked");
            }
        }
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            processed: self.processed.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            malformed: self.malformed.load(Ordering::SeqCst),
        }
    }

    async fn run_worker(
        &self,
        worker_id: usize,
        assignment: Vec<(String, u32)>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        debug!(group = %self.config.group, worker_id = worker_id, partitions = ?assignment, "Worker started");

        // Partitions waiting out a retry backoff
        let mut blocked_until: HashMap<(String, u32), Instant> = HashMap::new();

        loop {
            let mut committed_any = false;

            for (topic, partition) in &assignment {
                let key = (topic.clone(), *partition);
                if let Some(until) = blocked_until.get(&key) {
                    if Instant::now() < *until {
                        continue;
                    }
                    blocked_until.remove(&key);
                }

                match self.poll_partition(topic, *partition).await {
                    Ok(poll) => {
                        committed_any |= poll.committed > 0;
                        if let Some(delay) = poll.retry_after {
                            blocked_until.insert(key, Instant::now() + delay);
                        }
                    }
                    Err(e) => {
                        warn!(
                            group = %self.config.group,
                            topic = %topic,
                            partition = partition,
                            error = %e,
                            "Broker fetch/commit failed"
                        );
                    }
                }
            }

            if committed_any {
                // Keep draining, but let shutdown in
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        debug!(group = %self.config.group, worker_id = worker_id, "Worker stopped");
    }

    /// Fetch one batch from a partition and dispatch it in offset order.
    ///
    /// Stops at the first record that must be retried; its offset stays
    /// uncommitted so the broker redelivers it.
    pub async fn poll_partition(&self, topic: &str, partition: u32) -> Result<PartitionPoll> {
        let records = self
            .consumer
            .fetch(&self.config.group, topic, partition, self.config.poll_batch_size)
            .await?;

        let mut poll = PartitionPoll::default();
        for record in records {
            match self.process_record(&record).await {
                RecordOutcome::Commit => {
                    self.consumer
                        .commit(&self.config.group, topic, partition, record.offset + 1)
                        .await?;
                    poll.committed += 1;
                }
                RecordOutcome::RetryAfter(delay) => {
                    poll.retry_after = Some(delay);
                    break;
                }
            }
        }

        Ok(poll)
    }

    async fn process_record(&self, record: &BrokerRecord) -> RecordOutcome {
        let event = match AccountLifecycleEvent::decode(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::SeqCst);
                self.dead_lettered.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("af_consumer_dead_lettered_total", "group" => self.config.group.clone())
                    .increment(1);
                self.dead_letters
                    .route(DeadLetter::new(
                        DeadLetterSource::Consumption,
                        record.topic.clone(),
                        record.payload.clone(),
                        1,
                        format!("unparseable at offset {}: {}", record.offset, e),
                    ))
                    .await;
                return RecordOutcome::Commit;
            }
        };

        if event.topic() != record.topic {
            warn!(
                event_id = %event.event_id(),
                topic = %record.topic,
                event_type = ?event.event_type(),
                "Event type does not match the topic it arrived on"
            );
        }

        let outcome = tokio::time::timeout(
            self.config.processing_timeout,
            self.handler.on_event(&event),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.poison_counts.remove(event.event_id());
                self.processed.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("af_consumer_processed_total", "group" => self.config.group.clone())
                    .increment(1);
                RecordOutcome::Commit
            }
            Ok(Err(e)) => self.record_failure(record, &event, e.to_string()).await,
            Err(_) => {
                let reason = format!("processing timed out after {:?}", self.config.processing_timeout);
                self.record_failure(record, &event, reason).await
            }
        }
    }

    async fn record_failure(
        &self,
        record: &BrokerRecord,
        event: &AccountLifecycleEvent,
        reason: String,
    ) -> RecordOutcome {
        self.failures.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("af_consumer_failures_total", "group" => self.config.group.clone())
            .increment(1);

        let attempts = {
            let mut count = self.poison_counts.entry(event.event_id().to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if self.config.retry.is_exhausted(attempts) {
            self.poison_counts.remove(event.event_id());
            self.dead_lettered.fetch_add(1, Ordering::SeqCst);
            metrics::counter!("af_consumer_dead_lettered_total", "group" => self.config.group.clone())
                .increment(1);
            self.dead_letters
                .route(
                    DeadLetter::new(
                        DeadLetterSource::Consumption,
                        record.topic.clone(),
                        record.payload.clone(),
                        attempts,
                        reason,
                    )
                    .with_event_id(event.event_id()),
                )
                .await;
            return RecordOutcome::Commit;
        }

        let delay = self.config.retry.backoff_for(attempts);
        warn!(
            group = %self.config.group,
            event_id = %event.event_id(),
            attempt = attempts,
            max_attempts = self.config.retry.max_attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %reason,
            "Event processing failed, leaving offset for redelivery"
        );
        RecordOutcome::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use async_trait::async_trait;
    use chrono::Utc;
    use af_common::{
        AccountEventType, AccountFlowError, AccountSnapshot, InMemoryDeadLetterLog, WarningService,
        TOPIC_ACCOUNT_CREATED,
    };
    use crate::{BrokerPublisher, InMemoryBroker};

    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
        fail_times: AtomicUsize,
    }

    impl RecordingHandler {
        fn failing(times: usize) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_times: AtomicUsize::new(times),
            }
        }
    }

    #[async_trait]
    impl LifecycleHandler for RecordingHandler {
        async fn on_event(&self, event: &AccountLifecycleEvent) -> Result<()> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(AccountFlowError::Storage("transient".to_string()));
            }
            self.seen.lock().push(event.event_id().to_string());
            Ok(())
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl LifecycleHandler for SlowHandler {
        async fn on_event(&self, _event: &AccountLifecycleEvent) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn event(id: &str, account_id: i64) -> AccountLifecycleEvent {
        AccountLifecycleEvent::from_parts(
            id.to_string(),
            account_id,
            AccountEventType::Created,
            Utc::now(),
            AccountSnapshot::new("user", "USER", vec![]),
        )
    }

    fn config(max_attempts: u32) -> SubscriptionConfig {
        let mut config = SubscriptionConfig::new("test-group", &[TOPIC_ACCOUNT_CREATED]);
        config.worker_count = 1;
        config.processing_timeout = Duration::from_millis(50);
        config.retry = RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        };
        config
    }

    fn setup(
        handler: Arc<dyn LifecycleHandler>,
        max_attempts: u32,
    ) -> (Arc<InMemoryBroker>, SubscriptionLoop, Arc<InMemoryDeadLetterLog>) {
        let broker = Arc::new(InMemoryBroker::new(1, 100));
        let log = Arc::new(InMemoryDeadLetterLog::new());
        let router = DeadLetterRouter::new(log.clone(), Arc::new(WarningService::default()), "test");
        let subscription = SubscriptionLoop::subscribe(broker.clone(), handler, router, config(max_attempts));
        (broker, subscription, log)
    }

    async fn publish(broker: &InMemoryBroker, event: &AccountLifecycleEvent) {
        broker
            .publish(event.topic(), &event.partition_key(), event.encode().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commits_after_successful_dispatch() {
        let handler = Arc::new(RecordingHandler::failing(0));
        let (broker, subscription, _) = setup(handler.clone(), 5);
        publish(&broker, &event("e1", 1)).await;
        publish(&broker, &event("e2", 1)).await;

        let poll = subscription.poll_partition(TOPIC_ACCOUNT_CREATED, 0).await.unwrap();

        assert_eq!(poll.committed, 2);
        assert_eq!(broker.committed_offset("test-group", TOPIC_ACCOUNT_CREATED, 0), 2);
        assert_eq!(*handler.seen.lock(), vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn test_failure_leaves_offset_for_redelivery() {
        let handler = Arc::new(RecordingHandler::failing(1));
        let (broker, subscription, _) = setup(handler.clone(), 5);
        publish(&broker, &event("e1", 1)).await;
        publish(&broker, &event("e2", 1)).await;

        let first = subscription.poll_partition(TOPIC_ACCOUNT_CREATED, 0).await.unwrap();
        assert_eq!(first.committed, 0);
        assert!(first.retry_after.is_some());
        assert_eq!(broker.committed_offset("test-group", TOPIC_ACCOUNT_CREATED, 0), 0);

        let second = subscription.poll_partition(TOPIC_ACCOUNT_CREATED, 0).await.unwrap();
        assert_eq!(second.committed, 2);
        assert_eq!(*handler.seen.lock(), vec!["e1", "e2"]);
        assert_eq!(subscription.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_malformed_record_is_dead_lettered_and_skipped() {
        let handler = Arc::new(RecordingHandler::failing(0));
        let (broker, subscription, log) = setup(handler.clone(), 5);
        broker
            .publish(TOPIC_ACCOUNT_CREATED, "1", "{not json".to_string())
            .await
            .unwrap();
        publish(&broker, &event("e2", 1)).await;

        let poll = subscription.poll_partition(TOPIC_ACCOUNT_CREATED, 0).await.unwrap();

        assert_eq!(poll.committed, 2);
        assert_eq!(*handler.seen.lock(), vec!["e2"]);
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].raw_payload, "{not json");
        assert_eq!(subscription.stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_poison_event_dead_lettered_after_ceiling() {
        let handler = Arc::new(RecordingHandler::failing(usize::MAX));
        let (broker, subscription, log) = setup(handler.clone(), 3);
        publish(&broker, &event("poison", 1)).await;

        for _ in 0..2 {
            let poll = subscription.poll_partition(TOPIC_ACCOUNT_CREATED, 0).await.unwrap();
            assert!(poll.retry_after.is_some());
        }
        let poll = subscription.poll_partition(TOPIC_ACCOUNT_CREATED, 0).await.unwrap();

        assert_eq!(poll.committed, 1);
        assert_eq!(log.for_event("poison").unwrap().attempts, 3);
        assert_eq!(subscription.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let (broker, subscription, _) = setup(Arc::new(SlowHandler), 5);
        publish(&broker, &event("slow", 1)).await;

        let poll = subscription.poll_partition(TOPIC_ACCOUNT_CREATED, 0).await.unwrap();

        assert_eq!(poll.committed, 0);
        assert!(poll.retry_after.is_some());
        assert_eq!(subscription.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_assignments_cover_every_partition_once() {
        let broker = Arc::new(InMemoryBroker::new(4, 10));
        let router = DeadLetterRouter::new(
            Arc::new(InMemoryDeadLetterLog::new()),
            Arc::new(WarningService::default()),
            "test",
        );
        let mut config = SubscriptionConfig::new("g", &["a", "b"]);
        config.worker_count = 3;
        let subscription = SubscriptionLoop::subscribe(
            broker,
            Arc::new(RecordingHandler::failing(0)),
            router,
            config,
        );

        let assignments = subscription.assignments();
        assert_eq!(assignments.len(), 3);
        let total: usize = assignments.iter().map(|a| a.len()).sum();
        assert_eq!(total, 8);
    }

    #[tokio::test]
    async fn test_workers_drain_in_background() {
        let handler = Arc::new(RecordingHandler::failing(0));
        let (broker, subscription, _) = setup(handler.clone(), 5);
        let subscription = Arc::new(subscription);
        subscription.start();

        for i in 0..5 {
            publish(&broker, &event(&format!("e{}", i), 1)).await;
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while handler.seen.lock().len() < 5 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        subscription.shutdown().await;

        assert_eq!(handler.seen.lock().len(), 5);
        assert_eq!(broker.lag("test-group", TOPIC_ACCOUNT_CREATED), 0);
    }
}
