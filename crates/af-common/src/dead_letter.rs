//! Dead-letter records
//!
//! Terminal store for events that exhausted publication retries or that a
//! consumer could not process. Records keep the raw payload for manual replay.

use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{Result, WarningCategory, WarningService, WarningSeverity};

/// Which side of the pipeline gave up on the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterSource {
    Publication,
    Consumption,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub source: DeadLetterSource,
    /// Absent when the payload could not be parsed
    pub event_id: Option<String>,
    pub topic: String,
    pub raw_payload: String,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        source: DeadLetterSource,
        topic: impl Into<String>,
        raw_payload: impl Into<String>,
        attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            event_id: None,
            topic: topic.into(),
            raw_payload: raw_payload.into(),
            attempts,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<()>;
}

/// Dead-letter log kept in process memory
#[derive(Default)]
pub struct InMemoryDeadLetterLog {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }

    pub fn for_event(&self, event_id: &str) -> Option<DeadLetter> {
        self.letters
            .lock()
            .iter()
            .find(|l| l.event_id.as_deref() == Some(event_id))
            .cloned()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterLog {
    async fn record(&self, letter: DeadLetter) -> Result<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

/// Records a dead letter, logs its payload and raises a critical warning.
///
/// Never returns an error: a failing sink is itself logged and alerted so the
/// caller can move on to the next event.
#[derive(Clone)]
pub struct DeadLetterRouter {
    sink: Arc<dyn DeadLetterSink>,
    warnings: Arc<WarningService>,
    source_name: String,
}

impl DeadLetterRouter {
    pub fn new(
        sink: Arc<dyn DeadLetterSink>,
        warnings: Arc<WarningService>,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            warnings,
            source_name: source_name.into(),
        }
    }

    pub async fn route(&self, letter: DeadLetter) {
        error!(
            source = ?letter.source,
            event_id = ?letter.event_id,
            topic = %letter.topic,
            attempts = letter.attempts,
            reason = %letter.reason,
            payload = %letter.raw_payload,
            "Event dead-lettered"
        );

        let message = format!(
            "Event {} on {} dead-lettered after {} attempt(s): {}",
            letter.event_id.as_deref().unwrap_or("<unparsed>"),
            letter.topic,
            letter.attempts,
            letter.reason
        );

        if let Err(e) = self.sink.record(letter).await {
            self.warnings.add_warning(
                WarningCategory::DeadLetter,
                WarningSeverity::Critical,
                format!("Failed to persist dead letter ({}): {}", e, message),
                self.source_name.clone(),
            );
            return;
        }

        self.warnings.add_warning(
            WarningCategory::DeadLetter,
            WarningSeverity::Critical,
            message,
            self.source_name.clone(),
        );
    }

    pub fn warnings(&self) -> &Arc<WarningService> {
        &self.warnings
    }
}
