use chrono::{DateTime, Utc};

use af_common::{AccountLifecycleEvent, DeliveryState};

/// A lifecycle event waiting in the outbox for broker acknowledgment
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    /// Same as the event id
    pub id: String,
    pub event: AccountLifecycleEvent,
    pub topic: String,
    pub partition_key: String,
    pub state: DeliveryState,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn staged(event: AccountLifecycleEvent) -> Self {
        let now = Utc::now();
        Self {
            id: event.event_id().to_string(),
            topic: event.topic().to_string(),
            partition_key: event.partition_key(),
            event,
            state: DeliveryState::Staged,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
        }
    }
}
