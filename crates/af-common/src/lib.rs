use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod dead_letter;
pub mod warning;

pub use dead_letter::{DeadLetter, DeadLetterRouter, DeadLetterSink, DeadLetterSource, InMemoryDeadLetterLog};
pub use warning::{WarningService, WarningServiceConfig};

// ============================================================================
// Topic Contract
// ============================================================================

pub const TOPIC_ACCOUNT_CREATED: &str = "account-created";
pub const TOPIC_ACCOUNT_DELETED: &str = "account-deleted";
pub const TOPIC_ACCOUNT_UPDATED: &str = "account-updated";

/// Every topic carrying account lifecycle notifications
pub const LIFECYCLE_TOPICS: [&str; 3] = [
    TOPIC_ACCOUNT_CREATED,
    TOPIC_ACCOUNT_DELETED,
    TOPIC_ACCOUNT_UPDATED,
];

// ============================================================================
// Lifecycle Event Envelope
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountEventType {
    Created,
    Deleted,
    Updated,
}

impl AccountEventType {
    /// Topic the event type is published on
    pub fn topic(&self) -> &'static str {
        match self {
            AccountEventType::Created => TOPIC_ACCOUNT_CREATED,
            AccountEventType::Deleted => TOPIC_ACCOUNT_DELETED,
            AccountEventType::Updated => TOPIC_ACCOUNT_UPDATED,
        }
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        match topic {
            TOPIC_ACCOUNT_CREATED => Some(AccountEventType::Created),
            TOPIC_ACCOUNT_DELETED => Some(AccountEventType::Deleted),
            TOPIC_ACCOUNT_UPDATED => Some(AccountEventType::Updated),
            _ => None,
        }
    }

    /// Change this event implies for the running account total
    pub fn account_delta(&self) -> i64 {
        match self {
            AccountEventType::Created => 1,
            AccountEventType::Deleted => -1,
            AccountEventType::Updated => 0,
        }
    }

    /// Whether cached authorization for the account must be dropped
    pub fn invalidates_sessions(&self) -> bool {
        matches!(self, AccountEventType::Deleted | AccountEventType::Updated)
    }
}

/// Minimal account snapshot carried downstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub username: String,
    pub role: String,
    #[serde(default)]
    pub positions: Vec<String>,
}

impl AccountSnapshot {
    pub fn new(username: impl Into<String>, role: impl Into<String>, positions: Vec<String>) -> Self {
        Self {
            username: username.into(),
            role: role.into(),
            positions,
        }
    }
}

/// Immutable fact announcing a committed account mutation.
///
/// Fields are private so an event cannot change after creation. On the wire
/// the envelope is camelCase JSON with an ISO-8601 `occurredAt`; unknown
/// fields are ignored on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLifecycleEvent {
    event_id: String,
    account_id: i64,
    event_type: AccountEventType,
    occurred_at: DateTime<Utc>,
    payload: AccountSnapshot,
}

impl AccountLifecycleEvent {
    /// Create a new event with a fresh globally unique id
    pub fn new(
        account_id: i64,
        event_type: AccountEventType,
        occurred_at: DateTime<Utc>,
        payload: AccountSnapshot,
    ) -> Self {
        Self::from_parts(
            uuid::Uuid::new_v4().to_string(),
            account_id,
            event_type,
            occurred_at,
            payload,
        )
    }

    /// Rebuild an event with a known id (replay, tests)
    pub fn from_parts(
        event_id: String,
        account_id: i64,
        event_type: AccountEventType,
        occurred_at: DateTime<Utc>,
        payload: AccountSnapshot,
    ) -> Self {
        Self {
            event_id,
            account_id,
            event_type,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub fn event_type(&self) -> AccountEventType {
        self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &AccountSnapshot {
        &self.payload
    }

    pub fn topic(&self) -> &'static str {
        self.event_type.topic()
    }

    /// All events for one account share a key so they land on one partition
    pub fn partition_key(&self) -> String {
        self.account_id.to_string()
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let event: Self = serde_json::from_str(raw)
            .map_err(|e| AccountFlowError::Malformed(e.to_string()))?;
        if event.event_id.trim().is_empty() {
            return Err(AccountFlowError::Malformed("empty eventId".to_string()));
        }
        Ok(event)
    }
}

// ============================================================================
// Delivery & Retry Policy
// ============================================================================

/// Delivery state of a single event on the publication path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    Staged,
    Sent,
    RetryScheduled,
    Acked,
    DeadLettered,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Acked | DeliveryState::DeadLettered)
    }

    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Staged, Sent)
                | (Sent, Acked)
                | (Sent, RetryScheduled)
                | (Sent, DeadLettered)
                | (RetryScheduled, Sent)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Staged => "STAGED",
            DeliveryState::Sent => "SENT",
            DeliveryState::RetryScheduled => "RETRY_SCHEDULED",
            DeliveryState::Acked => "ACKED",
            DeliveryState::DeadLettered => "DEAD_LETTERED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STAGED" => Some(DeliveryState::Staged),
            "SENT" => Some(DeliveryState::Sent),
            "RETRY_SCHEDULED" => Some(DeliveryState::RetryScheduled),
            "ACKED" => Some(DeliveryState::Acked),
            "DEAD_LETTERED" => Some(DeliveryState::DeadLettered),
            _ => None,
        }
    }
}

/// Bounded exponential backoff shared by publication and consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts (first try included) before an event is dead-lettered
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failed_attempts` failures
    pub fn backoff_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let delay_ms = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(delay_ms.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

// ============================================================================
// Warning System Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCategory {
    /// Broker publication problems
    Publication,
    /// Lifecycle consumption failures
    Consumption,
    /// Events moved to a dead-letter log
    DeadLetter,
    /// Session cache maintenance
    SessionCache,
    /// Configuration errors
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    /// Requires operator attention
    Critical,
}

/// An operator-visible warning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AccountFlowError {
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transaction already closed")]
    TransactionClosed,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

impl AccountFlowError {
    /// Infrastructure failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AccountFlowError::Broker(_) | AccountFlowError::Timeout(_) | AccountFlowError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AccountFlowError>;
