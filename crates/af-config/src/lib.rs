//! AccountFlow configuration
//!
//! Loaded from TOML, then overridden from `AF_*` environment variables, then
//! validated. Every section has defaults so an empty file is a valid config.
//!
//! ## Environment Overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `AF_BROKER_PARTITIONS` | `broker.partitions` |
//! | `AF_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `AF_RETRY_MAX_BACKOFF_MS` | `retry.max_backoff_ms` |
//! | `AF_CONSUMER_WORKERS` | `consumer.worker_count` |
//! | `AF_CONSUMER_TIMEOUT_MS` | `consumer.processing_timeout_ms` |
//! | `AF_STATS_HTTP_PORT` | `stats.http_port` |
//! | `AF_STATS_DEDUP_WINDOW` | `stats.dedup_window` |
//! | `AF_GATEWAY_INSTANCE_ID` | `gateway.instance_id` |
//! | `AF_GATEWAY_SESSION_TTL_SECS` | `gateway.default_session_ttl_secs` |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use af_common::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub retry: RetryPolicy,
    pub outbox: OutboxConfig,
    pub consumer: ConsumerConfig,
    pub stats: StatsConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub partitions: u32,
    /// Records kept per partition before the oldest are trimmed
    pub retention_per_partition: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            partitions: 8,
            retention_per_partition: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub channel_capacity: usize,
    pub max_concurrent_deliveries: usize,
    pub recovery_interval_ms: u64,
    pub recovery_batch_size: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            max_concurrent_deliveries: 16,
            recovery_interval_ms: 5_000,
            recovery_batch_size: 100,
        }
    }
}

impl OutboxConfig {
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub worker_count: usize,
    pub poll_batch_size: usize,
    pub idle_poll_interval_ms: u64,
    pub processing_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_batch_size: 64,
            idle_poll_interval_ms: 50,
            processing_timeout_ms: 10_000,
        }
    }
}

impl ConsumerConfig {
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Applied event ids remembered for deduplication
    pub dedup_window: usize,
    pub dedup_shards: usize,
    pub http_port: u16,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            dedup_window: 100_000,
            dedup_shards: 16,
            http_port: 8081,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Distinguishes this gateway's consumer group from its peers
    pub instance_id: String,
    pub default_session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            default_session_ttl_secs: 3_600,
            sweep_interval_secs: 30,
        }
    }
}

impl GatewayConfig {
    pub fn default_session_ttl(&self) -> Duration {
        Duration::from_secs(self.default_session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl AppConfig {
    /// Load from a TOML file, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_path(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override(&lookup, "AF_BROKER_PARTITIONS", "broker.partitions")? {
            self.broker.partitions = v;
        }
        if let Some(v) = parse_override(&lookup, "AF_RETRY_MAX_ATTEMPTS", "retry.max_attempts")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parse_override(&lookup, "AF_RETRY_MAX_BACKOFF_MS", "retry.max_backoff_ms")? {
            self.retry.max_backoff_ms = v;
        }
        if let Some(v) = parse_override(&lookup, "AF_CONSUMER_WORKERS", "consumer.worker_count")? {
            self.consumer.worker_count = v;
        }
        if let Some(v) = parse_override(&lookup, "AF_CONSUMER_TIMEOUT_MS", "consumer.processing_timeout_ms")? {
            self.consumer.processing_timeout_ms = v;
        }
        if let Some(v) = parse_override(&lookup, "AF_STATS_HTTP_PORT", "stats.http_port")? {
            self.stats.http_port = v;
        }
        if let Some(v) = parse_override(&lookup, "AF_STATS_DEDUP_WINDOW", "stats.dedup_window")? {
            self.stats.dedup_window = v;
        }
        if let Some(v) = lookup("AF_GATEWAY_INSTANCE_ID") {
            self.gateway.instance_id = v;
        }
        if let Some(v) = parse_override(&lookup, "AF_GATEWAY_SESSION_TTL_SECS", "gateway.default_session_ttl_secs")? {
            self.gateway.default_session_ttl_secs = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.partitions == 0 {
            return Err(invalid("broker.partitions", "must be > 0"));
        }
        if self.broker.retention_per_partition == 0 {
            return Err(invalid("broker.retention_per_partition", "must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be > 0"));
        }
        if self.retry.initial_backoff_ms == 0 {
            return Err(invalid("retry.initial_backoff_ms", "must be > 0"));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(invalid("retry.max_backoff_ms", "must be >= retry.initial_backoff_ms"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be a finite number >= 1.0"));
        }
        if self.outbox.channel_capacity == 0 {
            return Err(invalid("outbox.channel_capacity", "must be > 0"));
        }
        if self.outbox.max_concurrent_deliveries == 0 {
            return Err(invalid("outbox.max_concurrent_deliveries", "must be > 0"));
        }
        if self.consumer.worker_count == 0 {
            return Err(invalid("consumer.worker_count", "must be > 0"));
        }
        if self.consumer.poll_batch_size == 0 {
            return Err(invalid("consumer.poll_batch_size", "must be > 0"));
        }
        if self.consumer.processing_timeout_ms == 0 {
            return Err(invalid("consumer.processing_timeout_ms", "must be > 0"));
        }
        if self.stats.dedup_shards == 0 {
            return Err(invalid("stats.dedup_shards", "must be > 0"));
        }
        if self.stats.dedup_window < self.stats.dedup_shards {
            return Err(invalid("stats.dedup_window", "must be >= stats.dedup_shards"));
        }
        if self.gateway.instance_id.trim().is_empty() {
            return Err(invalid("gateway.instance_id", "must not be empty"));
        }
        if self.gateway.default_session_ttl_secs == 0 {
            return Err(invalid("gateway.default_session_ttl_secs", "must be > 0"));
        }
        if self.gateway.sweep_interval_secs == 0 {
            return Err(invalid("gateway.sweep_interval_secs", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn parse_override<F, T>(lookup: &F, key: &str, field: &'static str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field,
                reason: format!("{}={} is not a valid value", key, raw),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.broker.partitions, 8);
        assert_eq!(config.consumer.processing_timeout(), Duration::from_secs(10));
        assert!(!config.gateway.instance_id.is_empty());
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [retry]
            max_attempts = 3

            [gateway]
            instance_id = "gw-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.gateway.instance_id, "gw-1");
        assert_eq!(config.gateway.default_session_ttl_secs, 3_600);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\npartitions = 2\n\n[stats]\nhttp_port = 9999").unwrap();

        let config = AppConfig::from_path(file.path()).unwrap();
        assert_eq!(config.broker.partitions, 2);
        assert_eq!(config.stats.http_port, 9999);
    }

    #[test]
    fn test_overrides_apply_and_reject_garbage() {
        let vars: HashMap<&str, &str> = [
            ("AF_BROKER_PARTITIONS", "3"),
            ("AF_GATEWAY_INSTANCE_ID", "gw-east"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.broker.partitions, 3);
        assert_eq!(config.gateway.instance_id, "gw-east");

        let err = config
            .apply_overrides(|k| (k == "AF_CONSUMER_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "consumer.worker_count", .. }));
    }

    #[test]
    fn test_validate_rejects_bad_retry_policy() {
        let mut config = AppConfig::default();
        config.retry.max_backoff_ms = 10;
        config.retry.initial_backoff_ms = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "retry.max_backoff_ms", .. })
        ));

        let mut config = AppConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
