//! WarningService - In-memory store of operator-visible warnings
//!
//! Dead-lettered events and exhausted retries surface here as `Critical`
//! warnings. Nothing in this module fails the caller; it only records.

use std::collections::VecDeque;
use std::time::Duration;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, warn, info};

use crate::{Warning, WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    /// Oldest warnings are dropped beyond this count
    pub max_warnings: usize,
    /// Acknowledged warnings older than this are removed by `cleanup`
    pub retention: Duration,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self {
            max_warnings: 1000,
            retention: Duration::from_secs(3600),
        }
    }
}

pub struct WarningService {
    config: WarningServiceConfig,
    warnings: RwLock<VecDeque<Warning>>,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self {
            config,
            warnings: RwLock::new(VecDeque::new()),
        }
    }

    /// Record a warning and return its id
    pub fn add_warning(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> String {
        match severity {
            WarningSeverity::Critical | WarningSeverity::Error => {
                error!(category = ?category, severity = ?severity, source = %source, "{}", message);
            }
            _ => {
                warn!(category = ?category, severity = ?severity, source = %source, "{}", message);
            }
        }

        let warning = Warning::new(category, severity, message, source);
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();
        warnings.push_back(warning);
        while warnings.len() > self.config.max_warnings {
            warnings.pop_front();
        }

        id
    }

    pub fn get_all_warnings(&self) -> Vec<Warning> {
        self.warnings.read().iter().cloned().collect()
    }

    /// Unacknowledged warnings
    pub fn get_active_warnings(&self) -> Vec<Warning> {
        self.warnings
            .read()
            .iter()
            .filter(|w| !w.acknowledged)
            .cloned()
            .collect()
    }

    pub fn get_warnings_by_category(&self, category: WarningCategory) -> Vec<Warning> {
        self.warnings
            .read()
            .iter()
            .filter(|w| w.category == category)
            .cloned()
            .collect()
    }

    pub fn critical_count(&self) -> usize {
        self.warnings
            .read()
            .iter()
            .filter(|w| !w.acknowledged && w.severity == WarningSeverity::Critical)
            .count()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        match warnings.iter_mut().find(|w| w.id == id) {
            Some(warning) => {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Remove acknowledged warnings past the retention age
    pub fn cleanup(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - retention;

        let mut warnings = self.warnings.write();
        let before = warnings.len();
        warnings.retain(|w| !(w.acknowledged && w.created_at < cutoff));
        let removed = before - warnings.len();

        if removed > 0 {
            info!(removed = removed, "Cleaned up acknowledged warnings");
        }
        removed
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new(WarningServiceConfig::default())
    }
}
