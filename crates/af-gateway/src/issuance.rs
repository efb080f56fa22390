use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use af_common::{AccountFlowError, Result};
use crate::cache::{SessionAuthCache, SessionAuthEntry};

/// What the token issuance path knows when it mints a session token
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub account_id: i64,
    pub session_id: String,
    pub role: String,
    pub positions: Vec<String>,
    /// Falls back to the configured default when unset
    pub ttl: Option<Duration>,
}

/// Intake from the token issuance path into the session cache
pub struct TokenIssuance {
    cache: Arc<SessionAuthCache>,
    default_ttl: Duration,
}

impl TokenIssuance {
    pub fn new(cache: Arc<SessionAuthCache>, default_ttl: Duration) -> Self {
        Self { cache, default_ttl }
    }

    pub fn record_issuance(&self, token: IssuedToken) -> Result<SessionAuthEntry> {
        if token.session_id.trim().is_empty() {
            return Err(AccountFlowError::Validation("session id must not be empty".to_string()));
        }
        let ttl = token.ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return Err(AccountFlowError::Validation("session ttl must be positive".to_string()));
        }

        let entry = self.cache.put(
            token.account_id,
            &token.session_id,
            &token.role,
            token.positions,
            ttl,
        );
        info!(
            account_id = entry.account_id,
            session_id = %entry.session_id,
            role = %entry.role,
            "Session issued"
        );
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(session_id: &str, ttl: Option<Duration>) -> IssuedToken {
        IssuedToken {
            account_id: 9,
            session_id: session_id.to_string(),
            role: "USER".to_string(),
            positions: vec![],
            ttl,
        }
    }

    #[test]
    fn test_issuance_populates_cache_with_default_ttl() {
        let cache = Arc::new(SessionAuthCache::new());
        let issuance = TokenIssuance::new(cache.clone(), Duration::from_secs(60));

        let entry = issuance.record_issuance(token("jti-1", None)).unwrap();
        let lifetime = entry.expires_at - entry.issued_at;
        assert!(lifetime <= chrono::Duration::seconds(60));
        assert!(lifetime > chrono::Duration::seconds(55));
        assert_eq!(cache.get("jti-1").unwrap().account_id, 9);
    }

    #[test]
    fn test_rejects_blank_session_and_zero_ttl() {
        let issuance = TokenIssuance::new(Arc::new(SessionAuthCache::new()), Duration::from_secs(60));
        assert!(issuance.record_issuance(token(" ", None)).is_err());
        assert!(issuance.record_issuance(token("jti", Some(Duration::ZERO))).is_err());
    }
}
