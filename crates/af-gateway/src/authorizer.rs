//! Request-path authorization
//!
//! Decisions read the session cache only. A miss means the caller must go
//! back through token issuance; the account owner is never called here.

use std::sync::Arc;
use tracing::debug;

use crate::cache::{SessionAuthCache, SessionAuthEntry};

/// What a route needs from the caller's session
#[derive(Debug, Clone, Default)]
pub struct AccessRequirement {
    /// Any one of these roles; empty means any role
    pub any_role: Vec<String>,
    /// Every one of these positions
    pub positions: Vec<String>,
}

impl AccessRequirement {
    pub fn authenticated() -> Self {
        Self::default()
    }

    pub fn role(role: impl Into<String>) -> Self {
        Self {
            any_role: vec![role.into()],
            positions: Vec::new(),
        }
    }

    pub fn or_role(mut self, role: impl Into<String>) -> Self {
        self.any_role.push(role.into());
        self
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.positions.push(position.into());
        self
    }

    fn missing(&self, entry: &SessionAuthEntry) -> Option<String> {
        if !self.any_role.is_empty() && !self.any_role.iter().any(|r| r == &entry.role) {
            return Some(format!("role {} not permitted", entry.role));
        }
        self.positions
            .iter()
            .find(|p| !entry.positions.contains(p))
            .map(|p| format!("missing position {}", p))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthDecision {
    Allowed(SessionAuthEntry),
    Forbidden { reason: String },
    Unauthenticated,
}

#[derive(Clone)]
pub struct Authorizer {
    cache: Arc<SessionAuthCache>,
}

impl Authorizer {
    pub fn new(cache: Arc<SessionAuthCache>) -> Self {
        Self { cache }
    }

    pub fn authorize(&self, session_id: &str, requirement: &AccessRequirement) -> AuthDecision {
        let Some(entry) = self.cache.get(session_id) else {
            debug!(session_id = %session_id, "No live session, unauthenticated");
            return AuthDecision::Unauthenticated;
        };

        match requirement.missing(&entry) {
            Some(reason) => {
                debug!(session_id = %session_id, account_id = entry.account_id, reason = %reason, "Access forbidden");
                AuthDecision::Forbidden { reason }
            }
            None => AuthDecision::Allowed(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn authorizer() -> (Authorizer, Arc<SessionAuthCache>) {
        let cache = Arc::new(SessionAuthCache::new());
        cache.put(1, "admin", "ADMIN", vec!["lead".to_string()], Duration::from_secs(60));
        cache.put(2, "user", "USER", vec![], Duration::from_secs(60));
        (Authorizer::new(cache.clone()), cache)
    }

    #[test]
    fn test_role_and_position_checks() {
        let (authorizer, _) = authorizer();
        let admin_lead = AccessRequirement::role("ADMIN").with_position("lead");

        assert!(matches!(authorizer.authorize("admin", &admin_lead), AuthDecision::Allowed(_)));
        assert!(matches!(
            authorizer.authorize("user", &admin_lead),
            AuthDecision::Forbidden { .. }
        ));
        assert!(matches!(
            authorizer.authorize("user", &AccessRequirement::role("ADMIN").or_role("USER")),
            AuthDecision::Allowed(_)
        ));
        assert!(matches!(
            authorizer.authorize("user", &AccessRequirement::authenticated().with_position("lead")),
            AuthDecision::Forbidden { .. }
        ));
    }

    #[test]
    fn test_missing_or_invalidated_session_is_unauthenticated() {
        let (authorizer, cache) = authorizer();
        let any = AccessRequirement::authenticated();

        assert_eq!(authorizer.authorize("nope", &any), AuthDecision::Unauthenticated);

        cache.invalidate_account(1);
        assert_eq!(authorizer.authorize("admin", &any), AuthDecision::Unauthenticated);
    }
}
