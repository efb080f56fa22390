use std::sync::Arc;
use async_trait::async_trait;
use tracing::info;

use af_broker::LifecycleHandler;
use af_common::{AccountLifecycleEvent, Result};
use crate::cache::SessionAuthCache;

/// Drops cached sessions when their account is updated or deleted.
/// Invalidation is idempotent, so redelivery needs no dedup here.
pub struct SessionInvalidator {
    cache: Arc<SessionAuthCache>,
}

impl SessionInvalidator {
    pub fn new(cache: Arc<SessionAuthCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl LifecycleHandler for SessionInvalidator {
    async fn on_event(&self, event: &AccountLifecycleEvent) -> Result<()> {
        if !event.event_type().invalidates_sessions() {
            return Ok(());
        }

        let removed = self.cache.invalidate_account(event.account_id());
        info!(
            account_id = event.account_id(),
            event_type = ?event.event_type(),
            removed = removed,
            "Sessions invalidated by lifecycle event"
        );
        Ok(())
    }
}
