//! AccountFlow Gateway
//!
//! Session authorization cache for the request path:
//! - filled by token issuance
//! - emptied by account lifecycle events and by expiry
//! - read by the authorizer, which never calls the account owner

pub mod authorizer;
pub mod cache;
pub mod invalidator;
pub mod issuance;

pub use authorizer::{AccessRequirement, AuthDecision, Authorizer};
pub use cache::{SessionAuthCache, SessionAuthEntry};
pub use invalidator::SessionInvalidator;
pub use issuance::{IssuedToken, TokenIssuance};

/// Consumer group for one gateway instance.
///
/// Each instance subscribes under its own group so that every instance sees
/// every lifecycle event and can invalidate its local cache.
pub fn consumer_group(instance_id: &str) -> String {
    format!("gateway-sessions-{}", instance_id)
}
