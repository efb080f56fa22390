//! SessionAuthCache - per-session authorization snapshots
//!
//! Sessions are keyed by session id with a secondary index from account id
//! to its session ids, so all sessions of an account can be dropped at once.
//!
//! Lock order: `by_account` before `sessions`. Paths that touch only one of
//! the maps never hold a guard on the other.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuthEntry {
    pub account_id: i64,
    pub session_id: String,
    pub role: String,
    pub positions: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionAuthEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
pub struct SessionAuthCache {
    sessions: DashMap<String, SessionAuthEntry>,
    by_account: DashMap<i64, HashSet<String>>,
}

impl SessionAuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the entry for `session_id`, expiring after `ttl`
    pub fn put(
        &self,
        account_id: i64,
        session_id: &str,
        role: &str,
        positions: Vec<String>,
        ttl: Duration,
    ) -> SessionAuthEntry {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.put_until(account_id, session_id, role, positions, expires_at)
    }

    /// Create or overwrite the entry for `session_id` with an absolute expiry
    pub fn put_until(
        &self,
        account_id: i64,
        session_id: &str,
        role: &str,
        positions: Vec<String>,
        expires_at: DateTime<Utc>,
    ) -> SessionAuthEntry {
        let entry = SessionAuthEntry {
            account_id,
            session_id: session_id.to_string(),
            role: role.to_string(),
            positions,
            issued_at: Utc::now(),
            expires_at,
        };

        // A reused session id may move between accounts
        let previous_account = self.sessions.get(session_id).map(|e| e.account_id);
        if let Some(previous) = previous_account.filter(|p| *p != account_id) {
            self.unindex(previous, session_id);
        }

        {
            let mut ids = self.by_account.entry(account_id).or_default();
            ids.insert(session_id.to_string());
            self.sessions.insert(session_id.to_string(), entry.clone());
        }

        self.record_size();
        debug!(account_id = account_id, session_id = %session_id, expires_at = %expires_at, "Session cached");
        entry
    }

    /// The live entry for `session_id`. An expired entry is removed and
    /// reported as a miss.
    pub fn get(&self, session_id: &str) -> Option<SessionAuthEntry> {
        let now = Utc::now();
        let entry = self.sessions.get(session_id).map(|e| e.clone())?;
        if entry.is_expired_at(now) {
            self.remove_expired(entry.account_id, session_id, now);
            return None;
        }
        Some(entry)
    }

    /// Drop every session of `account_id`. Returns how many were removed.
    pub fn invalidate_account(&self, account_id: i64) -> usize {
        let removed = match self.by_account.entry(account_id) {
            Entry::Occupied(entry) => {
                let mut removed = 0;
                for session_id in entry.get() {
                    if self
                        .sessions
                        .remove_if(session_id, |_, e| e.account_id == account_id)
                        .is_some()
                    {
                        removed += 1;
                    }
                }
                entry.remove();
                removed
            }
            Entry::Vacant(_) => 0,
        };

        metrics::counter!("af_gateway_invalidations_total").increment(1);
        self.record_size();
        debug!(account_id = account_id, removed = removed, "Account sessions invalidated");
        removed
    }

    pub fn sessions_for_account(&self, account_id: i64) -> Vec<SessionAuthEntry> {
        let ids: Vec<String> = self
            .by_account
            .get(&account_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let now = Utc::now();
        ids.iter()
            .filter_map(|id| self.sessions.get(id).map(|e| e.clone()))
            .filter(|e| !e.is_expired_at(now))
            .collect()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<(i64, String)> = self
            .sessions
            .iter()
            .filter(|e| e.is_expired_at(now))
            .map(|e| (e.account_id, e.session_id.clone()))
            .collect();

        let removed = expired
            .iter()
            .filter(|(account_id, session_id)| self.remove_expired(*account_id, session_id, now))
            .count();

        if removed > 0 {
            self.record_size();
            debug!(removed = removed, remaining = self.len(), "Expired sessions swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Run `sweep_expired` on an interval until shutdown
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep_expired();
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Session sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn remove_expired(&self, account_id: i64, session_id: &str, now: DateTime<Utc>) -> bool {
        let removed = match self.by_account.get_mut(&account_id) {
            Some(mut ids) => {
                let removed = self
                    .sessions
                    .remove_if(session_id, |_, e| e.account_id == account_id && e.is_expired_at(now))
                    .is_some();
                if removed {
                    ids.remove(session_id);
                }
                removed
            }
            None => self
                .sessions
                .remove_if(session_id, |_, e| e.is_expired_at(now))
                .is_some(),
        };
        self.by_account.remove_if(&account_id, |_, ids| ids.is_empty());
        removed
    }

    fn unindex(&self, account_id: i64, session_id: &str) {
        if let Some(mut ids) = self.by_account.get_mut(&account_id) {
            ids.remove(session_id);
        }
        self.by_account.remove_if(&account_id, |_, ids| ids.is_empty());
    }

    fn record_size(&self) {
        metrics::gauge!("af_gateway_sessions").set(self.sessions.len() as f64);
    }
}
