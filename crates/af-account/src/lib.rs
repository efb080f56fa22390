//! AccountFlow Account Service
//!
//! Owns the account entity. Every mutation runs in one unit of work that
//! stages the entity write and the matching lifecycle event together, so an
//! event exists only for mutations that committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use af_common::{
    AccountEventType, AccountFlowError, AccountLifecycleEvent, AccountSnapshot, Result,
};
use af_outbox::{TransactionManager, UnitOfWork};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub role: String,
    #[serde(default)]
    pub positions: Vec<String>,
}

impl Account {
    fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot::new(self.username.clone(), self.role.clone(), self.positions.clone())
    }
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub role: String,
    pub positions: Vec<String>,
}

/// Fields left as `None` are unchanged
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub role: Option<String>,
    pub positions: Option<Vec<String>>,
}

/// Account table kept in process memory
#[derive(Default)]
pub struct InMemoryAccountRepository {
    accounts: RwLock<HashMap<i64, Account>>,
    next_id: AtomicI64,
}

impl InMemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i64) -> Option<Account> {
        self.accounts.read().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.accounts.read().len()
    }

    fn username_taken(&self, username: &str) -> bool {
        self.accounts.read().values().any(|a| a.username == username)
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn reserve_id(&self, id: i64) {
        self.next_id.fetch_max(id, Ordering::SeqCst);
    }

    fn upsert(&self, account: Account) {
        self.accounts.write().insert(account.id, account);
    }

    fn remove(&self, id: i64) {
        self.accounts.write().remove(&id);
    }
}

pub struct AccountService {
    repository: Arc<InMemoryAccountRepository>,
    transactions: TransactionManager,
    /// Held from validation through commit; id and username checks only
    /// hold while no other mutation can commit in between
    writes: Mutex<()>,
}

impl AccountService {
    pub fn new(repository: Arc<InMemoryAccountRepository>, transactions: TransactionManager) -> Self {
        Self {
            repository,
            transactions,
            writes: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &Arc<InMemoryAccountRepository> {
        &self.repository
    }

    pub async fn create_account(&self, new: NewAccount) -> Result<Account> {
        let id = self.repository.next_id();
        self.create_account_with_id(id, new).await
    }

    /// Create an account under a caller-chosen id (imports, fixtures)
    pub async fn create_account_with_id(&self, id: i64, new: NewAccount) -> Result<Account> {
        let _writes = self.writes.lock().await;
        let mut uow = self.transactions.begin();

        if let Err(e) = self.validate_new(id, &new) {
            warn!(account_id = id, error = %e, "Account creation rejected");
            uow.rollback();
            return Err(e);
        }
        self.repository.reserve_id(id);

        let account = Account {
            id,
            username: new.username,
            role: new.role,
            positions: new.positions,
        };
        self.stage(&mut uow, account.clone(), AccountEventType::Created)?;
        uow.commit().await?;

        info!(account_id = id, username = %account.username, "Account created");
        Ok(account)
    }

    pub async fn update_account(&self, id: i64, update: AccountUpdate) -> Result<Account> {
        let _writes = self.writes.lock().await;
        let mut uow = self.transactions.begin();

        let mut account = self
            .repository
            .get(id)
            .ok_or_else(|| AccountFlowError::NotFound(format!("account {}", id)))?;

        if let Some(role) = update.role {
            if role.trim().is_empty() {
                uow.rollback();
                return Err(AccountFlowError::Validation("role must not be empty".to_string()));
            }
            account.role = role;
        }
        if let Some(positions) = update.positions {
            account.positions = positions;
        }

        self.stage(&mut uow, account.clone(), AccountEventType::Updated)?;
        uow.commit().await?;

        info!(account_id = id, "Account updated");
        Ok(account)
    }

    pub async fn delete_account(&self, id: i64) -> Result<()> {
        let _writes = self.writes.lock().await;
        let mut uow = self.transactions.begin();

        let account = self
            .repository
            .get(id)
            .ok_or_else(|| AccountFlowError::NotFound(format!("account {}", id)))?;

        self.stage(&mut uow, account, AccountEventType::Deleted)?;
        uow.commit().await?;

        info!(account_id = id, "Account deleted");
        Ok(())
    }

    fn validate_new(&self, id: i64, new: &NewAccount) -> Result<()> {
        if new.username.trim().is_empty() {
            return Err(AccountFlowError::Validation("username must not be empty".to_string()));
        }
        if new.role.trim().is_empty() {
            return Err(AccountFlowError::Validation("role must not be empty".to_string()));
        }
        if self.repository.get(id).is_some() {
            return Err(AccountFlowError::Validation(format!("account {} already exists", id)));
        }
        if self.repository.username_taken(&new.username) {
            return Err(AccountFlowError::Validation(format!(
                "username {} already taken",
                new.username
            )));
        }
        Ok(())
    }

    /// Stage the entity write and its lifecycle event in one unit
    fn stage(&self, uow: &mut UnitOfWork, account: Account, event_type: AccountEventType) -> Result<()> {
        let event = AccountLifecycleEvent::new(account.id, event_type, Utc::now(), account.snapshot());

        let repository = Arc::clone(&self.repository);
        match event_type {
            AccountEventType::Deleted => {
                let id = account.id;
                uow.stage_write(move || repository.remove(id))?;
            }
            AccountEventType::Created | AccountEventType::Updated => {
                uow.stage_write(move || repository.upsert(account))?;
            }
        }

        uow.record_for_publication(event)
    }
}
