//! Bounded window of applied event ids
//!
//! Sharded by account id so lookups for different accounts do not contend.
//! Each shard evicts its oldest ids once it is full.

use std::collections::{HashSet, VecDeque};
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct DedupShard {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupShard {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    /// Returns false if the id was already present
    pub fn insert(&mut self, event_id: &str) -> bool {
        if !self.seen.insert(event_id.to_string()) {
            return false;
        }
        self.order.push_back(event_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct DedupWindow {
    shards: Vec<Mutex<DedupShard>>,
}

impl DedupWindow {
    /// `window` ids in total, split evenly over `shards`
    pub fn new(window: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = (window / shards).max(1);
        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(DedupShard::with_capacity(per_shard)))
                .collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, account_id: i64) -> usize {
        account_id.rem_euclid(self.shards.len() as i64) as usize
    }

    /// Lock the shard owning `account_id`. Holding the guard serializes all
    /// dedup decisions for that account.
    pub async fn lock_shard(&self, account_id: i64) -> MutexGuard<'_, DedupShard> {
        self.shards[self.shard_index(account_id)].lock().await
    }

    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remembers_inserted_ids() {
        let window = DedupWindow::new(100, 4);
        {
            let mut shard = window.lock_shard(42).await;
            assert!(!shard.contains("e1"));
            assert!(shard.insert("e1"));
            assert!(!shard.insert("e1"));
        }
        assert!(window.lock_shard(42).await.contains("e1"));
        assert_eq!(window.len().await, 1);
    }

    #[tokio::test]
    async fn test_evicts_oldest_when_full() {
        let window = DedupWindow::new(2, 1);
        let mut shard = window.lock_shard(1).await;
        shard.insert("a");
        shard.insert("b");
        shard.insert("c");
        assert!(!shard.contains("a"));
        assert!(shard.contains("b"));
        assert!(shard.contains("c"));
        assert_eq!(shard.len(), 2);
    }

    #[tokio::test]
    async fn test_negative_account_ids_map_to_a_shard() {
        let window = DedupWindow::new(16, 4);
        window.lock_shard(-3).await.insert("neg");
        assert!(window.lock_shard(-3).await.contains("neg"));
    }
}
