use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::Result;
use crate::locks::LockStore;

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires_at: Instant,
}

/// Single-process lock store. The DashMap entry API holds the shard write
/// lock for the whole check-and-set, which makes `try_acquire` atomic.
#[derive(Default)]
pub struct MemoryLockStore {
    /// key → current holder
    locks: DashMap<String, LockEntry>,
    /// key → expiry of each live counter unit
    counters: DashMap<String, Vec<Instant>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let fresh = LockEntry {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };
        let acquired = match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at <= now {
                    held.insert(fresh);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                true
            }
        };
        Ok(acquired)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        Ok(self.locks.remove_if(key, |_, held| held.owner == owner).is_some())
    }

    async fn force_release(&self, key: &str) -> Result<()> {
        self.locks.remove(key);
        Ok(())
    }

    async fn counter_add(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut units = self.counters.entry(key.to_string()).or_default();
        units.retain(|exp| *exp > now);
        units.push(now + ttl);
        Ok(units.len() as u64)
    }

    async fn counter_value(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .map(|units| units.iter().filter(|exp| **exp > now).count() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let store = MemoryLockStore::new();
        assert!(store.try_acquire("k", "a", Duration::from_millis(10)).await.unwrap());
        assert!(!store.try_acquire("k", "b", Duration::from_secs(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store.try_acquire("k", "b", Duration::from_secs(1)).await.unwrap());
        // The original owner lost it and cannot release b's lock.
        assert!(!store.release("k", "a").await.unwrap());
        assert!(store.release("k", "b").await.unwrap());
    }

    #[tokio::test]
    async fn counter_counts_only_live_units() {
        let store = MemoryLockStore::new();
        store.counter_add("c", Duration::from_millis(10)).await.unwrap();
        assert_eq!(store.counter_add("c", Duration::from_secs(5)).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.counter_value("c").await.unwrap(), 1);
        assert_eq!(store.counter_value("missing").await.unwrap(), 0);
    }
}
