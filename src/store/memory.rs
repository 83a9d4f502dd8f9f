//! In-process [`LockStore`] with the same expiry semantics as Redis
//!
//! Expired keys are evicted lazily on access. Useful for tests and for running several contenders inside a single
//! process.

use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::Instant;

use super::{LockStore, Ownership, StoreError};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Arc<str>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`, if it has not expired.
    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        let now = Instant::now();

        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }
}

impl LockStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let stored = StoredValue {
            value: Arc::from(value),
            expires_at: now + ttl,
        };

        // the entry holds the shard lock, so check-and-set is atomic per key
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_live(now) => Ok(false),
            Entry::Occupied(mut entry) => {
                entry.insert(stored);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(stored);
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let now = Instant::now();

        let removed = self.entries.remove_if(key, |_, stored| {
            !stored.is_live(now) || stored.value.as_ref() == value
        });

        // an expired entry is evicted but was not ours to release
        Ok(removed.is_some_and(|(_, stored)| stored.is_live(now)))
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Ownership, StoreError> {
        let now = Instant::now();

        match self.entries.entry(key.to_string()) {
            Entry::Vacant(_) => Ok(Ownership::Missing),
            Entry::Occupied(entry) if !entry.get().is_live(now) => {
                entry.remove();
                Ok(Ownership::Missing)
            }
            Entry::Occupied(entry) if entry.get().value.as_ref() != value => {
                Ok(Ownership::OtherOwner)
            }
            Entry::Occupied(mut entry) => {
                entry.get_mut().expires_at = now + ttl;
                Ok(Ownership::Owned)
            }
        }
    }
}
