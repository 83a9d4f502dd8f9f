//! The key/value contract a distributed lock is built on
//!
//! A store must execute each of these operations atomically per key. No other writes to lock keys are allowed.

pub mod config;
pub mod endpoint;
pub mod memory;
pub mod redis;

use std::{future::Future, sync::Arc, time::Duration};

use thiserror::Error;

pub use config::StoreConfig;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The Redis server could not be reached, or rejected the command.
    #[error(transparent)]
    Redis(#[from] ::redis::RedisError),
    /// A script returned a value outside of its contract.
    #[error("unexpected reply from lock store: {0}")]
    UnexpectedReply(i64),
}

/// Who holds a key at the time of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The key held the expected value and was updated
    Owned,
    /// The key does not exist (never set, deleted, or expired)
    Missing,
    /// The key holds a different value
    OtherOwner,
}

/// Atomic primitives required by [`DistributedMutex`](crate::mutex::DistributedMutex).
pub trait LockStore: Send + Sync {
    /// `SET key value NX PX ttl`. Returns true if the key was set.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Delete `key` only if it holds `value`. Returns true if the key was deleted.
    fn delete_if_equals(
        &self,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Reset the TTL of `key` only if it holds `value`.
    fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Ownership, StoreError>> + Send;
}

impl<S: LockStore> LockStore for Arc<S> {
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        self.as_ref().set_if_absent(key, value, ttl)
    }

    fn delete_if_equals(
        &self,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        self.as_ref().delete_if_equals(key, value)
    }

    fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Ownership, StoreError>> + Send {
        self.as_ref().expire_if_equals(key, value, ttl)
    }
}
