//! Mutual exclusion across processes through a shared [`LockStore`]
//!
//! A lock is a key holding a random token with a TTL. Whoever's token is stored owns the resource until the TTL runs
//! out or the owner deletes it. Release and extension compare the token first, so a holder whose lease expired can
//! never disturb the next owner.
//!
//! There is no automatic renewal. Holders that need more time must call [`DistributedMutex::extend`] before the lease
//! runs out, and stop using the resource if that fails.

pub mod config;
pub mod error;
pub mod lease;

use std::{future::Future, sync::Arc, time::Duration};

use rand::Rng;
use tokio::time::Instant;

use crate::{
    backoff::ExponentialBackoff,
    retry::{retry_notify, CallContext},
    store::{LockStore, Ownership, StoreError},
};

pub use config::MutexConfig;
pub use error::{AcquireError, LockError};
pub use lease::{Lease, Token};

/// A named lock in a [`LockStore`].
///
/// Every process that wants the same resource must use the same name.
#[derive(Debug, Clone)]
pub struct DistributedMutex<S> {
    name: Arc<str>,
    store: S,
    config: MutexConfig,
}

impl<S: LockStore> DistributedMutex<S> {
    pub fn new(name: impl Into<Arc<str>>, store: S, config: MutexConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MutexConfig {
        &self.config
    }

    /// Bound a store round-trip by the per-attempt timeout.
    async fn round_trip<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, LockError> {
        let timeout = self.config.attempt_timeout;

        Ok(tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| LockError::TimedOut(timeout))??)
    }

    fn valid_until(&self, start: Instant) -> Instant {
        start + self.config.lease.saturating_sub(self.config.drift())
    }

    /// Make a single acquisition attempt.
    pub async fn try_lock(&self) -> Result<Lease, LockError> {
        let token = Token::generate();
        let start = Instant::now();

        let acquired = self
            .round_trip(
                self.store
                    .set_if_absent(&self.name, token.as_str(), self.config.lease),
            )
            .await?;

        if !acquired {
            tracing::debug!(lock = %self.name, "lock is held by another owner");
            return Err(LockError::Contended);
        }

        let valid_until = self.valid_until(start);

        if Instant::now() >= valid_until {
            tracing::warn!(
                lock = %self.name,
                "acquired lock after its lease ran out, releasing it"
            );

            if let Err(e) = self
                .round_trip(self.store.delete_if_equals(&self.name, token.as_str()))
                .await
            {
                tracing::warn!(lock = %self.name, "failed to release stale lock: {e}");
            }

            return Err(LockError::AcquiredTooLate(start.elapsed()));
        }

        Ok(Lease::new(self.name.clone(), token, start, valid_until))
    }

    /// Acquire the lock, retrying contention and store failures under `backoff` until `ctx` is done.
    ///
    /// `notify` is called after each failed attempt that will be retried, with the error and the delay before the
    /// next attempt.
    pub async fn lock<R, N>(
        &self,
        backoff: &mut ExponentialBackoff<R>,
        ctx: &CallContext,
        mut notify: N,
    ) -> Result<Lease, AcquireError>
    where
        R: Rng,
        N: FnMut(&LockError, Duration),
    {
        let res = retry_notify(
            backoff,
            ctx,
            || self.try_lock(),
            |e, delay| {
                tracing::debug!(
                    lock = %self.name,
                    delay_ms = delay.as_millis() as u64,
                    "failed to acquire lock: {e}, backing off"
                );
                notify(e, delay)
            },
        )
        .await;

        match res {
            Ok(lease) => {
                tracing::info!(lock = %self.name, "acquired lock");
                Ok(lease)
            }
            Err(e) => {
                let e = AcquireError::from(e);
                tracing::warn!(lock = %self.name, "{e}");
                Err(e)
            }
        }
    }

    /// Release the lock if `lease` still owns it.
    ///
    /// Returns false if the lease had expired or the lock now belongs to someone else. In that case nothing is
    /// deleted.
    pub async fn unlock(&self, lease: &Lease) -> Result<bool, LockError> {
        let released = self
            .round_trip(
                self.store
                    .delete_if_equals(lease.name(), lease.token().as_str()),
            )
            .await?;

        if released {
            tracing::info!(lock = %lease.name(), "released lock");
        } else {
            tracing::warn!(lock = %lease.name(), "lock was no longer held by this owner");
        }

        Ok(released)
    }

    /// Reset the TTL of a held lock to a full lease.
    ///
    /// Fails with [`LockError::Expired`] if the key is gone, or [`LockError::NotOwner`] if someone else acquired it in
    /// the meantime. Either way the caller no longer holds the resource.
    pub async fn extend(&self, lease: &Lease) -> Result<Lease, LockError> {
        let start = Instant::now();

        let ownership = self
            .round_trip(self.store.expire_if_equals(
                lease.name(),
                lease.token().as_str(),
                self.config.lease,
            ))
            .await?;

        match ownership {
            Ownership::Owned => {
                tracing::debug!(lock = %lease.name(), "extended lock");
                Ok(Lease::new(
                    Arc::from(lease.name()),
                    lease.token().clone(),
                    lease.acquired_at(),
                    self.valid_until(start),
                ))
            }
            Ownership::Missing => {
                tracing::warn!(lock = %lease.name(), "cannot extend lock, lease expired");
                Err(LockError::Expired)
            }
            Ownership::OtherOwner => {
                tracing::warn!(lock = %lease.name(), "cannot extend lock, it has a new owner");
                Err(LockError::NotOwner)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::future::join_all;
    use rand::{rngs::StdRng, SeedableRng};
    use tokio_test::{assert_pending, assert_ready_ok, task};
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    use crate::{
        backoff::BackoffConfig,
        retry::{CancelReason, Retryable},
        store::MemoryStore,
    };

    use super::*;

    const LEASE: Duration = Duration::from_millis(5000);

    fn config() -> MutexConfig {
        MutexConfig {
            lease: LEASE,
            ..Default::default()
        }
    }

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(
            BackoffConfig {
                initial_interval: Duration::from_millis(7),
                randomization_factor: 0.5,
                multiplier: 1.5,
                max_interval: Duration::from_millis(500),
                max_elapsed_time: Some(Duration::from_secs(15)),
            },
            StdRng::seed_from_u64(42),
        )
    }

    /// Never answers.
    struct HangingStore;

    impl LockStore for HangingStore {
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, StoreError> {
            std::future::pending().await
        }

        async fn delete_if_equals(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }

        async fn expire_if_equals(
            &self,
            _: &str,
            _: &str,
            _: Duration,
        ) -> Result<Ownership, StoreError> {
            std::future::pending().await
        }
    }

    /// Answers correctly, but the first `slow_sets` acquisitions take `delay`.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
        slow_sets: AtomicU32,
    }

    impl SlowStore {
        fn new(inner: MemoryStore, delay: Duration, slow_sets: u32) -> Self {
            Self {
                inner,
                delay,
                slow_sets: AtomicU32::new(slow_sets),
            }
        }
    }

    impl LockStore for SlowStore {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
            let slow = self
                .slow_sets
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            if slow {
                tokio::time::sleep(self.delay).await;
            }

            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
            self.inner.delete_if_equals(key, value).await
        }

        async fn expire_if_equals(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<Ownership, StoreError> {
            self.inner.expire_if_equals(key, value, ttl).await
        }
    }

    /// Fails every call.
    struct BrokenStore;

    impl LockStore for BrokenStore {
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::UnexpectedReply(-2))
        }

        async fn delete_if_equals(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::UnexpectedReply(-2))
        }

        async fn expire_if_equals(
            &self,
            _: &str,
            _: &str,
            _: Duration,
        ) -> Result<Ownership, StoreError> {
            Err(StoreError::UnexpectedReply(-2))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_are_exclusive() {
        let store = MemoryStore::new();

        let mutexes: Vec<_> = (0..16)
            .map(|_| DistributedMutex::new("resource-1", store.clone(), config()))
            .collect();

        let results = join_all(mutexes.iter().map(|m| m.try_lock())).await;

        let held: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();

        assert_eq!(held.len(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LockError::Contended)));
        assert_eq!(
            store.get("resource-1").as_deref(),
            Some(held[0].token().as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lease_validity_accounts_for_drift() {
        let mutex = DistributedMutex::new("resource-1", MemoryStore::new(), config());

        let lease = mutex.try_lock().await.unwrap();

        assert_eq!(lease.name(), "resource-1");
        assert_eq!(lease.remaining(), LEASE - Duration::from_millis(52));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_release_keeps_current_owner() {
        let store = MemoryStore::new();
        let a = DistributedMutex::new("resource-1", store.clone(), config());
        let b = DistributedMutex::new("resource-1", store.clone(), config());

        let stale = a.try_lock().await.unwrap();

        tokio::time::advance(LEASE).await;
        assert!(!stale.is_valid());

        let current = b.try_lock().await.unwrap();

        assert!(!a.unlock(&stale).await.unwrap());
        assert_eq!(
            store.get("resource-1").as_deref(),
            Some(current.token().as_str())
        );

        assert!(b.unlock(&current).await.unwrap());
        assert_eq!(store.get("resource-1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unreleased_lock_frees_up_after_lease() {
        let store = MemoryStore::new();
        let a = DistributedMutex::new("resource-1", store.clone(), config());
        let b = DistributedMutex::new("resource-1", store.clone(), config());

        let _abandoned = a.try_lock().await.unwrap();

        tokio::time::advance(LEASE - Duration::from_millis(1)).await;
        assert!(matches!(b.try_lock().await, Err(LockError::Contended)));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(b.try_lock().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_acquires_after_holder_releases() {
        let store = MemoryStore::new();
        let a = DistributedMutex::new("resource-1", store.clone(), config());
        let b = DistributedMutex::new("resource-1", store.clone(), config());

        let held = a.try_lock().await.unwrap();

        let failures = Arc::new(AtomicU32::new(0));
        let failures_1 = failures.clone();

        let waiter = tokio::spawn(async move {
            b.lock(&mut backoff(), &CallContext::default(), |e, _| {
                assert!(matches!(e, LockError::Contended));
                failures_1.fetch_add(1, Ordering::SeqCst);
            })
            .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!waiter.is_finished());
        assert!(failures.load(Ordering::SeqCst) > 0);

        assert!(a.unlock(&held).await.unwrap());

        let lease = waiter.await.unwrap().unwrap();

        assert_eq!(
            store.get("resource-1").as_deref(),
            Some(lease.token().as_str())
        );
        assert_ne!(lease.token(), held.token());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_waiting_is_not_contention() {
        let store = MemoryStore::new();
        let a = DistributedMutex::new("resource-1", store.clone(), config());
        let b = DistributedMutex::new("resource-1", store, config());

        let _held = a.try_lock().await.unwrap();

        let token = CancellationToken::new();
        let ctx = CallContext::new(token.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });

        let start = Instant::now();
        let res = b.lock(&mut backoff(), &ctx, |_, _| {}).await;

        assert!(matches!(
            res,
            Err(AcquireError::Cancelled {
                reason: CancelReason::Caller,
                ..
            })
        ));
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_acquisition() {
        let store = MemoryStore::new();
        let a = DistributedMutex::new("resource-1", store.clone(), config());
        let b = DistributedMutex::new("resource-1", store, config());

        let _held = a.try_lock().await.unwrap();

        let ctx = CallContext::default().with_timeout(Duration::from_secs(2));
        let res = b.lock(&mut backoff(), &ctx, |_, _| {}).await;

        assert!(matches!(
            res,
            Err(AcquireError::Cancelled {
                reason: CancelReason::Deadline,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn gives_up_when_budget_is_spent() {
        let store = MemoryStore::new();
        let a = DistributedMutex::new("resource-1", store.clone(), config());
        let b = DistributedMutex::new("resource-1", store, config());

        let _held = a.try_lock().await.unwrap();

        let mut backoff = ExponentialBackoff::new(
            BackoffConfig {
                max_elapsed_time: Some(Duration::from_secs(1)),
                ..backoff().config().clone()
            },
            StdRng::seed_from_u64(7),
        );

        let res = b.lock(&mut backoff, &CallContext::default(), |_, _| {}).await;

        let Err(AcquireError::GaveUp { attempts, last }) = res else {
            panic!("expected to give up: {res:?}");
        };

        assert!(attempts > 1);
        assert!(matches!(last, LockError::Contended));
        assert!(logs_contain("gave up acquiring the lock"));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_bounds_store_round_trip() {
        let mutex = DistributedMutex::new(
            "resource-1",
            HangingStore,
            MutexConfig {
                attempt_timeout: Duration::from_millis(57),
                ..config()
            },
        );

        let start = Instant::now();

        assert!(matches!(
            mutex.try_lock().await,
            Err(LockError::TimedOut(d)) if d == Duration::from_millis(57)
        ));
        assert_eq!(start.elapsed(), Duration::from_millis(57));

        let ctx = CallContext::default().with_timeout(Duration::from_secs(1));
        let res = mutex.lock(&mut backoff(), &ctx, |_, _| {}).await;

        assert!(matches!(
            res,
            Err(AcquireError::Cancelled {
                reason: CancelReason::Deadline,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn store_failures_are_retried() {
        let mutex = DistributedMutex::new("resource-1", BrokenStore, config());
        let mut failures = 0;

        let mut backoff = ExponentialBackoff::new(
            BackoffConfig {
                max_elapsed_time: Some(Duration::from_secs(1)),
                ..backoff().config().clone()
            },
            StdRng::seed_from_u64(7),
        );

        let res = mutex
            .lock(&mut backoff, &CallContext::default(), |_, _| failures += 1)
            .await;

        let Err(AcquireError::GaveUp { attempts, last }) = res else {
            panic!("expected to give up: {res:?}");
        };

        assert!(matches!(last, LockError::Store(_)));
        assert_eq!(attempts, failures + 1);
    }

    fn slow_config() -> MutexConfig {
        MutexConfig {
            lease: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_acquire_past_lease_is_rolled_back() {
        let inner = MemoryStore::new();
        let mutex = DistributedMutex::new(
            "resource-1",
            SlowStore::new(inner.clone(), Duration::from_secs(2), 1),
            slow_config(),
        );

        assert!(matches!(
            mutex.try_lock().await,
            Err(LockError::AcquiredTooLate(d)) if d == Duration::from_secs(2)
        ));
        assert_eq!(inner.get("resource-1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_acquire_is_retried() {
        let inner = MemoryStore::new();
        let mutex = DistributedMutex::new(
            "resource-1",
            SlowStore::new(inner.clone(), Duration::from_secs(2), 1),
            slow_config(),
        );

        let mut failures = Vec::new();

        let lease = mutex
            .lock(&mut backoff(), &CallContext::default(), |e, _| {
                failures.push(matches!(e, LockError::AcquiredTooLate(_)))
            })
            .await
            .unwrap();

        assert_eq!(failures, vec![true]);
        assert!(lease.is_valid());
        assert_eq!(
            inner.get("resource-1").as_deref(),
            Some(lease.token().as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn contended_lock_stays_pending_until_release() {
        let store = MemoryStore::new();
        let a = DistributedMutex::new("resource-1", store.clone(), config());
        let b = DistributedMutex::new("resource-1", store.clone(), config());

        let held = a.try_lock().await.unwrap();

        let mut backoff = backoff();
        let ctx = CallContext::default();
        let mut waiter = task::spawn(b.lock(&mut backoff, &ctx, |_, _| {}));

        assert_pending!(waiter.poll());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_pending!(waiter.poll());

        assert!(a.unlock(&held).await.unwrap());

        // longer than the widest jittered wait
        tokio::time::advance(Duration::from_secs(1)).await;

        let lease = assert_ready_ok!(waiter.poll());

        assert_eq!(
            store.get("resource-1").as_deref(),
            Some(lease.token().as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn extend_refreshes_lease() {
        let store = MemoryStore::new();
        let mutex = DistributedMutex::new("resource-1", store.clone(), config());

        let lease = mutex.try_lock().await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;

        let extended = mutex.extend(&lease).await.unwrap();

        assert_eq!(extended.token(), lease.token());
        assert_eq!(extended.acquired_at(), lease.acquired_at());
        assert!(extended.valid_until() > lease.valid_until());

        tokio::time::advance(Duration::from_secs(4)).await;

        assert!(!lease.is_valid());
        assert!(extended.is_valid());
        assert_eq!(
            store.get("resource-1").as_deref(),
            Some(lease.token().as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn extend_reports_lost_ownership() {
        let store = MemoryStore::new();
        let a = DistributedMutex::new("resource-1", store.clone(), config());
        let b = DistributedMutex::new("resource-1", store, config());

        let lease = a.try_lock().await.unwrap();

        tokio::time::advance(LEASE).await;
        assert!(matches!(a.extend(&lease).await, Err(LockError::Expired)));

        let _other = b.try_lock().await.unwrap();
        assert!(matches!(a.extend(&lease).await, Err(LockError::NotOwner)));
    }

    #[test]
    fn error_classification() {
        assert!(LockError::Contended.is_retryable());
        assert!(LockError::TimedOut(Duration::from_millis(1)).is_retryable());
        assert!(LockError::AcquiredTooLate(Duration::from_secs(2)).is_retryable());
        assert!(LockError::Store(StoreError::UnexpectedReply(0)).is_retryable());
        assert!(!LockError::NotOwner.is_retryable());
        assert!(!LockError::Expired.is_retryable());
    }
}
