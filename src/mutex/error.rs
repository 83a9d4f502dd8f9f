use std::time::Duration;

use thiserror::Error;

use crate::{
    retry::{CancelReason, RetryError, Retryable},
    store::StoreError,
};

/// Outcome of a single lock operation that did not succeed.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the lock
    #[error("the lock is held by another owner")]
    Contended,
    /// The store did not answer within the per-attempt timeout
    #[error("lock store did not respond within {0:?}")]
    TimedOut(Duration),
    /// The store granted the lock only after its lease had run out
    #[error("lock was granted after {0:?}, too late to be of use")]
    AcquiredTooLate(Duration),
    /// The store is unreachable or failed the command
    #[error("lock store unavailable: {0}")]
    Store(#[from] StoreError),
    /// The lock is held under a different token
    #[error("the lock is owned by someone else")]
    NotOwner,
    /// The lease ran out before the operation could complete
    #[error("the lease has expired")]
    Expired,
}

impl Retryable for LockError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::Contended
                | LockError::TimedOut(_)
                | LockError::AcquiredTooLate(_)
                | LockError::Store(_)
        )
    }
}

/// Terminal failure of [`DistributedMutex::lock`](super::DistributedMutex::lock).
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Every attempt failed and the backoff budget is spent
    #[error("gave up acquiring the lock after {attempts} attempts: {last}")]
    GaveUp { attempts: u32, last: LockError },
    /// The caller cancelled or the deadline passed
    #[error("lock acquisition {reason} after {attempts} attempts")]
    Cancelled { attempts: u32, reason: CancelReason },
    /// An attempt failed in a way retrying cannot fix
    #[error(transparent)]
    Lock(LockError),
}

impl From<RetryError<LockError>> for AcquireError {
    fn from(value: RetryError<LockError>) -> Self {
        match value {
            RetryError::Exhausted { attempts, last } => Self::GaveUp { attempts, last },
            RetryError::Cancelled { attempts, reason } => Self::Cancelled { attempts, reason },
            RetryError::Permanent(e) => Self::Lock(e),
        }
    }
}
