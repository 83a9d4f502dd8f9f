//! Drives a fallible async operation under an [`ExponentialBackoff`] until it succeeds, the backoff gives up, or the
//! caller cancels.

use std::{fmt, future::Future, time::Duration};

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;

/// Classifies an error as worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Why a retry loop was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The cancellation token fired
    Caller,
    /// The deadline elapsed
    Deadline,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Caller => f.write_str("cancelled by caller"),
            CancelReason::Deadline => f.write_str("deadline exceeded"),
        }
    }
}

/// Cancellation scope for a retry loop: an explicit token and an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns the reason if the context is already done.
    pub fn check(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            Some(CancelReason::Caller)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(CancelReason::Deadline)
        } else {
            None
        }
    }

    /// Resolves once the token is cancelled or the deadline passes.
    pub async fn done(&self) -> CancelReason {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => CancelReason::Caller,
            _ = deadline => CancelReason::Deadline,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The backoff ran out of time budget
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    /// The context was cancelled before the operation succeeded
    #[error("{reason} after {attempts} attempts")]
    Cancelled { attempts: u32, reason: CancelReason },
    /// The operation returned an error that is not retryable
    #[error("{0}")]
    Permanent(E),
}

/// Retry `operation` until it succeeds.
///
/// After every retryable failure `notify` is called with the error and the delay before the next attempt. The backoff
/// is reset before the first attempt. A pending attempt is dropped as soon as the context is done.
pub async fn retry_notify<T, E, F, Fut, N, R>(
    backoff: &mut ExponentialBackoff<R>,
    ctx: &CallContext,
    mut operation: F,
    mut notify: N,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
    N: FnMut(&E, Duration),
    R: Rng,
{
    backoff.reset();

    let mut attempts = 0u32;

    loop {
        if let Some(reason) = ctx.check() {
            return Err(RetryError::Cancelled { attempts, reason });
        }

        attempts = attempts.saturating_add(1);

        let err = tokio::select! {
            biased;
            reason = ctx.done() => return Err(RetryError::Cancelled { attempts, reason }),
            res = operation() => match res {
                Ok(value) => return Ok(value),
                Err(e) => e,
            },
        };

        if !err.is_retryable() {
            return Err(RetryError::Permanent(err));
        }

        let Some(delay) = backoff.next_backoff() else {
            return Err(RetryError::Exhausted {
                attempts,
                last: err,
            });
        };

        notify(&err, delay);

        tokio::select! {
            biased;
            reason = ctx.done() => return Err(RetryError::Cancelled { attempts, reason }),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
