use clap::Args;
use thiserror::Error;

use crate::retry::{retry_notify, RetryError, Retryable};

use super::{PolicyArgs, Run, RunContext};

/// Retry an operation that fails a fixed number of times
#[derive(Debug, Args)]
pub struct BackoffCommand {
    /// Number of attempts that fail before one succeeds
    #[arg(long, default_value_t = 10)]
    fail_times: u32,
    #[command(flatten)]
    policy: PolicyArgs,
}

#[derive(Debug, Error)]
#[error("attempt {0} failed")]
struct AttemptFailed(u32);

impl Retryable for AttemptFailed {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Run for BackoffCommand {
    type Response = u32;

    async fn run(self, ctx: &RunContext) -> anyhow::Result<Self::Response> {
        let mut backoff = self.policy.backoff(ctx, 0);
        let call = self.policy.call_context(ctx);

        tracing::info!(config = ?backoff.config(), "starting retry loop");

        let mut attempt = 0u32;
        let mut retries = 0u32;

        let res = retry_notify(
            &mut backoff,
            &call,
            || {
                attempt += 1;
                let current = attempt;
                let fail_times = self.fail_times;
                async move {
                    if current <= fail_times {
                        Err(AttemptFailed(current))
                    } else {
                        Ok(current)
                    }
                }
            },
            |e, delay| {
                retries += 1;
                tracing::info!(retries, delay_ms = delay.as_millis() as u64, "{e}");
            },
        )
        .await;

        match res {
            Ok(attempts) => {
                tracing::info!(attempts, retries, "success!");
                Ok(attempts)
            }
            Err(e @ RetryError::Cancelled { .. }) => {
                tracing::warn!("{e}");
                Err(e.into())
            }
            Err(e) => {
                tracing::error!("unexpected error: {e}");
                Err(e.into())
            }
        }
    }
}
