use std::time::Duration;

use clap::Args;
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::time::Instant;

use crate::{
    config::LockClientConfig,
    mutex::{DistributedMutex, Lease, LockError, MutexConfig},
    retry::{CallContext, Retryable},
    store::{LockStore, MemoryStore, RedisStore, StoreConfig},
};

use super::{PolicyArgs, Run, RunContext};

/// Acquire a named lock with retries, hold it, then release it
#[derive(Debug, Args)]
pub struct LockCommand {
    /// Redis endpoint, as a url or host:port
    #[arg(long, default_value = "redis://0.0.0.0:6379")]
    redis_url: String,
    /// Use an in-process store instead of Redis
    #[arg(long, default_value_t = false)]
    memory: bool,
    /// Lock name shared by every contender
    #[arg(long, default_value = "dumb-mutex")]
    name: String,
    /// Lease duration
    #[arg(long, default_value_t = 5000)]
    lease_ms: u64,
    /// Timeout for one store round-trip
    #[arg(long, default_value_t = 57)]
    attempt_timeout_ms: u64,
    /// How long to hold the lock before releasing it
    #[arg(long, default_value_t = 2000)]
    hold_ms: u64,
    /// Number of clients racing for the lock
    #[arg(long, default_value_t = 1)]
    contenders: u64,
    #[command(flatten)]
    policy: PolicyArgs,
}

/// Summary of a lock run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LockReport {
    pub acquired: u64,
    pub released: u64,
    pub failed: u64,
}

impl LockCommand {
    fn client_config(&self) -> LockClientConfig {
        let mut config = LockClientConfig {
            redis_url: self.redis_url.clone(),
            lease: Duration::from_millis(self.lease_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            ..Default::default()
        };
        self.policy.apply(&mut config);
        config
    }

    async fn contend<S: LockStore + Clone>(
        &self,
        store: S,
        config: &LockClientConfig,
        ctx: &RunContext,
    ) -> anyhow::Result<LockReport> {
        let hold = Duration::from_millis(self.hold_ms);
        let call = self.policy.call_context(ctx);

        let mut runs = FuturesUnordered::new();

        for contender in 0..self.contenders.max(1) {
            let mutex = DistributedMutex::new(
                self.name.as_str(),
                store.clone(),
                MutexConfig::from(config),
            );
            let mut backoff = self.policy.backoff(ctx, contender);
            let call = call.clone();

            runs.push(async move {
                let mut retries = 0u32;

                let mut lease = match mutex
                    .lock(&mut backoff, &call, |e, delay| {
                        retries += 1;
                        tracing::info!(
                            contender,
                            retries,
                            delay_ms = delay.as_millis() as u64,
                            "{e}"
                        );
                    })
                    .await
                {
                    Ok(lease) => lease,
                    Err(e) => {
                        tracing::error!(contender, "unexpected error: {e}");
                        return (false, false);
                    }
                };

                tracing::info!(
                    contender,
                    retries,
                    valid_ms = lease.remaining().as_millis() as u64,
                    "got mutex"
                );

                if let Err(e) = hold_lease(&mutex, &mut lease, hold, &call).await {
                    // the key may still carry our token, compare-and-delete is safe either way
                    if !e.is_retryable() {
                        tracing::error!(contender, "lost the lock while holding it: {e}");
                        return (true, false);
                    }
                    tracing::warn!(contender, "failed to extend lock, releasing it early: {e}");
                }

                tracing::info!(contender, "unlocking mutex");

                match mutex.unlock(&lease).await {
                    Ok(released) => (true, released),
                    Err(e) => {
                        tracing::error!(contender, "failed to release lock: {e}");
                        (true, false)
                    }
                }
            });
        }

        let mut report = LockReport::default();

        while let Some((acquired, released)) = runs.next().await {
            if acquired {
                report.acquired += 1;
            } else {
                report.failed += 1;
            }
            if released {
                report.released += 1;
            }
        }

        tracing::info!(
            acquired = report.acquired,
            released = report.released,
            failed = report.failed,
            "lock run finished"
        );

        anyhow::ensure!(
            report.acquired > 0,
            "no contender acquired lock {:?}",
            self.name
        );

        Ok(report)
    }
}

/// Keep `lease` for `hold`, extending it every half lease. Stops early on shutdown.
///
/// On error `lease` is the last one successfully granted.
async fn hold_lease<S: LockStore>(
    mutex: &DistributedMutex<S>,
    lease: &mut Lease,
    hold: Duration,
    call: &CallContext,
) -> Result<(), LockError> {
    let until = Instant::now() + hold;
    let renew_every = mutex.config().lease / 2;

    loop {
        let now = Instant::now();

        if now >= until {
            return Ok(());
        }

        tokio::select! {
            _ = call.token().cancelled() => return Ok(()),
            _ = tokio::time::sleep((until - now).min(renew_every)) => {}
        }

        if Instant::now() < until {
            *lease = mutex.extend(lease).await?;
        }
    }
}

impl Run for LockCommand {
    type Response = LockReport;

    async fn run(self, ctx: &RunContext) -> anyhow::Result<Self::Response> {
        let config = self.client_config();

        if self.memory {
            tracing::info!("using in-process lock store");
            return self.contend(MemoryStore::new(), &config, ctx).await;
        }

        let store = RedisStore::connect(&StoreConfig::from(&config)).await?;

        tracing::info!(endpoint = ?store.endpoint(), lock = %self.name, "contending for lock");

        self.contend(store, &config, ctx).await
    }
}
