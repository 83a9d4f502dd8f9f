use std::time::Duration;

use clap::Args;
use rand::{rngs::StdRng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{BackoffConfig, ExponentialBackoff},
    config::LockClientConfig,
    retry::CallContext,
};

pub mod backoff;
pub mod lock;

/// Process-wide state shared by every command.
pub struct RunContext {
    /// Cancelled on Ctrl-C
    pub shutdown: CancellationToken,
    /// Seed for backoff jitter. Each contender derives its own stream from it.
    pub seed: Option<u64>,
}

impl RunContext {
    pub fn rng(&self, stream: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_entropy(),
        }
    }
}

pub trait Run {
    type Response;

    async fn run(self, ctx: &RunContext) -> anyhow::Result<Self::Response>;
}

/// Backoff policy flags shared by the subcommands.
#[derive(Debug, Clone, Args)]
pub struct PolicyArgs {
    /// First wait between attempts
    #[arg(long, default_value_t = 7)]
    pub initial_interval_ms: u64,
    /// Jitter as a fraction of each wait, in [0, 1]
    #[arg(long, default_value_t = 0.5)]
    pub randomization_factor: f64,
    /// Growth of the wait after each failure
    #[arg(long, default_value_t = 1.5)]
    pub multiplier: f64,
    /// Ceiling for a single wait
    #[arg(long, default_value_t = 6000)]
    pub max_interval_ms: u64,
    /// Total retry budget, 0 retries forever
    #[arg(long, default_value_t = 15000)]
    pub max_elapsed_ms: u64,
    /// Cancel the whole operation after this long
    #[arg(long)]
    pub deadline_ms: Option<u64>,
}

impl PolicyArgs {
    pub fn apply(&self, config: &mut LockClientConfig) {
        config.initial_interval = Duration::from_millis(self.initial_interval_ms);
        config.randomization_factor = self.randomization_factor;
        config.multiplier = self.multiplier;
        config.max_interval = Duration::from_millis(self.max_interval_ms);
        config.max_elapsed_time = match self.max_elapsed_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
    }

    pub fn backoff(&self, ctx: &RunContext, stream: u64) -> ExponentialBackoff {
        let mut config = LockClientConfig::default();
        self.apply(&mut config);

        ExponentialBackoff::new(BackoffConfig::from(&config), ctx.rng(stream))
    }

    pub fn call_context(&self, ctx: &RunContext) -> CallContext {
        let call = CallContext::new(ctx.shutdown.child_token());

        match self.deadline_ms {
            Some(ms) => call.with_timeout(Duration::from_millis(ms)),
            None => call,
        }
    }
}
