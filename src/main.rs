mod backoff;
mod cmd;
mod config;
mod mutex;
mod retry;
mod store;

use clap::{Parser, Subcommand};
use cmd::{backoff::BackoffCommand, lock::LockCommand, Run, RunContext};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Maximum level of emitted logs
    #[arg(long, global = true, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,
    /// Seed for backoff jitter. Drawn from the OS if omitted.
    #[arg(long, global = true)]
    seed: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Backoff(BackoffCommand),
    Lock(LockCommand),
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    let shutdown = CancellationToken::new();

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c, cancelling");
            on_signal.cancel();
        }
    });

    let ctx = RunContext {
        shutdown,
        seed: cli.seed,
    };

    match cli.command {
        Commands::Backoff(cmd) => {
            cmd.run(&ctx).await?;
        }
        Commands::Lock(cmd) => {
            let report = cmd.run(&ctx).await?;
            println!(
                "acquired: {}, released: {}, failed: {}",
                report.acquired, report.released, report.failed
            );
        }
    }

    Ok(())
}
