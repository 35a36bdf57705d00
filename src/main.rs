use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{Decision, TokenBucketLimiter};

/// Check and manage distributed token buckets.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file, overridden by TOLLGATE__* variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print decisions as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Take tokens from a bucket once
    Check {
        /// Rate limit key
        #[arg(short, long)]
        key: String,
        /// Tokens to take; 0 only reads the balance
        #[arg(short = 'n', long, default_value_t = 1)]
        tokens: i64,
    },
    /// Take tokens repeatedly and report how many calls were granted
    Burst {
        /// Rate limit key
        #[arg(short, long)]
        key: String,
        /// Number of calls
        #[arg(short, long, default_value_t = 10)]
        count: u32,
        /// Tokens per call
        #[arg(short = 'n', long, default_value_t = 1)]
        tokens: i64,
        /// Pause between calls in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Delete a bucket, returning it to full capacity
    Reset {
        /// Rate limit key
        #[arg(short, long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = TollgateConfig::load(cli.config.as_deref())?;
    let limiter = config.build_limiter().await?;

    let result = run(&cli, &limiter).await;
    if let Err(ref e) = result {
        error!(error = %e, "Command failed");
    }

    limiter.close().await?;
    result
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: &Cli, limiter: &TokenBucketLimiter) -> anyhow::Result<()> {
    match &cli.command {
        Command::Check { key, tokens } => {
            let decision = limiter.allow_n(key, *tokens).await?;
            print_decision(cli.json, key, &decision)?;
        }
        Command::Burst {
            key,
            count,
            tokens,
            interval_ms,
        } => {
            tokio::select! {
                result = burst(cli.json, limiter, key, *count, *tokens, *interval_ms) => result?,
                _ = shutdown_signal() => warn!("Burst interrupted"),
            }
        }
        Command::Reset { key } => {
            let existed = limiter.reset(key).await?;
            info!(key = %key, existed = existed, "Bucket reset");
        }
    }
    Ok(())
}

async fn burst(
    json: bool,
    limiter: &TokenBucketLimiter,
    key: &str,
    count: u32,
    tokens: i64,
    interval_ms: u64,
) -> anyhow::Result<()> {
    let mut granted = 0u32;

    for i in 0..count {
        if i > 0 && interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }

        let decision = limiter.allow_n(key, tokens).await?;
        if decision.allowed {
            granted += 1;
        }
        print_decision(json, key, &decision)?;
    }

    info!(
        key = %key,
        calls = count,
        granted = granted,
        denied = count - granted,
        "Burst finished"
    );
    Ok(())
}

fn print_decision(json: bool, key: &str, decision: &Decision) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(decision)?);
    } else {
        let verdict = if decision.allowed { "allowed" } else { "denied" };
        println!("{} {} remaining={}", key, verdict, decision.remaining);
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
