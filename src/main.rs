use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::clock::{Clock, SystemClock};
use ratekeeper::config::ServiceConfig;
use ratekeeper::ratelimit::{AdmissionCheckpoint, LimiterRegistry};
use ratekeeper::store;

#[derive(Parser)]
#[command(name = "ratekeeper", version, about = "Distributed admission control")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the configuration and list its policies
    Validate,
    /// Run admission checks for a key against a named policy
    Check {
        /// Policy name from the configuration
        #[arg(long)]
        policy: String,
        /// Caller key
        #[arg(long)]
        key: String,
        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Pause between sequential checks
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
        /// Fire all checks at once instead of one after another
        #[arg(long)]
        concurrent: bool,
        /// Print one JSON object per decision
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ServiceConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(backend = ?config.store.backend, policies = config.policies.len(), "Configuration loaded");

    match cli.command {
        Command::Validate => {
            for (name, policy) in &config.policies {
                println!("{}: {}", name, policy);
            }
            println!("{} policies OK", config.policies.len());
            Ok(())
        }
        Command::Check {
            policy,
            key,
            count,
            interval_ms,
            concurrent,
            json,
        } => {
            let policy_config = config
                .policy(&policy)
                .cloned()
                .with_context(|| format!("Unknown policy '{}'", policy))?;

            let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
            let store = store::connect(&config.store, clock.clone())
                .await
                .context("Failed to connect to store")?;
            let registry = Arc::new(LimiterRegistry::with_clock(store, clock));
            let checkpoint = AdmissionCheckpoint::new(registry, policy_config);

            let report = |seq: u32, admitted: bool| {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "seq": seq,
                            "policy": policy,
                            "key": key,
                            "admitted": admitted,
                        })
                    );
                } else {
                    println!("#{} {} {}", seq, key, if admitted { "ADMIT" } else { "DENY" });
                }
            };

            let run = async {
                if concurrent {
                    run_concurrent(&checkpoint, &key, count, &report).await
                } else {
                    run_sequential(&checkpoint, &key, count, interval_ms, &report).await
                }
            };
            let admitted = tokio::select! {
                admitted = run => admitted,
                _ = shutdown_signal() => {
                    warn!("Interrupted before all checks ran");
                    0
                }
            };

            info!(policy = %policy, key = %key, admitted = admitted, total = count, "Checks complete");
            Ok(())
        }
    }
}

/// One admission attempt; admitted actions are recorded right away.
async fn admit(checkpoint: &AdmissionCheckpoint, key: &str) -> bool {
    let allowed = checkpoint.allow(key).await;
    if allowed {
        checkpoint.record(key).await;
    }
    allowed
}

async fn run_sequential(
    checkpoint: &AdmissionCheckpoint,
    key: &str,
    count: u32,
    interval_ms: u64,
    report: &impl Fn(u32, bool),
) -> usize {
    let mut admitted = 0;
    for seq in 1..=count {
        let allowed = admit(checkpoint, key).await;
        if allowed {
            admitted += 1;
        }
        report(seq, allowed);

        if interval_ms > 0 && seq < count {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }
    admitted
}

async fn run_concurrent(
    checkpoint: &AdmissionCheckpoint,
    key: &str,
    count: u32,
    report: &impl Fn(u32, bool),
) -> usize {
    let decisions = futures::future::join_all((0..count).map(|_| admit(checkpoint, key))).await;
    for (seq, allowed) in decisions.iter().enumerate() {
        report(seq as u32 + 1, *allowed);
    }
    decisions.into_iter().filter(|allowed| *allowed).count()
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
