//! ringwatch-daemon: ring failure detector for one member of a daemon group.
//!
//! Every daemon in the cluster file runs one instance; together they watch
//! each other in a heartbeat ring and broadcast failures to all survivors.

use anyhow::{Context, Result};
use clap::Parser;
use ringwatch_core::{FaultEvent, Rank};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ringwatch_daemon::{ClusterFile, ConfigOverrides, Daemon};

#[derive(Parser, Debug)]
#[command(name = "ringwatch-daemon")]
#[command(about = "Heartbeat ring failure detector daemon")]
struct Args {
    /// Path to the cluster file (YAML)
    #[arg(short, long)]
    cluster: PathBuf,

    /// This daemon's rank in the cluster file (1-based)
    #[arg(short, long)]
    rank: Rank,

    /// Heartbeat period in seconds (overrides the cluster file)
    #[arg(long)]
    period: Option<f64>,

    /// Heartbeat timeout in seconds (overrides the cluster file)
    #[arg(long)]
    timeout: Option<f64>,

    /// Run without the ring detector (broadcasts are still relayed)
    #[arg(long)]
    no_detector: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn seconds(value: Option<f64>, flag: &str) -> Result<Option<Duration>> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs).with_context(|| format!("invalid {flag}: {secs}"))
        })
        .transpose()
}

fn log_event(event: FaultEvent) {
    match event {
        FaultEvent::ProcessFailed {
            state,
            failed_proc,
            affected_procs,
            detected_locally,
        } => {
            warn!(
                "Process {} failed ({}), {} affected, detected {}",
                failed_proc,
                state,
                affected_procs.len(),
                if detected_locally { "locally" } else { "remotely" }
            );
        }
        FaultEvent::DetectorDisabled { rank } => {
            info!("Failure detector on rank {} disabled", rank);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,ringwatch_core=debug,ringwatch_daemon=debug"
    } else {
        "info,ringwatch_core=info,ringwatch_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting ringwatch-daemon");
    info!("Cluster file: {:?}", args.cluster);

    let cluster = ClusterFile::load(&args.cluster)?;
    let overrides = ConfigOverrides {
        heartbeat_period: seconds(args.period, "--period")?,
        heartbeat_timeout: seconds(args.timeout, "--timeout")?,
        disable_detector: args.no_detector,
    };
    let config = overrides.apply(&cluster.ringwatch)?;

    let mut daemon = Daemon::bind(&cluster, args.rank, config).await?;
    let _subscription = daemon.subscribe(log_event);

    info!("Daemon running. Press Ctrl+C to stop.");

    daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}
