//! keeld — the Keel scheduler daemon.
//!
//! # Usage
//!
//! ```text
//! keeld run --config /etc/keel/keel.toml --data-dir /var/lib/keel
//! keeld run --metrics-file /var/lib/node_exporter/keel.prom
//! keeld check-config --config /etc/keel/keel.toml
//! ```
//!
//! Exits with status 1 on fatal errors so a supervisor can restart it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};

use keel_core::{KeelConfig, SystemClock};
use keel_lifecycle::LeaderGroup;
use keel_state::StateStore;
use keeld::{ControlPlane, LoopbackResourceManager};

#[derive(Parser)]
#[command(name = "keeld", about = "Keel cluster scheduler daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a standalone scheduler against the loopback resource manager.
    Run {
        /// Path to keel.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state. Overrides `scheduler.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Replica identity used in leader election.
        #[arg(long, default_value = "keel-0")]
        replica_id: String,

        /// Interval between loopback offer rounds, in milliseconds.
        #[arg(long, default_value = "1000")]
        offer_interval_ms: u64,

        /// Write Prometheus metrics to this file (textfile collector format).
        #[arg(long)]
        metrics_file: Option<PathBuf>,

        /// Seconds between metrics file rewrites.
        #[arg(long, default_value = "15")]
        metrics_interval_secs: u64,
    },

    /// Parse and validate a config file, then print the effective config.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keeld=debug,keel=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<KeelConfig> {
    match path {
        Some(path) => Ok(KeelConfig::from_file(path)?),
        None => Ok(KeelConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            replica_id,
            offer_interval_ms,
            metrics_file,
            metrics_interval_secs,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = data_dir {
                config.scheduler.data_dir = dir;
            }
            let metrics = metrics_file.map(|path| (path, Duration::from_secs(metrics_interval_secs.max(1))));
            run_standalone(config, &replica_id, Duration::from_millis(offer_interval_ms), metrics).await
        }
        Command::CheckConfig { config } => {
            let config = KeelConfig::from_file(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_standalone(
    config: KeelConfig,
    replica: &str,
    offer_interval: Duration,
    metrics: Option<(PathBuf, Duration)>,
) -> anyhow::Result<()> {
    info!(cluster = %config.scheduler.cluster_name, replica, "keel daemon starting in standalone mode");

    std::fs::create_dir_all(&config.scheduler.data_dir)?;
    let db_path = config.scheduler.data_dir.join("keel.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let group = LeaderGroup::new(config.leadership.session_timeout());
    let manager = Arc::new(LoopbackResourceManager::new(config.hosts.clone(), offer_interval));
    let plane = Arc::new(ControlPlane::build(
        config,
        store,
        SystemClock::shared(),
        replica,
        Arc::new(group.member(replica)),
        manager,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    if let Some((path, interval)) = metrics {
        info!(path = ?path, ?interval, "writing metrics file");
        tokio::spawn(write_metrics(plane.clone(), path, interval, shutdown_rx.clone()));
    }

    if let Err(e) = plane.run(shutdown_rx).await {
        error!(error = %e, "keel daemon terminated");
        return Err(e);
    }
    info!("keel daemon stopped");
    Ok(())
}

/// Rewrite the metrics file every `interval` until shutdown.
///
/// Writes go to a sibling temp file first so readers never see a partial file.
async fn write_metrics(
    plane: Arc<ControlPlane>,
    path: PathBuf,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let tmp = path.with_extension("prom.tmp");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let body = plane.render_metrics();
                let written = match tokio::fs::write(&tmp, body).await {
                    Ok(()) => tokio::fs::rename(&tmp, &path).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    warn!(path = ?path, error = %e, "failed to write metrics file");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
