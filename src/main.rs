//! # Nudge — flow-aware notification delivery
//!
//! Runs the full pipeline: queue scans, flow pattern recompute, and push
//! delivery to registered endpoints.
//!
//! Usage:
//!   nudge                          # Run with ~/.nudge defaults
//!   nudge --data-dir /tmp/nudge    # Custom data directory
//!   nudge --scan-interval 10       # Faster queue scans

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use nudge_core::{NudgeConfig, PreferencesStore};
use nudge_core::prefs::PrefsDb;
use nudge_flow::{FlowDb, FlowScorer, spawn_recompute};
use nudge_push::{DeliveryExecutor, SubscriptionDb, WebhookTransport};
use nudge_queue::{NotificationQueue, QueueDb};

#[derive(Parser)]
#[command(name = "nudge", version, about = "🔔 Nudge — flow-aware notification delivery")]
struct Cli {
    /// Data directory for the SQLite databases
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Config file path (default: <data-dir>/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds between queue scans (overrides config)
    #[arg(long)]
    scan_interval: Option<u64>,

    /// Max notifications pulled per scan (overrides config)
    #[arg(long)]
    scan_limit: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "nudge=debug,nudge_core=debug,nudge_flow=debug,nudge_queue=debug,nudge_push=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(NudgeConfig::home_dir);
    std::fs::create_dir_all(&data_dir)?;

    let mut config = match &cli.config {
        Some(path) => NudgeConfig::load_from(path)?,
        None => {
            let path = data_dir.join("config.toml");
            if path.exists() { NudgeConfig::load_from(&path)? } else { NudgeConfig::default() }
        }
    };
    if let Some(secs) = cli.scan_interval {
        config.queue.scan_interval_secs = secs;
    }
    if let Some(limit) = cli.scan_limit {
        config.queue.scan_limit = limit;
    }

    // Open the stores
    let prefs: Arc<dyn PreferencesStore> = Arc::new(PrefsDb::open(&data_dir.join("prefs.db"))?);
    let flow_db = Arc::new(FlowDb::open(&data_dir.join("flow.db"))?);
    let queue_db = Arc::new(QueueDb::open(&data_dir.join("queue.db"))?);
    let subs = Arc::new(SubscriptionDb::open(&data_dir.join("subscriptions.db"))?);

    // Wire the pipeline
    let scorer = Arc::new(FlowScorer::new(flow_db.clone(), config.flow.clone()));
    let transport = Arc::new(WebhookTransport::new(config.push.timeout_secs));
    let executor = Arc::new(DeliveryExecutor::new(transport, subs, config.push.clone()));
    let queue = NotificationQueue::new(queue_db.clone(), prefs, scorer, executor);

    tracing::info!("🔔 Nudge v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("   💾 Data dir: {}", data_dir.display());
    tracing::info!(
        "   📬 Scanning every {}s, up to {} per cycle",
        config.queue.scan_interval_secs,
        config.queue.scan_limit
    );
    for (status, count) in queue_db.status_counts()? {
        tracing::info!("   📊 {status}: {count}");
    }

    // Background pattern recompute
    tokio::spawn(spawn_recompute(
        flow_db,
        config.flow.recompute_interval_minutes,
        config.flow.min_activity_for_flow,
    ));

    // Main scan loop
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(config.queue.scan_interval_secs));
    loop {
        interval.tick().await;
        if let Err(e) = queue.process_queue(config.queue.scan_limit).await {
            tracing::error!("⚠️ Queue cycle failed: {e}");
        }
    }
}
