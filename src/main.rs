//! Crashline Server Binary
//!
//! Opens the ledger database, reconciles any unfinished round and runs the
//! crash round scheduler until Ctrl+C.

use clap::Parser;
use crashline::{ConfigLoader, CrashEngine, OptimizedStorage, RoundScheduler};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "crashline")]
#[command(about = "Provably fair crash game engine", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Database directory (overrides the configuration file)
    #[arg(long)]
    db_path: Option<String>,

    /// Crash point bias in [-0.5, 0.5] (overrides the configuration file)
    #[arg(long, allow_negative_numbers = true)]
    bias: Option<f64>,

    /// Wipe the database before starting
    #[arg(long)]
    clear_db: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(db_path) = args.db_path {
        config.storage.data_directory = db_path;
    }
    if let Some(bias) = args.bias {
        config.fairness.bias = bias;
    }
    config.storage.clear_on_start |= args.clear_db;
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.monitoring.log_filter.clone().into()),
        )
        .init();

    info!("🚀 Starting Crashline");
    info!("   Database: {}", config.storage.data_directory);
    info!(
        "   Betting window: {}s, tick: {}ms, ceiling: {}",
        config.game.waiting_secs,
        config.game.tick_interval_ms,
        config.crash_ceiling()
    );
    if config.fairness.bias != 0.0 {
        warn!("⚠️  Crash bias {} is active", config.fairness.bias);
    }

    let storage = OptimizedStorage::new_with_config(&config.storage)?;
    info!("✅ Database opened");

    let engine = Arc::new(CrashEngine::new(config, storage));
    let (shutdown_tx, shutdown_rx) = crashline::shutdown_channel();
    let scheduler = tokio::spawn(RoundScheduler::new(engine.clone(), shutdown_rx).run());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C signal, finishing the current round");
    shutdown_tx.send(true)?;

    let rounds = scheduler.await?;
    info!("👋 Shut down after {} rounds", rounds);
    Ok(())
}
