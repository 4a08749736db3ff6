//! StripeStore OSD - Object Storage Daemon
//!
//! This binary runs the object storage engine of one storage node.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use stripestore_common::config::LogFormat;
use stripestore_common::{ChecksumAlgorithm, OsdConfig};
use stripestore_osd::{GmaxListener, GmaxSender, NoopGmaxSender, StorageStage, UdpGmaxSender};
use stripestore_storage::{HashLayoutConfig, HashStorageLayout};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stripestore-osd")]
#[command(about = "StripeStore Object Storage Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/stripestore/osd.toml")]
    config: PathBuf,

    /// Storage root directory
    #[arg(long, env = "STRIPESTORE_ROOT")]
    root: Option<PathBuf>,

    /// Number of storage threads
    #[arg(long)]
    threads: Option<usize>,

    /// UDP address for GMAX hints
    #[arg(long)]
    gmax_listen: Option<SocketAddr>,

    /// Enable object checksums with the given algorithm
    #[arg(long)]
    checksums: Option<ChecksumAlgorithm>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = OsdConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    // CLI takes precedence over the config file
    if let Some(root) = args.root {
        config.storage.root = root;
    }
    if let Some(threads) = args.threads {
        config.stage.threads = threads;
    }
    if let Some(listen) = args.gmax_listen {
        config.gmax.listen = listen;
    }
    if let Some(algorithm) = args.checksums {
        config.storage.checksums_enabled = true;
        config.storage.checksum_algorithm = algorithm;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    let json = config.logging.format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting StripeStore OSD");
    info!("Config file: {}", args.config.display());
    info!("Storage root: {}", config.storage.root.display());

    let layout = match HashStorageLayout::open(HashLayoutConfig::from(&config.storage)) {
        Ok(layout) => layout,
        Err(e) => {
            error!("Failed to open storage root: {}", e);
            std::process::exit(1);
        }
    };

    let gmax: Arc<dyn GmaxSender> = if config.gmax.enabled {
        let bind = SocketAddr::new(config.gmax.listen.ip(), 0);
        Arc::new(UdpGmaxSender::bind(bind)?)
    } else {
        Arc::new(NoopGmaxSender)
    };

    let stage = Arc::new(StorageStage::start(
        &config.stage,
        Arc::new(layout),
        gmax,
        config.storage.sync_writes,
    )?);

    let mut listener = if config.gmax.enabled {
        Some(GmaxListener::start(config.gmax.listen, Arc::clone(&stage))?)
    } else {
        info!("GMAX hints disabled");
        None
    };

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    if let Some(listener) = listener.as_mut() {
        listener.stop();
    }
    stage.shutdown();
    for (id, stats) in stage.stats().iter().enumerate() {
        info!(
            "storage thread {}: {} requests, {} errors, {} bytes read, {} bytes written",
            id, stats.requests, stats.errors, stats.bytes_read, stats.bytes_written
        );
    }

    info!("OSD shut down gracefully");
    Ok(())
}
