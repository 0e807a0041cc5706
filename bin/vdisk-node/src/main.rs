//! VDisk Node - single-node host for one storage unit
//!
//! Opens the unit's files, runs local recovery, starts the skeleton and
//! serves its readiness over HTTP.

mod http;

use anyhow::{Context, Result};
use clap::Parser;
use http::NodeView;
use parking_lot::RwLock;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vdisk_common::{ErasureSpecies, GroupInfo, VDiskConfig, VDiskId};
use vdisk_skeleton::{Addr, LocalLauncher, NodeMsg, Skeleton, SkeletonMsg, SyncMode};

#[derive(Parser, Debug)]
#[command(name = "vdisk-node")]
#[command(about = "VDisk storage unit host")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/vdisk/node.toml")]
    config: String,

    /// Listen address for the status endpoint
    #[arg(short, long)]
    listen: Option<String>,

    /// Directory holding the recovery log and huge blob file
    #[arg(long)]
    data_dir: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    node: NodeConfig,
    #[serde(default)]
    group: GroupConfig,
    #[serde(default)]
    vdisk: VDiskConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    /// fsync every recovery log append
    #[serde(default = "default_fsync")]
    fsync: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            fsync: default_fsync(),
        }
    }
}

/// Position of this unit in its group
#[derive(Debug, Deserialize, Default)]
struct GroupConfig {
    #[serde(default)]
    group_id: u32,
    #[serde(default = "default_generation")]
    generation: u32,
    #[serde(default)]
    erasure: ErasureSpecies,
    #[serde(default)]
    ring: u8,
    #[serde(default)]
    fail_domain: u8,
    #[serde(default)]
    vdisk: u8,
}

impl GroupConfig {
    const fn vdisk_id(&self) -> VDiskId {
        VDiskId::new(self.group_id, self.generation, self.ring, self.fail_domain, self.vdisk)
    }

    const fn group_info(&self) -> GroupInfo {
        GroupInfo::new(self.group_id, self.generation, self.erasure)
    }
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

fn default_listen() -> String {
    "0.0.0.0:9301".to_string()
}

fn default_data_dir() -> String {
    "./vdisk-data".to_string()
}

const fn default_fsync() -> bool {
    true
}

const fn default_generation() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    if !std::path::Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let config: Config = toml::from_str(&config_str).with_context(|| format!("parsing {path}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    // CLI takes precedence over the config file
    let listen = args.listen.unwrap_or(config.node.listen);
    let data_dir = PathBuf::from(args.data_dir.unwrap_or(config.node.data_dir));
    let log_level = if args.log_level == "info" {
        config.logging.level
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.vdisk.validate()?;
    let vdisk_id = config.group.vdisk_id();
    let group = Arc::new(config.group.group_info());
    let vdisk_config = Arc::new(config.vdisk);
    let sync_mode = if config.node.fsync { SyncMode::Always } else { SyncMode::Never };

    info!("Starting VDisk node");
    info!("Config file: {}", args.config);
    info!(vdisk = %vdisk_id, erasure = ?group.erasure, data_dir = %data_dir.display(), "unit");

    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address {listen}: {e}"))?;

    // Local recovery reads the whole log; keep it off the runtime threads
    let open_config = Arc::clone(&vdisk_config);
    let (launcher, done) =
        tokio::task::spawn_blocking(move || LocalLauncher::open(&data_dir, &open_config, sync_mode)).await??;

    let (node, node_rx) = Addr::channel();
    let view = Arc::new(RwLock::new(NodeView::new(vdisk_id)));
    let watcher = tokio::spawn(watch_node(node_rx, Arc::clone(&view)));

    let (skeleton, handle) = Skeleton::spawn(vdisk_id, group, vdisk_config, node, Box::new(launcher));
    skeleton.send(SkeletonMsg::LocalRecoveryDone(done));

    let app = http::router(http::AppState {
        skeleton: skeleton.clone(),
        view,
    });
    let listener = TcpListener::bind(addr).await?;
    info!("Status endpoint on http://{}/status", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    skeleton.send(SkeletonMsg::Poison);
    if let Err(e) = handle.await {
        warn!(error = %e, "skeleton task ended abnormally");
    }
    watcher.abort();

    info!("VDisk node shut down gracefully");
    Ok(())
}

/// Fold the skeleton's reports into the view served over HTTP
async fn watch_node(mut rx: UnboundedReceiver<NodeMsg>, view: Arc<RwLock<NodeView>>) {
    while let Some(msg) = rx.recv().await {
        match &msg {
            NodeMsg::Status { vdisk_id, status } => info!(vdisk = %vdisk_id, %status, "unit status"),
            NodeMsg::DropDonor { vdisk_id } => warn!(vdisk = %vdisk_id, "donor unit asks to be dropped"),
            NodeMsg::DatabaseError { vdisk_id, reason } => error!(vdisk = %vdisk_id, %reason, "unit failed"),
            NodeMsg::ScrubStatus {
                vdisk_id,
                has_unreadable,
            } => info!(vdisk = %vdisk_id, has_unreadable, "scrub status"),
        }
        view.write().apply(msg);
    }
}
