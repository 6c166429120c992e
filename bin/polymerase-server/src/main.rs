//! Polymerase Server - backup storage node
//!
//! This binary receives backup artifacts from producers, keeps the backup
//! catalog and answers restore tooling.

mod service;

use anyhow::{Context, Result};
use clap::Parser;
use polymerase_common::{Config, NodeId};
use polymerase_meta_store::{MetadataStore, RedbKv};
use polymerase_proto::backup::backup_service_server::BackupServiceServer;
use polymerase_storage::{BackupManager, DiskStorage, LocalNode, ManagerOptions};
use service::BackupNodeService;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "polymerase-server")]
#[command(about = "Polymerase backup storage node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/polymerase/server.toml")]
    config: String,

    /// Listen address for gRPC
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Address recorded on stored backups and handed out by host allocation.
    /// If not set, derived from the hostname and listen port
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Node ID (defaults to the hostname)
    #[arg(long)]
    node_id: Option<String>,

    /// Root directory for artifacts and the catalog
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Recreate missing catalog records from the artifacts on disk before serving
    #[arg(long)]
    rebuild_catalog: bool,
}

/// Largest transfer message accepted (one content chunk)
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config))?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    // CLI takes precedence
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(addr) = &args.advertise_addr {
        config.server.advertise_addr = Some(addr.clone());
    }
    if let Some(node_id) = &args.node_id {
        config.server.node_id = Some(node_id.clone());
    }
    if let Some(dir) = &args.store_dir {
        config.storage.store_dir.clone_from(dir);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Polymerase server");
    info!("Config file: {}", args.config);
    info!("Store directory: {}", config.storage.store_dir.display());

    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let node_id = NodeId::new(config.server.node_id.clone().unwrap_or_else(|| hostname.clone()))?;
    let listen = config.server.listen;
    let advertise_addr = config.server.advertise_addr.clone().unwrap_or_else(|| {
        if listen.ip().is_unspecified() {
            format!("{}:{}", hostname, listen.port())
        } else {
            listen.to_string()
        }
    });
    info!("Node {} advertising at {}", node_id, advertise_addr);

    let storage = DiskStorage::open(&config.storage)?;
    let kv = RedbKv::open(config.storage.meta_path(), config.meta.lock_timeout())?;
    let manager = BackupManager::new(
        MetadataStore::new(Arc::new(kv)),
        Arc::new(storage),
        LocalNode {
            node_id,
            advertise_addr,
        },
        ManagerOptions {
            purge_depth: config.storage.purge_depth,
            serve_chunk_size: config.storage.serve_chunk_size,
        },
    );

    if args.rebuild_catalog {
        let report = manager.rebuild_catalog().await?;
        if report.skipped > 0 {
            warn!("{} artifacts could not be catalogued", report.skipped);
        }
    }

    manager.register_local_node().await?;

    let backup_service = BackupServiceServer::new(BackupNodeService::new(manager))
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE);

    info!("Starting gRPC server on {}", listen);

    Server::builder()
        .add_service(backup_service)
        .serve_with_shutdown(listen, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("Polymerase server shut down gracefully");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            "[storage]\nstore_dir = \"/data/a\"\npurge_depth = 3\n\n[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();

        let args = Args::parse_from([
            "polymerase-server",
            "--config",
            path.to_str().unwrap(),
            "--store-dir",
            "/data/b",
            "--listen",
            "127.0.0.1:5000",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.storage.store_dir, PathBuf::from("/data/b"));
        assert_eq!(config.storage.purge_depth, 3);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server.listen.port(), 5000);
        assert!(!args.rebuild_catalog);
    }

    #[test]
    fn test_rejects_home_relative_store_dir() {
        let args = Args::parse_from([
            "polymerase-server",
            "--config",
            "/nonexistent/server.toml",
            "--store-dir",
            "~/backups",
        ]);
        assert!(load_config(&args).is_err());
    }
}
