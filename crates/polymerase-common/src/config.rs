//! Configuration types for Polymerase
//!
//! This module defines configuration structures passed into each component
//! at construction time.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port of the backup service
pub const DEFAULT_PORT: u16 = 24925;

/// Root configuration for Polymerase
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Metadata store configuration
    pub meta: MetaConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        validate_store_dir(&self.storage.store_dir)?;
        if self.storage.serve_chunk_size == 0 {
            return Err(Error::validation("storage.serve_chunk_size must be positive"));
        }
        if self.storage.purge_depth == 0 {
            return Err(Error::validation("storage.purge_depth must be positive"));
        }
        Ok(())
    }
}

/// gRPC server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen: SocketAddr,
    /// Address other nodes and tooling use to reach this node
    /// (defaults to the listen address)
    pub advertise_addr: Option<String>,
    /// Node identifier (defaults to the hostname)
    pub node_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            advertise_addr: None,
            node_id: None,
        }
    }
}

/// Artifact storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for artifacts, temp files and the catalog
    pub store_dir: PathBuf,
    /// Chunk size used when streaming artifacts back (default: 1 MiB)
    pub serve_chunk_size: usize,
    /// Purge removes the lineage this many steps back and everything older
    pub purge_depth: usize,
}

impl StorageConfig {
    /// Directory holding in-flight artifacts
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.store_dir.join("temp")
    }

    /// Directory holding relocated artifacts
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.store_dir.join("backups")
    }

    /// Path of the catalog database
    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        self.store_dir.join("meta.redb")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/var/lib/polymerase"),
            serve_chunk_size: 1024 * 1024,
            purge_depth: 2,
        }
    }
}

/// Metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// How long a lineage lock acquisition may wait (milliseconds)
    pub lock_timeout_ms: u64,
}

impl MetaConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 10_000,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Reject store directories the process cannot resolve itself
pub fn validate_store_dir(path: &Path) -> Result<()> {
    let s = path.to_string_lossy();
    if s.is_empty() {
        return Err(Error::validation("store_dir must not be empty"));
    }
    if s.starts_with('~') {
        return Err(Error::validation(format!(
            "store_dir {s:?} must not start with '~', use an absolute path"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen.port(), DEFAULT_PORT);
        assert_eq!(config.storage.serve_chunk_size, 1024 * 1024);
        assert_eq!(config.storage.purge_depth, 2);
        assert_eq!(config.meta.lock_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            store_dir = "/data/polymerase"

            [server]
            node_id = "node-a"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.store_dir, PathBuf::from("/data/polymerase"));
        assert_eq!(config.storage.temp_dir(), PathBuf::from("/data/polymerase/temp"));
        assert_eq!(config.storage.meta_path(), PathBuf::from("/data/polymerase/meta.redb"));
        assert_eq!(config.server.node_id.as_deref(), Some("node-a"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_store_dir_rejects_tilde() {
        assert!(validate_store_dir(Path::new("~/backups")).is_err());
        assert!(validate_store_dir(Path::new("")).is_err());
        assert!(validate_store_dir(Path::new("/srv/backups")).is_ok());
    }
}
