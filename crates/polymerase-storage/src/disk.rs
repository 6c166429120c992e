//! Physical artifact storage
//!
//! Artifacts are written into a per-session temp directory and renamed into
//! `backups/<storage key>/` when the session finalizes. The storage key is
//! the relative directory of a backup, so an artifact is found from its
//! catalog key alone.

use async_trait::async_trait;
use polymerase_common::config::{StorageConfig, validate_store_dir};
use polymerase_common::{BackupKey, BackupType, Error, Result};
use polymerase_meta_store::keys;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Writer of an in-flight artifact
pub type ArtifactWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reader of a stored artifact
pub type ArtifactReader = Box<dyn AsyncRead + Send + Unpin>;

/// Temp directory owned by one transfer session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TempArtifact {
    pub dir: PathBuf,
    pub backup_type: BackupType,
}

impl TempArtifact {
    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        self.dir.join(self.backup_type.artifact_name())
    }
}

/// Artifact found on disk while rebuilding the catalog
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredArtifact {
    pub storage_key: String,
    pub backup_type: BackupType,
    pub file_size: u64,
    /// Raw checkpoint manifest stored next to the artifact
    pub manifest: Option<Vec<u8>>,
}

/// Capacity of the filesystem holding the store directory
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub avail_bytes: u64,
}

/// Where artifacts live
#[async_trait]
pub trait PhysicalStorage: Send + Sync {
    /// Allocate a temp directory and open the artifact writer for `key`
    async fn create_temp(
        &self,
        key: &BackupKey,
        backup_type: BackupType,
    ) -> Result<(TempArtifact, ArtifactWriter)>;

    /// Write an auxiliary file into a session's temp directory
    async fn write_temp_file(&self, temp: &TempArtifact, name: &str, bytes: &[u8]) -> Result<()>;

    /// Move a finished temp directory to its permanent location
    async fn relocate(&self, temp: &TempArtifact, storage_key: &str) -> Result<()>;

    /// Discard a temp directory; must not block on the network
    fn discard_temp(&self, temp: &TempArtifact) -> Result<()>;

    /// Write an auxiliary file next to a stored artifact
    async fn write_file(&self, storage_key: &str, name: &str, bytes: &[u8]) -> Result<()>;

    /// Open a stored artifact for reading
    async fn open_artifact(
        &self,
        storage_key: &str,
        backup_type: BackupType,
    ) -> Result<ArtifactReader>;

    /// Remove a stored backup directory
    async fn delete_backup(&self, storage_key: &str) -> Result<()>;

    /// Every recognisable artifact under the backups directory
    async fn list_artifacts(&self) -> Result<Vec<StoredArtifact>>;

    /// Capacity sample of the store directory
    fn disk_usage(&self) -> Result<DiskUsage>;

    /// Root of the store, as advertised to other nodes
    fn store_dir(&self) -> &Path;
}

/// [`PhysicalStorage`] on a local filesystem
pub struct DiskStorage {
    store_dir: PathBuf,
    temp_dir: PathBuf,
    backups_dir: PathBuf,
    seq: AtomicU64,
}

impl DiskStorage {
    /// Create the directory layout and clear temp state left by a crash
    pub fn open(config: &StorageConfig) -> Result<Self> {
        validate_store_dir(&config.store_dir)?;
        let temp_dir = config.temp_dir();
        let backups_dir = config.backups_dir();
        std::fs::create_dir_all(&backups_dir)?;
        std::fs::create_dir_all(&temp_dir)?;

        for entry in std::fs::read_dir(&temp_dir)? {
            let path = entry?.path();
            warn!("Removing stale temp directory {}", path.display());
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }

        Ok(Self {
            store_dir: config.store_dir.clone(),
            temp_dir,
            backups_dir,
            seq: AtomicU64::new(0),
        })
    }

    /// Directory of a stored backup; rejects keys that leave the backups dir
    pub fn backup_dir(&self, storage_key: &str) -> Result<PathBuf> {
        let rel = Path::new(storage_key);
        let mut depth = 0;
        for c in rel.components() {
            match c {
                Component::Normal(_) => depth += 1,
                _ => {
                    return Err(Error::key_decode(format!(
                        "storage key {storage_key:?} is not a relative path"
                    )));
                }
            }
        }
        if depth != 3 {
            return Err(Error::key_decode(format!(
                "storage key {storage_key:?} must have three components"
            )));
        }
        Ok(self.backups_dir.join(rel))
    }

    fn remove_empty_parents(&self, dir: &Path) {
        let mut cur = dir.parent();
        while let Some(p) = cur {
            if p == self.backups_dir || std::fs::remove_dir(p).is_err() {
                break;
            }
            cur = p.parent();
        }
    }
}

#[async_trait]
impl PhysicalStorage for DiskStorage {
    async fn create_temp(
        &self,
        key: &BackupKey,
        backup_type: BackupType,
    ) -> Result<(TempArtifact, ArtifactWriter)> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}_{}_{}_{seq}",
            keys::escape_db(key.db.as_str()),
            key.backup,
            std::process::id()
        );
        let temp = TempArtifact {
            dir: self.temp_dir.join(name),
            backup_type,
        };
        tokio::fs::create_dir(&temp.dir).await?;
        let file = match tokio::fs::File::create(temp.artifact_path()).await {
            Ok(f) => f,
            Err(e) => {
                let _ = self.discard_temp(&temp);
                return Err(e.into());
            }
        };
        debug!("Opened temp artifact {}", temp.artifact_path().display());
        let writer: ArtifactWriter = Box::new(tokio::io::BufWriter::new(file));
        Ok((temp, writer))
    }

    async fn write_temp_file(&self, temp: &TempArtifact, name: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(temp.dir.join(name), bytes).await?;
        Ok(())
    }

    async fn relocate(&self, temp: &TempArtifact, storage_key: &str) -> Result<()> {
        let dest = self.backup_dir(storage_key)?;
        if tokio::fs::try_exists(&dest).await? {
            return Err(Error::AlreadyExists(storage_key.to_string()));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&temp.dir, &dest).await?;
        debug!("Relocated {} to {}", temp.dir.display(), dest.display());
        Ok(())
    }

    fn discard_temp(&self, temp: &TempArtifact) -> Result<()> {
        match std::fs::remove_dir_all(&temp.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, storage_key: &str, name: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.backup_dir(storage_key)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(Error::not_found(format!("backup directory {storage_key}")));
        }
        tokio::fs::write(dir.join(name), bytes).await?;
        Ok(())
    }

    async fn open_artifact(
        &self,
        storage_key: &str,
        backup_type: BackupType,
    ) -> Result<ArtifactReader> {
        let path = self
            .backup_dir(storage_key)?
            .join(backup_type.artifact_name());
        match tokio::fs::File::open(&path).await {
            Ok(f) => {
                let reader: ArtifactReader = Box::new(f);
                Ok(reader)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(format!(
                "artifact {}",
                path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_backup(&self, storage_key: &str) -> Result<()> {
        let dir = self.backup_dir(storage_key)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Backup directory {} was already gone", dir.display());
            }
            Err(e) => return Err(e.into()),
        }
        self.remove_empty_parents(&dir);
        Ok(())
    }

    async fn list_artifacts(&self) -> Result<Vec<StoredArtifact>> {
        let mut found = Vec::new();
        for db_dir in read_subdirs(&self.backups_dir).await? {
            for base_dir in read_subdirs(&db_dir).await? {
                for backup_dir in read_subdirs(&base_dir).await? {
                    let Ok(rel) = backup_dir.strip_prefix(&self.backups_dir) else {
                        continue;
                    };
                    let Some(storage_key) = rel.to_str().map(str::to_string) else {
                        warn!("Skipping non utf-8 path {}", backup_dir.display());
                        continue;
                    };
                    let mut entries = tokio::fs::read_dir(&backup_dir).await?;
                    let mut artifact = None;
                    let mut manifest = None;
                    while let Some(entry) = entries.next_entry().await? {
                        let name = entry.file_name();
                        let name = name.to_string_lossy();
                        if name == polymerase_common::checkpoint::CHECKPOINTS_FILE_NAME {
                            manifest = Some(tokio::fs::read(entry.path()).await?);
                        } else if let Some(t) = BackupType::from_artifact_name(&name) {
                            artifact = Some((t, entry.metadata().await?.len()));
                        }
                    }
                    if let Some((backup_type, file_size)) = artifact {
                        found.push(StoredArtifact {
                            storage_key,
                            backup_type,
                            file_size,
                            manifest,
                        });
                    }
                }
            }
        }
        Ok(found)
    }

    // NB: allow() because the block count type is u32 on macOS.
    #[allow(clippy::useless_conversion)]
    fn disk_usage(&self) -> Result<DiskUsage> {
        let stat = nix::sys::statvfs::statvfs(self.store_dir.as_path()).map_err(std::io::Error::from)?;
        let fragment = u64::from(stat.fragment_size());
        Ok(DiskUsage {
            total_bytes: u64::from(stat.blocks()).saturating_mul(fragment),
            avail_bytes: u64::from(stat.blocks_available()).saturating_mul(fragment),
        })
    }

    fn store_dir(&self) -> &Path {
        &self.store_dir
    }
}

async fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
