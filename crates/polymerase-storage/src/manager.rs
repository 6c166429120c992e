//! Node-level backup operations
//!
//! [`BackupManager`] ties the catalog, the physical storage and the
//! resolver together for everything outside a transfer session: restore
//! lookups, retention, checkpoint back-fill, artifact streaming, catalog
//! rebuild and node registration.

use crate::chain::ChainResolver;
use crate::disk::{ArtifactReader, PhysicalStorage};
use crate::transfer::TransferContext;
use bytes::Bytes;
use polymerase_common::checkpoint::CHECKPOINTS_FILE_NAME;
use polymerase_common::{
    BackupMeta, BackupType, Checkpoints, DatabaseId, Error, NodeId, NodeMeta, Result,
    StorageType, parse_restore_point,
};
use polymerase_meta_store::{MetadataStore, keys};
use polymerase_placement::{NodeAllocator, Placement};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reply of a purge with nothing old enough to remove
pub const NOTHING_TO_PURGE: &str = "There is no backup to purge.";

/// Reply of a successful purge
pub const PURGE_SUCCEEDED: &str = "Purge succeeds";

/// Identity this node records on backups it receives
#[derive(Clone, Debug)]
pub struct LocalNode {
    pub node_id: NodeId,
    pub advertise_addr: String,
}

/// Tunables of a [`BackupManager`]
#[derive(Clone, Copy, Debug)]
pub struct ManagerOptions {
    pub purge_depth: usize,
    pub serve_chunk_size: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            purge_depth: 2,
            serve_chunk_size: 1024 * 1024,
        }
    }
}

/// Outcome of a catalog rebuild
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub inserted: usize,
    pub already_catalogued: usize,
    pub skipped: usize,
}

/// Backup operations of one node
#[derive(Clone)]
pub struct BackupManager {
    store: MetadataStore,
    storage: Arc<dyn PhysicalStorage>,
    resolver: ChainResolver,
    allocator: NodeAllocator,
    node: LocalNode,
    options: ManagerOptions,
}

impl BackupManager {
    pub fn new(
        store: MetadataStore,
        storage: Arc<dyn PhysicalStorage>,
        node: LocalNode,
        options: ManagerOptions,
    ) -> Self {
        Self {
            resolver: ChainResolver::new(store.clone()),
            allocator: NodeAllocator::new(store.clone()),
            store,
            storage,
            node,
            options,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &MetadataStore {
        &self.store
    }

    #[must_use]
    pub const fn resolver(&self) -> &ChainResolver {
        &self.resolver
    }

    /// Collaborators for a new transfer session
    #[must_use]
    pub fn transfer_context(&self) -> TransferContext {
        TransferContext {
            store: self.store.clone(),
            storage: Arc::clone(&self.storage),
            resolver: self.resolver.clone(),
            node_id: self.node.node_id.clone(),
            host_addr: self.node.advertise_addr.clone(),
        }
    }

    /// `to_lsn` of the newest physical backup of `db`
    ///
    /// Producers continue the chain of an incremental from this LSN.
    pub async fn get_latest_to_lsn(&self, db: &DatabaseId) -> Result<String> {
        let mut metas: Vec<BackupMeta> = self
            .store
            .list_backup_metas(db)
            .await?
            .into_iter()
            .filter(|m| m.backup_type.is_physical())
            .collect();
        BackupMeta::sort_chronologically(&mut metas);
        let latest = metas
            .last()
            .ok_or_else(|| Error::not_found(format!("no backup of {db}")))?;
        latest.to_lsn.clone().ok_or_else(|| {
            Error::not_found(format!("latest backup {} has no recorded to_lsn", latest.key))
        })
    }

    /// Restore chain for `db` at the point described by `from`
    pub async fn get_keys_at_point(&self, db: &DatabaseId, from: &str) -> Result<Vec<BackupMeta>> {
        let point = parse_restore_point(from)?;
        self.resolver.search_consecutive_inc_backups(db, point).await
    }

    /// Remove the `purge_depth`-th past lineage of `db` and everything older
    ///
    /// Metadata goes first so the catalog never points at a deleted artifact.
    pub async fn purge_prev_backup(&self, db: &DatabaseId) -> Result<String> {
        let cutoff = match self
            .resolver
            .get_k_past_backup_key(db, self.options.purge_depth)
            .await
        {
            Ok(base) => base,
            Err(e) if e.is_not_found() => {
                debug!("Nothing to purge for {}: {}", db, e);
                return Ok(NOTHING_TO_PURGE.to_string());
            }
            Err(e) => return Err(e),
        };

        let doomed: Vec<BackupMeta> = self
            .store
            .list_backup_metas(db)
            .await?
            .into_iter()
            .filter(|m| m.key.base <= cutoff)
            .collect();
        let mut bases: Vec<_> = doomed.iter().map(|m| m.key.base.clone()).collect();
        bases.sort();
        bases.dedup();

        for base in &bases {
            let removed = self.store.remove_lineage(db, base).await?;
            warn!("Purged {} catalog records of {} lineage {}", removed, db, base);
        }
        for meta in &doomed {
            self.storage
                .delete_backup(&keys::storage_key(&meta.key))
                .await?;
        }
        info!(
            "Purged {} backups of {} up to lineage {}",
            doomed.len(),
            db,
            cutoff
        );
        Ok(PURGE_SUCCEEDED.to_string())
    }

    /// Back-fill the checkpoint manifest of a stored backup
    pub async fn update_checkpoint(&self, storage_key: &str, raw: &[u8]) -> Result<BackupMeta> {
        let key = keys::parse_storage_key(storage_key)?;
        let cp = Checkpoints::parse(raw)?;
        if cp.to_lsn.is_empty() {
            return Err(Error::validation("checkpoint manifest has no to_lsn"));
        }
        let meta = self.store.update_checkpoint(&key, cp).await?;
        self.storage
            .write_file(storage_key, CHECKPOINTS_FILE_NAME, raw)
            .await?;
        Ok(meta)
    }

    /// Open a catalogued artifact for streaming
    pub async fn open_backup(&self, storage_key: &str) -> Result<(BackupMeta, ArtifactReader)> {
        let key = keys::parse_storage_key(storage_key)?;
        let meta = self
            .store
            .get_backup_meta(&key)
            .await?
            .ok_or_else(|| Error::not_found(format!("backup {storage_key}")))?;
        let reader = self
            .storage
            .open_artifact(storage_key, meta.backup_type)
            .await?;
        Ok((meta, reader))
    }

    /// Stream a catalogued artifact in `serve_chunk_size` chunks
    ///
    /// The reader runs on its own task and stops when the receiver is
    /// dropped.
    pub async fn stream_backup(&self, storage_key: &str) -> Result<mpsc::Receiver<Result<Bytes>>> {
        let (meta, reader) = self.open_backup(storage_key).await?;
        let (tx, rx) = mpsc::channel(4);
        let chunk_size = self.options.serve_chunk_size;
        debug!("Serving {} ({} bytes)", meta.key, meta.file_size);
        tokio::spawn(pump_chunks(reader, chunk_size, tx));
        Ok(rx)
    }

    /// Where a backup of `db` should be sent
    pub async fn allocate_host(&self, db: &DatabaseId) -> Result<Placement> {
        self.allocator.select_appropriate_host(db).await
    }

    /// Insert catalog records for artifacts found on disk without one
    pub async fn rebuild_catalog(&self) -> Result<RebuildReport> {
        let mut report = RebuildReport::default();
        for artifact in self.storage.list_artifacts().await? {
            let key = match keys::parse_storage_key(&artifact.storage_key) {
                Ok(k) => k,
                Err(e) => {
                    warn!("Skipping {}: {}", artifact.storage_key, e);
                    report.skipped += 1;
                    continue;
                }
            };
            if self.store.get_backup_meta(&key).await?.is_some() {
                report.already_catalogued += 1;
                continue;
            }
            let stored_time = key.backup.to_datetime()?;
            let mut meta = BackupMeta {
                key,
                backup_type: artifact.backup_type,
                from_lsn: None,
                to_lsn: None,
                stored_time,
                file_size: artifact.file_size,
                storage_type: StorageType::Local,
                host_addr: self.node.advertise_addr.clone(),
                node_id: self.node.node_id.clone(),
                checkpoints: None,
            };
            let at_root = meta.key.base == meta.key.backup;
            let misplaced = match artifact.backup_type {
                BackupType::Full | BackupType::LogicalDump => !at_root,
                BackupType::Incremental => at_root,
            };
            if misplaced {
                warn!(
                    "Skipping {}: a {} backup cannot sit at that position of a lineage",
                    artifact.storage_key, artifact.backup_type
                );
                report.skipped += 1;
                continue;
            }
            if let Some(raw) = &artifact.manifest {
                let attached = Checkpoints::parse(raw).and_then(|cp| meta.backfill_checkpoints(cp));
                if let Err(e) = attached {
                    warn!("Ignoring manifest of {}: {}", artifact.storage_key, e);
                }
            }
            match self.store.create_backup_meta(&meta).await {
                Ok(()) => report.inserted += 1,
                Err(Error::AlreadyExists(_)) => report.already_catalogued += 1,
                Err(e) => return Err(e),
            }
        }
        info!(
            "Catalog rebuild: {} inserted, {} already present, {} skipped",
            report.inserted, report.already_catalogued, report.skipped
        );
        Ok(report)
    }

    /// Record this node's capacity so the allocator can place databases on it
    pub async fn register_local_node(&self) -> Result<NodeMeta> {
        let usage = self.storage.disk_usage()?;
        let node = NodeMeta {
            node_id: self.node.node_id.clone(),
            advertise_addr: self.node.advertise_addr.clone(),
            store_dir_path: self.storage.store_dir().to_string_lossy().into_owned(),
            disk_total_bytes: usage.total_bytes,
            disk_avail_bytes: usage.avail_bytes,
        };
        self.store.put_node_meta(&node).await?;
        info!(
            "Registered node {} at {} ({} of {} bytes available)",
            node.node_id, node.advertise_addr, node.disk_avail_bytes, node.disk_total_bytes
        );
        Ok(node)
    }
}

async fn pump_chunks(
    mut reader: ArtifactReader,
    chunk_size: usize,
    tx: mpsc::Sender<Result<Bytes>>,
) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        let item = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => Err(Error::from(e)),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() {
            debug!("Artifact reader stopped, receiver is gone");
            return;
        }
        if failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskStorage;
    use crate::transfer::TransferSession;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use polymerase_common::config::StorageConfig;
    use polymerase_common::{BackupRequest, TimePoint};
    use polymerase_meta_store::MemoryKv;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        manager: BackupManager,
        storage: Arc<DiskStorage>,
    }

    fn fixture_with(options: ManagerOptions) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            DiskStorage::open(&StorageConfig {
                store_dir: dir.path().to_path_buf(),
                ..StorageConfig::default()
            })
            .unwrap(),
        );
        let manager = BackupManager::new(
            MetadataStore::new(Arc::new(MemoryKv::new())),
            storage.clone(),
            LocalNode {
                node_id: NodeId::new("node1").unwrap(),
                advertise_addr: "10.0.0.1:24925".into(),
            },
            options,
        );
        Fixture {
            _dir: dir,
            manager,
            storage,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ManagerOptions::default())
    }

    fn shop() -> DatabaseId {
        DatabaseId::new("shop").unwrap()
    }

    fn t(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 12, 8, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    async fn store_backup(
        manager: &BackupManager,
        request: BackupRequest,
        at: DateTime<Utc>,
        manifest: Option<&str>,
    ) -> BackupMeta {
        let mut session = TransferSession::new(manager.transfer_context());
        session.initialize_at(shop(), request, at).await.unwrap();
        session.append(b"artifact bytes").await.unwrap();
        if let Some(m) = manifest {
            session.post_checkpoint(m.as_bytes()).unwrap();
        }
        session.finalize().await.unwrap()
    }

    async fn full(manager: &BackupManager, at: i64, to_lsn: u32) -> BackupMeta {
        let manifest = format!("backup_type = full-backuped\nfrom_lsn = 0\nto_lsn = {to_lsn}\n");
        store_backup(manager, BackupRequest::Full, t(at), Some(&manifest)).await
    }

    async fn inc(manager: &BackupManager, at: i64, from: u32, to: u32) -> BackupMeta {
        let manifest = format!("backup_type = incremental\nfrom_lsn = {from}\nto_lsn = {to}\n");
        store_backup(
            manager,
            BackupRequest::Incremental {
                lsn: from.to_string(),
            },
            t(at),
            Some(&manifest),
        )
        .await
    }

    #[tokio::test]
    async fn test_latest_to_lsn() {
        let fx = fixture();
        assert!(fx.manager.get_latest_to_lsn(&shop()).await.unwrap_err().is_not_found());

        full(&fx.manager, 0, 500).await;
        inc(&fx.manager, 1, 500, 620).await;
        assert_eq!(fx.manager.get_latest_to_lsn(&shop()).await.unwrap(), "620");

        // a dump does not move the LSN
        store_backup(&fx.manager, BackupRequest::LogicalDump, t(2), None).await;
        assert_eq!(fx.manager.get_latest_to_lsn(&shop()).await.unwrap(), "620");

        // an incremental whose manifest has not arrived yet
        store_backup(
            &fx.manager,
            BackupRequest::Incremental { lsn: "620".into() },
            t(3),
            None,
        )
        .await;
        assert!(fx.manager.get_latest_to_lsn(&shop()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_keys_at_point_accepts_dates() {
        let fx = fixture();
        let f = full(&fx.manager, 0, 500).await;
        let i = inc(&fx.manager, 1, 500, 620).await;

        let chain = fx.manager.get_keys_at_point(&shop(), "2017-12-08").await.unwrap();
        assert_eq!(chain, vec![f.clone(), i]);

        let chain = fx
            .manager
            .get_keys_at_point(&shop(), "2017-12-08T00:30:00Z")
            .await
            .unwrap();
        assert_eq!(chain, vec![f]);

        assert!(matches!(
            fx.manager.get_keys_at_point(&shop(), "soon").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_keeps_newest_lineage() {
        let fx = fixture();
        assert_eq!(fx.manager.purge_prev_backup(&shop()).await.unwrap(), NOTHING_TO_PURGE);

        let old = full(&fx.manager, 0, 100).await;
        let old_inc = inc(&fx.manager, 1, 100, 200).await;
        assert_eq!(fx.manager.purge_prev_backup(&shop()).await.unwrap(), NOTHING_TO_PURGE);

        let mid = full(&fx.manager, 2, 300).await;
        let new = full(&fx.manager, 4, 500).await;
        assert_eq!(fx.manager.purge_prev_backup(&shop()).await.unwrap(), PURGE_SUCCEEDED);

        let left = fx.manager.store().list_backup_metas(&shop()).await.unwrap();
        assert_eq!(left, vec![new.clone()]);
        for gone in [&old, &old_inc, &mid] {
            let err = fx
                .storage
                .open_artifact(&keys::storage_key(&gone.key), gone.backup_type)
                .await
                .err()
                .expect("purged artifact is still readable");
            assert!(err.is_not_found());
        }
        assert!(
            fx.storage
                .open_artifact(&keys::storage_key(&new.key), BackupType::Full)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_update_checkpoint_out_of_band() {
        let fx = fixture();
        full(&fx.manager, 0, 500).await;
        let pending = store_backup(
            &fx.manager,
            BackupRequest::Incremental { lsn: "500".into() },
            t(1),
            None,
        )
        .await;
        let skey = keys::storage_key(&pending.key);

        assert!(matches!(
            fx.manager.update_checkpoint(&skey, b"from_lsn = 500\n").await,
            Err(Error::Validation(_))
        ));

        let updated = fx
            .manager
            .update_checkpoint(&skey, b"backup_type = incremental\nfrom_lsn = 500\nto_lsn = 620\n")
            .await
            .unwrap();
        assert_eq!(updated.to_lsn.as_deref(), Some("620"));
        assert_eq!(fx.manager.get_latest_to_lsn(&shop()).await.unwrap(), "620");

        let missing = keys::storage_key(&polymerase_common::BackupKey::root(
            shop(),
            TimePoint::from_datetime(t(9)),
        ));
        let err = fx
            .manager
            .update_checkpoint(&missing, b"to_lsn = 1\n")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stream_backup_in_chunks() {
        let fx = fixture_with(ManagerOptions {
            serve_chunk_size: 4,
            ..ManagerOptions::default()
        });
        let meta = full(&fx.manager, 0, 500).await;
        let mut rx = fx
            .manager
            .stream_backup(&keys::storage_key(&meta.key))
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk.unwrap());
        }
        assert!(chunks.iter().all(|c| c.len() <= 4));
        assert_eq!(chunks.concat(), b"artifact bytes");

        let missing = keys::storage_key(&polymerase_common::BackupKey::root(
            shop(),
            TimePoint::from_datetime(t(9)),
        ));
        assert!(fx.manager.stream_backup(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rebuild_catalog_from_disk() {
        let fx = fixture();
        let f = full(&fx.manager, 0, 500).await;
        let i = inc(&fx.manager, 1, 500, 620).await;
        let d = store_backup(&fx.manager, BackupRequest::LogicalDump, t(2), None).await;

        // a fresh catalog over the same disk
        let rebuilt = BackupManager::new(
            MetadataStore::new(Arc::new(MemoryKv::new())),
            fx.storage.clone(),
            LocalNode {
                node_id: NodeId::new("node1").unwrap(),
                advertise_addr: "10.0.0.1:24925".into(),
            },
            ManagerOptions::default(),
        );
        let report = rebuilt.rebuild_catalog().await.unwrap();
        assert_eq!(report.inserted, 3);

        let mut metas = rebuilt.store().list_backup_metas(&shop()).await.unwrap();
        BackupMeta::sort_chronologically(&mut metas);
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[0].to_lsn, f.to_lsn);
        assert_eq!(metas[1].from_lsn, i.from_lsn);
        assert_eq!(metas[1].to_lsn, i.to_lsn);
        assert_eq!(metas[2].key, d.key);
        assert_eq!(metas[2].backup_type, BackupType::LogicalDump);

        let again = rebuilt.rebuild_catalog().await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.already_catalogued, 3);

        let chain = rebuilt.get_keys_at_point(&shop(), "2017-12-08").await.unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[tokio::test]
    async fn test_register_and_allocate() {
        let fx = fixture();
        let node = fx.manager.register_local_node().await.unwrap();
        assert!(node.disk_total_bytes > 0);
        let placement = fx.manager.allocate_host(&shop()).await.unwrap();
        assert_eq!(placement.node_id, node.node_id);
        assert_eq!(placement.addr, "10.0.0.1:24925");
    }
}
