//! Typed catalog over a [`KvStore`]
//!
//! Records are bincode-encoded. Bulk scans skip entries that fail to decode;
//! a directly addressed entry that fails to decode is an error.

use crate::keys;
use crate::kv::KvStore;
use crate::lock::LockGuard;
use polymerase_common::{
    BackupKey, BackupMeta, Checkpoints, DatabaseId, Error, NodeId, NodeMeta, Result, TimePoint,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Backup and node catalog
#[derive(Clone)]
pub struct MetadataStore {
    kv: Arc<dyn KvStore>,
}

impl MetadataStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Underlying KV store
    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    // ---- Backups ----

    /// Read one backup record
    pub async fn get_backup_meta(&self, key: &BackupKey) -> Result<Option<BackupMeta>> {
        match self.kv.get(&keys::meta_key(key)).await? {
            Some(bytes) => decode::<BackupMeta>(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Every backup of `db` in key order; corrupt entries are skipped
    pub async fn list_backup_metas(&self, db: &DatabaseId) -> Result<Vec<BackupMeta>> {
        self.scan_backups(&keys::db_prefix(db)).await
    }

    /// Every backup of one lineage in key order
    pub async fn list_lineage(&self, db: &DatabaseId, base: &TimePoint) -> Result<Vec<BackupMeta>> {
        self.scan_backups(&keys::lineage_prefix(db, base)).await
    }

    /// Every backup of every database
    pub async fn list_all_backup_metas(&self) -> Result<Vec<BackupMeta>> {
        self.scan_backups(keys::META_BACKUP_PREFIX).await
    }

    async fn scan_backups(&self, prefix: &[u8]) -> Result<Vec<BackupMeta>> {
        let entries = self.kv.get_prefix(prefix).await?;
        let mut result = Vec::with_capacity(entries.len());
        for (raw_key, bytes) in entries {
            match decode::<BackupMeta>(&bytes) {
                Ok(meta) if keys::meta_key(&meta.key) == raw_key => result.push(meta),
                Ok(meta) => warn!(
                    "Skipping backup record {} stored under foreign key {}",
                    meta.key,
                    String::from_utf8_lossy(&raw_key)
                ),
                Err(e) => warn!(
                    "Skipping undecodable backup record {}: {}",
                    String::from_utf8_lossy(&raw_key),
                    e
                ),
            }
        }
        Ok(result)
    }

    /// Acquire the lock serializing writes to one lineage
    pub async fn lock_lineage(&self, db: &DatabaseId, base: &TimePoint) -> Result<LockGuard> {
        self.kv.lock(&keys::lineage_lock_key(db, base)).await
    }

    /// Persist a new backup record under its lineage lock
    ///
    /// Fails with [`Error::AlreadyExists`] if the key is taken; records are
    /// never overwritten.
    pub async fn create_backup_meta(&self, meta: &BackupMeta) -> Result<()> {
        let _guard = self.lock_lineage(meta.db(), meta.base_time_point()).await?;
        let key = keys::meta_key(&meta.key);
        if self.kv.get(&key).await?.is_some() {
            return Err(Error::AlreadyExists(keys::storage_key(&meta.key)));
        }
        self.kv.put(&key, &encode(meta)?).await?;
        info!("Catalogued {} backup {}", meta.backup_type, meta.key);
        Ok(())
    }

    /// Back-fill the checkpoint manifest of an existing record
    ///
    /// Read-modify-write under the lineage lock. Returns the record as
    /// persisted.
    pub async fn update_checkpoint(&self, key: &BackupKey, cp: Checkpoints) -> Result<BackupMeta> {
        let _guard = self.lock_lineage(&key.db, &key.base).await?;
        let mut meta = self
            .get_backup_meta(key)
            .await?
            .ok_or_else(|| Error::not_found(format!("backup {}", keys::storage_key(key))))?;
        if meta.backfill_checkpoints(cp)? {
            self.kv.put(&keys::meta_key(key), &encode(&meta)?).await?;
            info!("Back-filled checkpoints of {}", key);
        } else {
            debug!("Checkpoints of {} already recorded", key);
        }
        Ok(meta)
    }

    /// Remove every record of one lineage; returns the number removed
    pub async fn remove_lineage(&self, db: &DatabaseId, base: &TimePoint) -> Result<usize> {
        let _guard = self.lock_lineage(db, base).await?;
        self.kv.delete_prefix(&keys::lineage_prefix(db, base)).await
    }

    // ---- Nodes ----

    /// Create or refresh a node record
    pub async fn put_node_meta(&self, node: &NodeMeta) -> Result<()> {
        self.kv
            .put(&keys::node_key(&node.node_id), &encode(node)?)
            .await
    }

    pub async fn get_node_meta(&self, node_id: &NodeId) -> Result<Option<NodeMeta>> {
        match self.kv.get(&keys::node_key(node_id)).await? {
            Some(bytes) => decode::<NodeMeta>(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Every registered node in key order; corrupt entries are skipped
    pub async fn list_node_metas(&self) -> Result<Vec<NodeMeta>> {
        let entries = self.kv.get_prefix(keys::META_NODE_PREFIX).await?;
        let mut result = Vec::with_capacity(entries.len());
        for (raw_key, bytes) in entries {
            match decode::<NodeMeta>(&bytes) {
                Ok(node) => result.push(node),
                Err(e) => warn!(
                    "Skipping undecodable node record {}: {}",
                    String::from_utf8_lossy(&raw_key),
                    e
                ),
            }
        }
        Ok(result)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use chrono::{DateTime, TimeZone, Utc};
    use polymerase_common::{BackupType, StorageType};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 12, 8, h, 0, 0).unwrap()
    }

    fn record(db: &str, base: u32, backup: u32, backup_type: BackupType) -> BackupMeta {
        BackupMeta {
            key: BackupKey::new(
                DatabaseId::new(db).unwrap(),
                TimePoint::from_datetime(at(base)),
                TimePoint::from_datetime(at(backup)),
            ),
            backup_type,
            from_lsn: (backup_type == BackupType::Incremental).then(|| "500".to_string()),
            to_lsn: None,
            stored_time: at(backup),
            file_size: 10,
            storage_type: StorageType::Local,
            host_addr: "10.0.0.1:24925".into(),
            node_id: NodeId::new("node1").unwrap(),
            checkpoints: None,
        }
    }

    fn store() -> (Arc<MemoryKv>, MetadataStore) {
        let kv = Arc::new(MemoryKv::new());
        (kv.clone(), MetadataStore::new(kv))
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let (_, store) = store();
        let full = record("shop", 1, 1, BackupType::Full);
        store.create_backup_meta(&full).await.unwrap();
        store
            .create_backup_meta(&record("shop2", 1, 1, BackupType::Full))
            .await
            .unwrap();

        let shop = DatabaseId::new("shop").unwrap();
        let listed = store.list_backup_metas(&shop).await.unwrap();
        assert_eq!(listed, vec![full.clone()]);
        assert_eq!(store.get_backup_meta(&full.key).await.unwrap(), Some(full.clone()));
        assert_eq!(store.list_all_backup_metas().await.unwrap().len(), 2);

        let err = store.create_backup_meta(&full).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_corrupt_entries() {
        let (kv, store) = store();
        let full = record("shop", 1, 1, BackupType::Full);
        store.create_backup_meta(&full).await.unwrap();
        let broken = record("shop", 2, 2, BackupType::Full);
        kv.put(&keys::meta_key(&broken.key), b"\xff\xfe").await.unwrap();

        // bulk scan skips it
        let listed = store.list_backup_metas(full.db()).await.unwrap();
        assert_eq!(listed, vec![full]);

        // direct read fails
        let err = store.get_backup_meta(&broken.key).await.unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }

    #[tokio::test]
    async fn test_update_checkpoint_backfills_once() {
        let (_, store) = store();
        let inc = record("shop", 1, 2, BackupType::Incremental);
        store.create_backup_meta(&inc).await.unwrap();

        let cp = Checkpoints::parse(b"from_lsn = 500\nto_lsn = 620\n").unwrap();
        let updated = store.update_checkpoint(&inc.key, cp.clone()).await.unwrap();
        assert_eq!(updated.to_lsn.as_deref(), Some("620"));
        assert_eq!(store.update_checkpoint(&inc.key, cp).await.unwrap(), updated);

        let conflicting = Checkpoints::parse(b"from_lsn = 500\nto_lsn = 700\n").unwrap();
        assert!(store.update_checkpoint(&inc.key, conflicting).await.is_err());
        let missing = record("shop", 1, 3, BackupType::Incremental);
        let err = store
            .update_checkpoint(&missing.key, Checkpoints::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_concurrent_finalize_and_backfill() {
        let (_, store) = store();
        let full = record("shop", 1, 1, BackupType::Full);
        store.create_backup_meta(&full).await.unwrap();

        let mut tasks = Vec::new();
        for h in 2..10 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .create_backup_meta(&record("shop", 1, h, BackupType::Incremental))
                    .await
            }));
        }
        let backfill = {
            let store = store.clone();
            let key = full.key.clone();
            tokio::spawn(async move {
                let cp = Checkpoints::parse(b"backup_type = full-backuped\nto_lsn = 500\n").unwrap();
                store.update_checkpoint(&key, cp).await
            })
        };
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        backfill.await.unwrap().unwrap();

        let lineage = store
            .list_lineage(full.db(), full.base_time_point())
            .await
            .unwrap();
        assert_eq!(lineage.len(), 9);
        let root = store.get_backup_meta(&full.key).await.unwrap().unwrap();
        assert_eq!(root.to_lsn.as_deref(), Some("500"));
        assert!(root.checkpoints.is_some());
    }

    #[tokio::test]
    async fn test_remove_lineage_leaves_others() {
        let (_, store) = store();
        for (base, backup) in [(1, 1), (1, 2), (3, 3)] {
            let t = if base == backup { BackupType::Full } else { BackupType::Incremental };
            store.create_backup_meta(&record("shop", base, backup, t)).await.unwrap();
        }
        let shop = DatabaseId::new("shop").unwrap();
        let removed = store
            .remove_lineage(&shop, &TimePoint::from_datetime(at(1)))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        let left = store.list_backup_metas(&shop).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].key.base, TimePoint::from_datetime(at(3)));
    }

    #[tokio::test]
    async fn test_node_records() {
        let (kv, store) = store();
        for (id, avail) in [("a", 10), ("b", 20)] {
            store
                .put_node_meta(&NodeMeta {
                    node_id: NodeId::new(id).unwrap(),
                    advertise_addr: format!("{id}:24925"),
                    store_dir_path: "/var/lib/polymerase".into(),
                    disk_total_bytes: 100,
                    disk_avail_bytes: avail,
                })
                .await
                .unwrap();
        }
        kv.put(b"meta-node-zz", b"garbage").await.unwrap();

        let nodes = store.list_node_metas().await.unwrap();
        assert_eq!(nodes.len(), 2);
        let b = store.get_node_meta(&NodeId::new("b").unwrap()).await.unwrap();
        assert_eq!(b.map(|n| n.disk_avail_bytes), Some(20));
    }
}
