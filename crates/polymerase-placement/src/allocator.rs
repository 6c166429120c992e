//! Host selection for new and existing databases

use polymerase_common::{DatabaseId, Error, NodeId, NodeMeta, Result};
use polymerase_meta_store::MetadataStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result of a placement decision
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub node_id: NodeId,
    /// Address the producer should stream to
    pub addr: String,
}

/// Chooses which node should host a database's backups
///
/// Reads are lock-free. Two concurrent first backups of the same database
/// may be placed on different nodes; affinity binds after the first one
/// is catalogued.
#[derive(Clone)]
pub struct NodeAllocator {
    store: MetadataStore,
}

impl NodeAllocator {
    #[must_use]
    pub const fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    /// Sticky to the node of the first scanned backup of `db`, otherwise
    /// the node with the most available disk
    pub async fn select_appropriate_host(&self, db: &DatabaseId) -> Result<Placement> {
        let existing = self.store.list_backup_metas(db).await?;
        if let Some(first) = existing.first() {
            debug!("Database {} is pinned to node {}", db, first.node_id);
            return Ok(Placement {
                node_id: first.node_id.clone(),
                addr: first.host_addr.clone(),
            });
        }

        let nodes = self.store.list_node_metas().await?;
        let chosen = select_by_capacity(&nodes)
            .ok_or_else(|| Error::not_found("no node is registered"))?;
        debug!(
            "Placing new database {} on node {} ({} bytes available)",
            db, chosen.node_id, chosen.disk_avail_bytes
        );
        Ok(Placement {
            node_id: chosen.node_id.clone(),
            addr: chosen.advertise_addr.clone(),
        })
    }
}

/// Node with the strictly largest available disk; the first seen wins ties
#[must_use]
pub fn select_by_capacity(nodes: &[NodeMeta]) -> Option<&NodeMeta> {
    let mut best: Option<&NodeMeta> = None;
    for node in nodes {
        if best.is_none_or(|b| node.disk_avail_bytes > b.disk_avail_bytes) {
            best = Some(node);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use polymerase_common::{BackupKey, BackupMeta, BackupType, StorageType, TimePoint};
    use polymerase_meta_store::MemoryKv;
    use rand::seq::SliceRandom;
    use std::sync::Arc;

    fn node(id: &str, avail: u64) -> NodeMeta {
        NodeMeta {
            node_id: NodeId::new(id).unwrap(),
            advertise_addr: format!("{id}.internal:24925"),
            store_dir_path: "/var/lib/polymerase".into(),
            disk_total_bytes: 1_000,
            disk_avail_bytes: avail,
        }
    }

    fn full_backup(db: &str, on: &NodeMeta) -> BackupMeta {
        let at = Utc.with_ymd_and_hms(2017, 12, 8, 0, 0, 0).unwrap();
        BackupMeta {
            key: BackupKey::root(DatabaseId::new(db).unwrap(), TimePoint::from_datetime(at)),
            backup_type: BackupType::Full,
            from_lsn: None,
            to_lsn: Some("500".into()),
            stored_time: at,
            file_size: 1,
            storage_type: StorageType::Local,
            host_addr: on.advertise_addr.clone(),
            node_id: on.node_id.clone(),
            checkpoints: None,
        }
    }

    #[test]
    fn test_select_by_capacity_first_seen_wins_ties() {
        let nodes = vec![node("a", 5), node("b", 9), node("c", 9), node("d", 1)];
        assert_eq!(select_by_capacity(&nodes).unwrap().node_id.as_str(), "b");
        assert!(select_by_capacity(&[]).is_none());
    }

    #[tokio::test]
    async fn test_no_nodes_is_not_found() {
        let store = MetadataStore::new(Arc::new(MemoryKv::new()));
        let allocator = NodeAllocator::new(store);
        let err = allocator
            .select_appropriate_host(&DatabaseId::new("shop").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_new_database_goes_to_most_free_node() {
        let store = MetadataStore::new(Arc::new(MemoryKv::new()));
        for n in [node("a", 10), node("b", 30), node("c", 20)] {
            store.put_node_meta(&n).await.unwrap();
        }
        let allocator = NodeAllocator::new(store);
        let placement = allocator
            .select_appropriate_host(&DatabaseId::new("shop").unwrap())
            .await
            .unwrap();
        assert_eq!(placement.node_id.as_str(), "b");
        assert_eq!(placement.addr, "b.internal:24925");
    }

    #[tokio::test]
    async fn test_existing_database_is_sticky() {
        let store = MetadataStore::new(Arc::new(MemoryKv::new()));
        let small = node("small", 1);
        store.put_node_meta(&small).await.unwrap();
        store
            .create_backup_meta(&full_backup("shop", &small))
            .await
            .unwrap();

        let allocator = NodeAllocator::new(store.clone());
        let mut rng = rand::thread_rng();
        let mut capacities: Vec<u64> = (0..20).map(|i| i * 100).collect();
        for round in 0..5 {
            capacities.shuffle(&mut rng);
            for (i, cap) in capacities.iter().enumerate() {
                store
                    .put_node_meta(&node(&format!("n{i}"), *cap + round))
                    .await
                    .unwrap();
            }
            let placement = allocator
                .select_appropriate_host(&DatabaseId::new("shop").unwrap())
                .await
                .unwrap();
            assert_eq!(placement.node_id.as_str(), "small");
            assert_eq!(placement.addr, small.advertise_addr);
        }
    }
}
