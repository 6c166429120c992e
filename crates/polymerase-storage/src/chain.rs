//! LSN-based chain resolution
//!
//! Incremental backups are only replayable in order: each one starts at
//! the LSN its predecessor in the lineage ended at. The resolver reads the
//! catalog without locks and never trusts scan order; every search sorts
//! records chronologically (stored time, then key) before matching.

use chrono::{DateTime, Utc};
use polymerase_common::{BackupMeta, BackupType, DatabaseId, Error, Result, TimePoint};
use polymerase_meta_store::{MetadataStore, keys};
use std::collections::BTreeSet;
use tracing::debug;

/// Read-only algorithms over the backup catalog
#[derive(Clone)]
pub struct ChainResolver {
    store: MetadataStore,
}

impl ChainResolver {
    #[must_use]
    pub const fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    /// Physical backups of `db`, oldest first
    async fn physical_backups(&self, db: &DatabaseId) -> Result<Vec<BackupMeta>> {
        let mut metas: Vec<BackupMeta> = self
            .store
            .list_backup_metas(db)
            .await?
            .into_iter()
            .filter(|m| m.backup_type.is_physical())
            .collect();
        BackupMeta::sort_chronologically(&mut metas);
        Ok(metas)
    }

    /// Base time point of the lineage whose backup ended at `lsn`
    ///
    /// The oldest match wins when several lineages reused the same LSN.
    pub async fn search_base_time_point_by_lsn(
        &self,
        db: &DatabaseId,
        lsn: &str,
    ) -> Result<TimePoint> {
        let metas = self.physical_backups(db).await?;
        metas
            .iter()
            .find(|m| m.to_lsn.as_deref() == Some(lsn))
            .map(|m| {
                debug!("LSN {} of {} ends backup {}", lsn, db, m.key);
                m.key.base.clone()
            })
            .ok_or_else(|| Error::LineageNotFound {
                db: db.to_string(),
                lsn: lsn.to_string(),
            })
    }

    /// Minimal chain restoring `db` to its state at `from`, oldest first
    ///
    /// The target is the newest physical backup stored at or before `from`.
    /// The chain walks back through the target's lineage to its full backup,
    /// requiring each predecessor's `to_lsn` to equal the successor's
    /// `from_lsn`. A discontinuity is reported as [`Error::ChainBroken`]
    /// carrying the suffix collected so far.
    pub async fn search_consecutive_inc_backups(
        &self,
        db: &DatabaseId,
        from: DateTime<Utc>,
    ) -> Result<Vec<BackupMeta>> {
        let metas = self.physical_backups(db).await?;
        let Some(target_idx) = metas.iter().rposition(|m| m.stored_time <= from) else {
            return Err(Error::not_found(format!(
                "no backup of {db} at or before {from}"
            )));
        };
        let base = &metas[target_idx].key.base;
        let lineage: Vec<&BackupMeta> = metas[..=target_idx]
            .iter()
            .filter(|m| &m.key.base == base)
            .collect();

        let mut chain: Vec<BackupMeta> = Vec::with_capacity(lineage.len());
        let mut idx = lineage.len() - 1;
        loop {
            let cur = lineage[idx];
            chain.push(cur.clone());
            if cur.backup_type == BackupType::Full {
                break;
            }
            let broken = |reason: String, mut collected: Vec<BackupMeta>| {
                collected.reverse();
                Error::ChainBroken {
                    db: db.to_string(),
                    at: keys::storage_key(&cur.key),
                    reason,
                    collected,
                }
            };
            if idx == 0 {
                return Err(broken(
                    "lineage has no full backup before it".to_string(),
                    chain,
                ));
            }
            let prev = lineage[idx - 1];
            match (prev.to_lsn.as_deref(), cur.from_lsn.as_deref()) {
                (Some(to), Some(from_lsn)) if to == from_lsn => {}
                (to, from_lsn) => {
                    return Err(broken(
                        format!(
                            "previous backup ends at {} but this one starts at {}",
                            to.unwrap_or("<unset>"),
                            from_lsn.unwrap_or("<unset>")
                        ),
                        chain,
                    ));
                }
            }
            idx -= 1;
        }
        chain.reverse();
        debug!("Restore chain of {} at {} has {} backups", db, from, chain.len());
        Ok(chain)
    }

    /// Base time point of the `k`-th most recent lineage (1 = newest)
    pub async fn get_k_past_backup_key(&self, db: &DatabaseId, k: usize) -> Result<TimePoint> {
        if k == 0 {
            return Err(Error::validation("k must be at least 1"));
        }
        let bases: BTreeSet<TimePoint> = self
            .physical_backups(db)
            .await?
            .into_iter()
            .map(|m| m.key.base)
            .collect();
        let count = bases.len();
        bases.into_iter().rev().nth(k - 1).ok_or_else(|| {
            Error::not_found(format!("{db} has {count} lineages, fewer than {k}"))
        })
    }
}
