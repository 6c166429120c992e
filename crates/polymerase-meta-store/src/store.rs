//! Persistent [`KvStore`] backed by redb.
//!
//! All writes are synchronous (write txn + commit). Locks are process-local:
//! a redb file is only ever opened by one server.

use crate::kv::{KvEntry, KvStore};
use crate::lock::{LockGuard, LockTable};
use crate::tables;
use async_trait::async_trait;
use polymerase_common::Error;
use redb::{Database, ReadableTable};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::Io(e) => Self::Io(e),
            MetaStoreError::Bincode(e) => Self::Deserialization(e.to_string()),
            other => Self::store(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Persistent KV store backed by redb.
pub struct RedbKv {
    db: Database,
    locks: LockTable,
}

impl RedbKv {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::KV)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            locks: LockTable::new(lock_timeout),
        })
    }

    fn get_bytes(&self, key: &[u8]) -> MetaStoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::KV)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> MetaStoreResult<Vec<KvEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::KV)?;
        let mut result = Vec::new();
        for entry in table.range::<&[u8]>(prefix..)? {
            let (k, v) = entry?;
            let k = k.value();
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.to_vec(), v.value().to_vec()));
        }
        Ok(result)
    }

    fn put_bytes(&self, key: &[u8], value: &[u8]) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::KV)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_key(&self, key: &[u8]) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(tables::KV)?;
            table.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn delete_keys_with_prefix(&self, prefix: &[u8]) -> MetaStoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(tables::KV)?;
            // Collect keys first, the range borrows the table
            let mut keys = Vec::new();
            for entry in table.range::<&[u8]>(prefix..)? {
                let (k, _) = entry?;
                let k = k.value();
                if !k.starts_with(prefix) {
                    break;
                }
                keys.push(k.to_vec());
            }
            for key in &keys {
                table.remove(key.as_slice())?;
            }
            keys.len()
        };
        write_txn.commit()?;
        debug!(
            "Deleted {} keys with prefix {}",
            removed,
            String::from_utf8_lossy(prefix)
        );
        Ok(removed)
    }
}

#[async_trait]
impl KvStore for RedbKv {
    async fn get(&self, key: &[u8]) -> polymerase_common::Result<Option<Vec<u8>>> {
        Ok(self.get_bytes(key)?)
    }

    async fn get_prefix(&self, prefix: &[u8]) -> polymerase_common::Result<Vec<KvEntry>> {
        Ok(self.scan_prefix(prefix)?)
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> polymerase_common::Result<()> {
        Ok(self.put_bytes(key, value)?)
    }

    async fn delete(&self, key: &[u8]) -> polymerase_common::Result<bool> {
        Ok(self.delete_key(key)?)
    }

    async fn delete_prefix(&self, prefix: &[u8]) -> polymerase_common::Result<usize> {
        Ok(self.delete_keys_with_prefix(prefix)?)
    }

    async fn lock(&self, key: &[u8]) -> polymerase_common::Result<LockGuard> {
        self.locks.acquire(key).await
    }
}
