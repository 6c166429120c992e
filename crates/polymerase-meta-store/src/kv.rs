//! Abstract consistent key-value store
//!
//! Every catalog access goes through [`KvStore`]. Prefix scans return
//! entries ordered by key; callers that need temporal order sort the
//! decoded records themselves.

use crate::lock::{LockGuard, LockTable};
use async_trait::async_trait;
use parking_lot::RwLock;
use polymerase_common::Result;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

/// Key-value pair returned by prefix scans
pub type KvEntry = (Vec<u8>, Vec<u8>);

/// Consistent KV store with prefix scans and scoped locks
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Read every entry whose key starts with `prefix`
    async fn get_prefix(&self, prefix: &[u8]) -> Result<Vec<KvEntry>>;

    /// Write a single key
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a single key; returns whether it existed
    async fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Delete every key starting with `prefix`; returns the number removed
    async fn delete_prefix(&self, prefix: &[u8]) -> Result<usize>;

    /// Acquire the named lock, released when the guard drops
    async fn lock(&self, key: &[u8]) -> Result<LockGuard>;
}

/// Upper bound of the key range covered by `prefix`
pub(crate) fn prefix_end(prefix: &[u8]) -> Bound<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Bound::Excluded(end);
        }
    }
    Bound::Unbounded
}

/// In-memory [`KvStore`]
pub struct MemoryKv {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    locks: LockTable,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(10))
    }

    #[must_use]
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            locks: LockTable::new(timeout),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &[u8]) -> Result<Vec<KvEntry>> {
        let data = self.data.read();
        let range = (Bound::Included(prefix.to_vec()), prefix_end(prefix));
        Ok(data
            .range(range)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut data = self.data.write();
        let doomed: Vec<Vec<u8>> = data
            .range((Bound::Included(prefix.to_vec()), prefix_end(prefix)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            data.remove(key);
        }
        Ok(doomed.len())
    }

    async fn lock(&self, key: &[u8]) -> Result<LockGuard> {
        self.locks.acquire(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab"), Bound::Excluded(b"ac".to_vec()));
        assert_eq!(prefix_end(&[b'a', 0xff]), Bound::Excluded(b"b".to_vec()));
        assert_eq!(prefix_end(&[0xff, 0xff]), Bound::Unbounded);
        assert_eq!(prefix_end(b""), Bound::Unbounded);
    }

    #[tokio::test]
    async fn test_memory_kv_prefix_scan() {
        let kv = MemoryKv::new();
        kv.put(b"meta-node-b", b"2").await.unwrap();
        kv.put(b"meta-node-a", b"1").await.unwrap();
        kv.put(b"meta-backup-x", b"3").await.unwrap();
        kv.put(b"meta-nodf", b"4").await.unwrap();

        let nodes = kv.get_prefix(b"meta-node-").await.unwrap();
        let keys: Vec<_> = nodes.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"meta-node-a"[..], &b"meta-node-b"[..]]);

        assert_eq!(kv.delete_prefix(b"meta-node-").await.unwrap(), 2);
        assert!(kv.get(b"meta-node-a").await.unwrap().is_none());
        assert_eq!(kv.get(b"meta-nodf").await.unwrap(), Some(b"4".to_vec()));
        assert!(kv.delete(b"meta-backup-x").await.unwrap());
        assert!(!kv.delete(b"meta-backup-x").await.unwrap());
        assert_eq!(kv.len(), 1);
    }
}
