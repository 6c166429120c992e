//! Scoped named locks
//!
//! A lock is identified by an arbitrary byte key. Acquisition waits up to a
//! configured timeout and yields a [`LockGuard`] that releases the lock when
//! dropped, on every exit path.

use parking_lot::Mutex;
use polymerase_common::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Table of named async mutexes
pub struct LockTable {
    slots: Mutex<HashMap<Vec<u8>, Slot>>,
    timeout: Duration,
}

impl LockTable {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Acquire the lock named `key`, failing with [`Error::Lock`] on timeout
    pub async fn acquire(&self, key: &[u8]) -> Result<LockGuard> {
        let slot = {
            let mut slots = self.slots.lock();
            // Slots nobody holds or waits on can go
            slots.retain(|_, s| Arc::strong_count(s) > 1);
            Arc::clone(slots.entry(key.to_vec()).or_default())
        };

        match tokio::time::timeout(self.timeout, slot.lock_owned()).await {
            Ok(guard) => {
                debug!("Acquired lock {}", String::from_utf8_lossy(key));
                Ok(LockGuard {
                    key: key.to_vec(),
                    _guard: guard,
                })
            }
            Err(_) => Err(Error::lock(format!(
                "timed out after {:?} waiting for {}",
                self.timeout,
                String::from_utf8_lossy(key)
            ))),
        }
    }

    /// Number of lock names currently tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Held lock; released on drop
pub struct LockGuard {
    key: Vec<u8>,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &String::from_utf8_lossy(&self.key))
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!("Released lock {}", String::from_utf8_lossy(&self.key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_dropped() {
        let table = LockTable::new(Duration::from_millis(50));
        let guard = table.acquire(b"lock-a").await.unwrap();
        assert_eq!(guard.key(), b"lock-a");

        let err = table.acquire(b"lock-a").await.unwrap_err();
        assert!(err.is_retryable());

        // other names are independent
        let _other = table.acquire(b"lock-b").await.unwrap();

        drop(guard);
        assert!(table.acquire(b"lock-a").await.is_ok());
    }

    #[tokio::test]
    async fn test_released_slots_are_pruned() {
        let table = LockTable::default();
        for i in 0..10u8 {
            let _g = table.acquire(&[i]).await.unwrap();
        }
        let _g = table.acquire(b"last").await.unwrap();
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let table = Arc::new(LockTable::new(Duration::from_secs(5)));
        let guard = table.acquire(b"lineage").await.unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.acquire(b"lineage").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert!(waiter.await.unwrap().is_ok());
    }
}
