use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of exclusive in-process locks, one per key.
///
/// Holding the guard for a key excludes every other holder of the same key;
/// distinct keys never contend. Entries are kept for the life of the
/// registry (cards are never deleted, so the map is bounded by the store).
pub struct KeyedLocks<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

/// Waiting for a key's lock took longer than allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout {
    pub waited: Duration,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait up to `timeout` for exclusive access to `key`.
    ///
    /// Dropping the returned guard releases the key. Dropping the future
    /// while it waits gives up the place in the queue without acquiring.
    pub async fn acquire(
        &self,
        key: &K,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| LockTimeout { waited: timeout })
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
