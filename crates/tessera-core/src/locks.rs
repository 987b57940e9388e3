//! Per-key async mutual exclusion.
//!
//! Session-limit enforcement (list, evict, insert) runs under a per-user lock.
//! Entries are dropped from the map as soon as nobody holds or awaits them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap<K> = Mutex<HashMap<K, Arc<AsyncMutex<()>>>>;

pub struct KeyedLocks<K> {
    map: Arc<LockMap<K>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = lock_map(&self.map).entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            map: Arc::clone(&self.map),
            guard: Some(guard),
        }
    }

    /// Keys currently held or awaited.
    pub fn len(&self) -> usize {
        lock_map(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KeyedGuard<K: Eq + Hash> {
    key: K,
    map: Arc<LockMap<K>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = lock_map(&self.map);
        if map
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            map.remove(&self.key);
        }
    }
}

fn lock_map<K>(map: &LockMap<K>) -> MutexGuard<'_, HashMap<K, Arc<AsyncMutex<()>>>> {
    map.lock().unwrap_or_else(|poisoned| {
        tracing::error!(target: "tessera::locks", "keyed lock map was poisoned, recovering");
        poisoned.into_inner()
    })
}
