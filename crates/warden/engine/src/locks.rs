//! Keyed async locks
//!
//! One mutex per key, created on first use. An entry is dropped again when
//! the last guard for it goes away, so the map only holds keys that are
//! currently locked or waited on.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug)]
pub(crate) struct KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    /// Wait for exclusive access to `key`
    pub(crate) async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    /// Keys with a live lock entry
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Held lock on one key. Dropping it prunes the entry when nobody else
/// holds or waits on the same key.
pub(crate) struct KeyedGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyedGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // Cloning an entry takes the shard lock, so a count of one here means
        // no other task can be holding or about to wait on this mutex
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_pruned_after_release() {
        let locks = KeyedLocks::default();
        {
            let _guard = locks.lock("t1").await;
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let locks = Arc::new(KeyedLocks::default());
        let guard = locks.lock("t1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("t1").await;
                locks.len()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        // The waiter still holds its clone when the first guard is dropped
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::default();
        let _a = locks.lock("t1").await;
        let _b = locks.lock("t2").await;
        assert_eq!(locks.len(), 2);
    }
}
