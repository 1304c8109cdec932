//! Keyed async mutexes for serializing work on shared resources.
//!
//! One small map from a string key to a lock: `(env, branch)` for worktree
//! reconciliation, the tmux session name for spawn actions.
//! Entries are pruned when the last guard for a key is released, so the map
//! stays proportional to in-flight work rather than to history.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct KeyedMutex {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Guard for one key. Dropping it releases the lock and prunes the map
/// entry if no other task holds or awaits the same key.
pub struct KeyedGuard {
    key: String,
    lock: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
    owner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // Map entry + our clone + the guard's internal clone: strong count 3
        // means nobody else is waiting on this key.
        self.owner
            .remove_if(&self.key, |_, v| Arc::ptr_eq(v, &self.lock) && Arc::strong_count(v) <= 3);
    }
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting if another task holds it.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.clone().lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            lock,
            _guard: guard,
            owner: self.locks.clone(),
        }
    }

    /// Number of live entries (for tests and debugging).
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn serializes_same_key() {
        let locks = KeyedMutex::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("env-1/main").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedMutex::new();
        let a = locks.lock("env-1/main").await;
        // Must not deadlock: a different key is an independent lock.
        let b = locks.lock("env-1/feature").await;
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn entries_pruned_on_release() {
        let locks = KeyedMutex::new();
        {
            let _guard = locks.lock("env-9/main").await;
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0, "entry should be pruned after last release");
    }
}
