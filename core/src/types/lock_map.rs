// Per-key lock map with polling acquisition

use crate::{PttError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Serializes read-modify-write on objects and oplogs sharing an id.
/// Acquisition polls with a sleep and gives up with `Busy` after `n_iter`
/// attempts; the returned guard releases the key when dropped.
#[derive(Clone)]
pub struct LockMap {
    locks: Arc<Mutex<HashSet<Vec<u8>>>>,
    sleep: Duration,
    n_iter: u32,
}

impl LockMap {
    pub fn new(sleep: Duration, n_iter: u32) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashSet::new())),
            sleep,
            n_iter: n_iter.max(1),
        }
    }

    pub async fn lock(&self, key: &[u8]) -> Result<LockGuard> {
        for _ in 0..self.n_iter {
            if let Some(guard) = self.try_lock(key) {
                return Ok(guard);
            }
            tokio::time::sleep(self.sleep).await;
        }
        Err(PttError::Busy)
    }

    pub fn try_lock(&self, key: &[u8]) -> Option<LockGuard> {
        let acquired = self.locks.lock().insert(key.to_vec());
        acquired.then(|| LockGuard {
            locks: self.locks.clone(),
            key: key.to_vec(),
        })
    }

    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.locks.lock().contains(key)
    }
}

pub struct LockGuard {
    locks: Arc<Mutex<HashSet<Vec<u8>>>>,
    key: Vec<u8>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let map = LockMap::new(Duration::from_millis(1), 3);
        {
            let _guard = map.lock(b"a").await.unwrap();
            assert!(map.is_locked(b"a"));
            assert!(map.try_lock(b"a").is_none());
            assert!(map.try_lock(b"b").is_some());
        }
        assert!(!map.is_locked(b"a"));
    }

    #[tokio::test]
    async fn test_lock_gives_up_busy() {
        let map = LockMap::new(Duration::from_millis(1), 3);
        let _guard = map.lock(b"a").await.unwrap();
        assert_eq!(map.lock(b"a").await.err(), Some(PttError::Busy));
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let map = LockMap::new(Duration::from_millis(2), 100);
        let guard = map.lock(b"k").await.unwrap();
        let waiter = {
            let map = map.clone();
            tokio::spawn(async move { map.lock(b"k").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        assert!(waiter.await.unwrap().is_ok());
    }
}
