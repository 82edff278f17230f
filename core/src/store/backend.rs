// Storage abstraction: ordered key/value backends

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
}

/// Ordered key/value store. Every scan returns entries in ascending key
/// order; oplog listings and the Merkle index depend on it.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String>;
    fn remove(&self, key: &[u8]) -> Result<(), String>;
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String>;
    /// Entries with `start <= key < end`.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String>;
    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, String>;
    fn apply_batch(&self, batch: Vec<BatchOp>) -> Result<(), String>;
    fn flush(&self) -> Result<(), String>;
}

/// In-memory storage for tests and ephemeral nodes
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        let results = self
            .data
            .read()
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(results)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        if start >= end {
            return Ok(Vec::new());
        }
        let results = self
            .data
            .read()
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(results)
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, String> {
        let count = self
            .data
            .read()
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .count();
        Ok(count)
    }

    fn apply_batch(&self, batch: Vec<BatchOp>) -> Result<(), String> {
        let mut data = self.data.write();
        for op in batch {
            match op {
                BatchOp::Put(k, v) => {
                    data.insert(k, v);
                }
                BatchOp::Remove(k) => {
                    data.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn new(path: &str) -> std::result::Result<Self, String> {
        let db = sled::open(path).map_err(|e| e.to_string())?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.db.insert(key, value).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        let value = self.db.get(key).map_err(|e| e.to_string())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.db.remove(key).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| e.to_string())?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        if start >= end {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for item in self.db.range(start..end) {
            let (k, v) = item.map_err(|e| e.to_string())?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, String> {
        Ok(self.db.scan_prefix(prefix).count())
    }

    fn apply_batch(&self, batch: Vec<BatchOp>) -> Result<(), String> {
        let mut sled_batch = sled::Batch::default();
        for op in batch {
            match op {
                BatchOp::Put(k, v) => sled_batch.insert(k, v),
                BatchOp::Remove(k) => sled_batch.remove(k),
            }
        }
        self.db.apply_batch(sled_batch).map_err(|e| e.to_string())
    }

    fn flush(&self) -> Result<(), String> {
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn StorageBackend) {
        store.put(b"a/2", b"two").unwrap();
        store.put(b"a/1", b"one").unwrap();
        store.put(b"b/1", b"other").unwrap();

        let scanned: Vec<_> = store
            .scan_prefix(b"a/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(scanned, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
        assert_eq!(store.count_prefix(b"a/").unwrap(), 2);

        let ranged = store.scan_range(b"a/2", b"b/2").unwrap();
        assert_eq!(ranged.len(), 2);
        assert!(store.scan_range(b"z", b"a").unwrap().is_empty());

        store
            .apply_batch(vec![
                BatchOp::Remove(b"a/1".to_vec()),
                BatchOp::Put(b"a/3".to_vec(), b"three".to_vec()),
            ])
            .unwrap();
        assert!(store.get(b"a/1").unwrap().is_none());
        assert_eq!(store.get(b"a/3").unwrap(), Some(b"three".to_vec()));
        store.flush().unwrap();
    }

    #[test]
    fn test_memory_storage_is_ordered() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn test_sled_storage_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStorage::new(dir.path().join("db").to_str().unwrap()).unwrap();
        exercise(&store);
    }
}
