// Store module: typed access over an ordered key/value backend

pub mod backend;

pub use backend::{BatchOp, MemoryStorage, SledStorage, StorageBackend};

use crate::{PttError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Key prefixes, each followed by the entity id.
pub mod prefix {
    pub const MASTER_OPLOG: &[u8] = b".malg";
    pub const MASTER_IDX: &[u8] = b".maig";
    pub const MASTER_MERKLE: &[u8] = b".mamk";
    pub const MASTER_OBJ: &[u8] = b".madb";

    pub const MEMBER_OPLOG: &[u8] = b".melg";
    pub const MEMBER_IDX: &[u8] = b".meig";
    pub const MEMBER_MERKLE: &[u8] = b".memk";
    pub const MEMBER_OBJ: &[u8] = b".medb";

    pub const OP_KEY_OPLOG: &[u8] = b".oklg";
    pub const OP_KEY_IDX: &[u8] = b".okig";
    pub const OP_KEY: &[u8] = b".okdb";

    pub const PTT_OPLOG: &[u8] = b".ptlg";
    pub const PTT_IDX: &[u8] = b".ptig";

    pub const NEWEST_MASTER_LOG_ID: &[u8] = b".nmld";
    pub const MASTER_LOG0_HASH: &[u8] = b".mlh0";

    pub const MERKLE_GENERATE_TIME: &[u8] = b".mtgt";
    pub const MERKLE_SYNC_TIME: &[u8] = b".mtst";
    pub const MERKLE_FAIL_SYNC_TIME: &[u8] = b".mtft";
    pub const MERKLE_TO_UPDATE: &[u8] = b".mtuh";

    pub const ENTITY: &[u8] = b".endb";
    pub const BLOCK: &[u8] = b".bkdb";
    pub const MY_INFO: &[u8] = b".myif";
    pub const USER_NODE: &[u8] = b".usnd";
}

/// Concatenates key parts.
pub fn db_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

/// Replaces the last byte of a 5-byte prefix, giving the sibling
/// namespaces that hold pending and internal-pending oplogs.
pub fn sibling_prefix(prefix: &[u8], last: u8) -> Vec<u8> {
    let mut p = prefix.to_vec();
    if let Some(b) = p.last_mut() {
        *b = last;
    }
    p
}

#[derive(Clone)]
pub struct Db {
    backend: Arc<dyn StorageBackend>,
}

impl Db {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn sled(path: &str) -> Result<Self> {
        let backend = SledStorage::new(path).map_err(PttError::Storage)?;
        Ok(Self::new(Arc::new(backend)))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.backend.put(key, value).map_err(PttError::Storage)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.backend.get(key).map_err(PttError::Storage)
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.backend.remove(key).map_err(PttError::Storage)
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.backend.scan_prefix(prefix).map_err(PttError::Storage)
    }

    pub fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.backend.scan_range(start, end).map_err(PttError::Storage)
    }

    pub fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        self.backend.count_prefix(prefix).map_err(PttError::Storage)
    }

    pub fn apply_batch(&self, batch: Vec<BatchOp>) -> Result<()> {
        self.backend.apply_batch(batch).map_err(PttError::Storage)
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush().map_err(PttError::Storage)
    }

    pub fn put_json<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, &bytes)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn scan_json<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>> {
        self.scan_prefix(prefix)?
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).map_err(PttError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        name: String,
    }

    #[test]
    fn test_json_helpers() {
        let db = Db::memory();
        let key = db_key(&[prefix::ENTITY, b"e1"]);
        db.put_json(&key, &Record { name: "board".into() }).unwrap();
        assert_eq!(
            db.get_json::<Record>(&key).unwrap(),
            Some(Record { name: "board".into() })
        );
        assert_eq!(db.scan_json::<Record>(prefix::ENTITY).unwrap().len(), 1);
        assert!(db.get_json::<Record>(b"missing").unwrap().is_none());
    }

    #[test]
    fn test_sibling_prefix() {
        assert_eq!(sibling_prefix(prefix::MASTER_OPLOG, b'm'), b".malm".to_vec());
        assert_eq!(sibling_prefix(prefix::MEMBER_OPLOG, b'i'), b".meli".to_vec());
    }
}
