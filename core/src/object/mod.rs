// Synced objects: records whose lifecycle is driven by oplogs

pub mod person;

pub use person::Person;

use crate::crypto::KeyInfo;
use crate::store::{db_key, prefix, Db};
use crate::types::{LockGuard, LockMap, PttID, Status, Timestamp};
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// A delete-like oplog that has not reached alive yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    #[serde(rename = "l")]
    pub log_id: PttID,
    #[serde(rename = "S")]
    pub status: Status,
    #[serde(rename = "UT")]
    pub update_ts: Timestamp,
    #[serde(rename = "T", default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_id: Option<PttID>,
}

pub trait SyncObject: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn id(&self) -> &PttID;
    fn log_id(&self) -> &PttID;
    fn status(&self) -> Status;
    fn set_status(&mut self, status: Status);
    fn set_update_ts(&mut self, ts: Timestamp);
    fn sync_info(&self) -> Option<&SyncInfo>;
    fn set_sync_info(&mut self, info: Option<SyncInfo>);

    /// Objects carrying a block body have it removed with the object.
    fn has_block(&self) -> bool {
        false
    }
}

impl SyncObject for KeyInfo {
    fn id(&self) -> &PttID {
        &self.id
    }

    fn log_id(&self) -> &PttID {
        self.log_id.as_ref().unwrap_or(&self.id)
    }

    fn status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    fn set_update_ts(&mut self, ts: Timestamp) {
        self.update_ts = ts;
    }

    fn sync_info(&self) -> Option<&SyncInfo> {
        None
    }

    fn set_sync_info(&mut self, _info: Option<SyncInfo>) {}
}

/// JSON object table under `prefix || entity || object_id`.
pub struct ObjectStore<T> {
    db: Db,
    prefix: Vec<u8>,
    block_prefix: Vec<u8>,
    locks: LockMap,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SyncObject> ObjectStore<T> {
    pub fn new(db: Db, obj_prefix: &[u8], entity_id: &PttID, locks: LockMap) -> Self {
        Self {
            prefix: db_key(&[obj_prefix, entity_id.as_bytes()]),
            block_prefix: db_key(&[prefix::BLOCK, entity_id.as_bytes()]),
            db,
            locks,
            _marker: PhantomData,
        }
    }

    fn key(&self, id: &PttID) -> Vec<u8> {
        db_key(&[&self.prefix, id.as_bytes()])
    }

    pub async fn lock(&self, id: &PttID) -> Result<LockGuard> {
        self.locks.lock(&self.key(id)).await
    }

    pub fn get(&self, id: &PttID) -> Result<Option<T>> {
        self.db.get_json(&self.key(id))
    }

    pub fn save(&self, obj: &T) -> Result<()> {
        self.db.put_json(&self.key(obj.id()), obj)
    }

    pub fn remove(&self, id: &PttID) -> Result<()> {
        self.db.remove(&self.key(id))
    }

    pub fn list(&self) -> Result<Vec<T>> {
        self.db.scan_json(&self.prefix)
    }

    pub fn list_by_status(&self, status: Status) -> Result<Vec<T>> {
        Ok(self.list()?.into_iter().filter(|o| o.status() == status).collect())
    }

    /// Writes the settled state of an object whose oplog became alive.
    /// A deleted object loses its blocks.
    pub fn finalize(&self, obj: &mut T, status: Status, ts: Timestamp) -> Result<()> {
        obj.set_status(status);
        obj.set_sync_info(None);
        obj.set_update_ts(ts);
        self.save(obj)?;
        if status == Status::Deleted && obj.has_block() {
            self.remove_blocks(obj.id())?;
        }
        Ok(())
    }

    /// Drops the in-flight record of `log_id`, if that is the one held.
    pub fn clear_sync_info(&self, id: &PttID, log_id: &PttID) -> Result<bool> {
        let Some(mut obj) = self.get(id)? else {
            return Ok(false);
        };
        if obj.sync_info().map(|s| &s.log_id) != Some(log_id) {
            return Ok(false);
        }
        obj.set_sync_info(None);
        self.save(&obj)?;
        Ok(true)
    }

    pub fn put_block(&self, id: &PttID, idx: u32, block: &[u8]) -> Result<()> {
        self.db.put(&db_key(&[&self.block_prefix, id.as_bytes(), &idx.to_be_bytes()]), block)
    }

    pub fn blocks(&self, id: &PttID) -> Result<Vec<Vec<u8>>> {
        let prefix = db_key(&[&self.block_prefix, id.as_bytes()]);
        Ok(self.db.scan_prefix(&prefix)?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn remove_blocks(&self, id: &PttID) -> Result<()> {
        let prefix = db_key(&[&self.block_prefix, id.as_bytes()]);
        let batch = self
            .db
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(k, _)| crate::store::BatchOp::Remove(k))
            .collect();
        self.db.apply_batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_object_store_roundtrip_and_blocks() {
        let db = Db::memory();
        let entity = PttID::random();
        let store: ObjectStore<Person> = ObjectStore::new(
            db.clone(),
            prefix::MEMBER_OBJ,
            &entity,
            LockMap::new(Duration::from_millis(1), 3),
        );
        let person = Person::new(PttID::random(), entity, PttID::random(), PttID::random(), Status::Alive);
        store.save(&person).unwrap();
        assert_eq!(store.get(&person.id).unwrap(), Some(person.clone()));
        assert_eq!(store.list_by_status(Status::Alive).unwrap().len(), 1);
        assert!(store.list_by_status(Status::Deleted).unwrap().is_empty());

        store.put_block(&person.id, 0, b"body").unwrap();
        assert_eq!(store.blocks(&person.id).unwrap(), vec![b"body".to_vec()]);
        store.remove_blocks(&person.id).unwrap();
        assert!(store.blocks(&person.id).unwrap().is_empty());

        store.remove(&person.id).unwrap();
        assert!(store.get(&person.id).unwrap().is_none());
    }

    #[test]
    fn test_finalize_settles_pending_object() {
        let db = Db::memory();
        let entity = PttID::random();
        let store: ObjectStore<Person> = ObjectStore::new(
            db,
            prefix::MEMBER_OBJ,
            &entity,
            LockMap::new(Duration::from_millis(1), 3),
        );
        let mut person = Person::new(PttID::random(), entity, PttID::random(), PttID::random(), Status::Alive);
        let log_id = PttID::random();
        person.sync_info = Some(SyncInfo {
            log_id,
            status: Status::PendingDeleted,
            update_ts: Timestamp::now(),
            transfer_to_id: None,
        });
        store.save(&person).unwrap();

        assert!(!store.clear_sync_info(&person.id, &PttID::random()).unwrap());
        assert!(store.get(&person.id).unwrap().unwrap().sync_info.is_some());

        let ts = Timestamp::new(1_700_000_000, 0);
        store.finalize(&mut person, Status::Deleted, ts).unwrap();
        let saved = store.get(&person.id).unwrap().unwrap();
        assert_eq!(saved.status, Status::Deleted);
        assert_eq!(saved.update_ts, ts);
        assert!(saved.sync_info.is_none());
        assert!(!store.clear_sync_info(&person.id, &log_id).unwrap());
    }
}
