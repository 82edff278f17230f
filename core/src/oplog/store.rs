// Oplog persistence per (entity, family)
//
// key    = status_prefix || entity || update_ts(12) || log_id(40)
// idx    = idx_prefix || entity || log_id  ->  key
//
// Alive logs live under the family prefix, pending and internal-pending
// logs under sibling prefixes ending in 'm' and 'i'. Alive logs also carry
// a Merkle leaf written in the same batch.

use super::base::BaseOplog;
use super::family::OplogFamily;
use crate::merkle::Merkle;
use crate::store::{db_key, sibling_prefix, BatchOp, Db};
use crate::types::{LockGuard, LockMap, PttID, Status, Timestamp, SIZE_PTT_ID, SIZE_TIMESTAMP};
use crate::{PttError, Result};
use tracing::debug;

pub struct OplogStore {
    db: Db,
    family: OplogFamily,
    entity_id: PttID,
    alive_prefix: Vec<u8>,
    pending_prefix: Vec<u8>,
    internal_prefix: Vec<u8>,
    idx_prefix: Vec<u8>,
    locks: LockMap,
    merkle: Option<Merkle>,
}

impl OplogStore {
    pub fn new(db: Db, family: OplogFamily, entity_id: PttID, locks: LockMap, expire_generate_seconds: i64) -> Self {
        let spec = family.spec();
        let merkle = spec
            .merkle_prefix
            .map(|p| Merkle::new(db.clone(), spec.name, p, entity_id, expire_generate_seconds));
        Self {
            alive_prefix: db_key(&[spec.prefix, entity_id.as_bytes()]),
            pending_prefix: db_key(&[&sibling_prefix(spec.prefix, b'm'), entity_id.as_bytes()]),
            internal_prefix: db_key(&[&sibling_prefix(spec.prefix, b'i'), entity_id.as_bytes()]),
            idx_prefix: db_key(&[spec.idx_prefix, entity_id.as_bytes()]),
            db,
            family,
            entity_id,
            locks,
            merkle,
        }
    }

    pub fn family(&self) -> OplogFamily {
        self.family
    }

    pub fn entity_id(&self) -> &PttID {
        &self.entity_id
    }

    pub fn merkle(&self) -> Option<&Merkle> {
        self.merkle.as_ref()
    }

    pub async fn lock(&self, id: &PttID) -> Result<LockGuard> {
        self.locks.lock(id.as_bytes()).await
    }

    fn status_prefix(&self, status: Status) -> Result<&[u8]> {
        match status {
            Status::Alive => Ok(&self.alive_prefix),
            Status::Pending => Ok(&self.pending_prefix),
            Status::InternalPending => Ok(&self.internal_prefix),
            _ => Err(PttError::InvalidStatus),
        }
    }

    fn status_of_key(&self, key: &[u8]) -> Status {
        if key.starts_with(&self.alive_prefix) {
            Status::Alive
        } else if key.starts_with(&self.pending_prefix) {
            Status::Pending
        } else if key.starts_with(&self.internal_prefix) {
            Status::InternalPending
        } else {
            Status::Invalid
        }
    }

    pub fn storage_key(&self, log: &BaseOplog) -> Result<Vec<u8>> {
        let prefix = self.status_prefix(log.status())?;
        Ok(db_key(&[prefix, &log.update_ts.marshal(), log.id.as_bytes()]))
    }

    fn idx_key(&self, id: &PttID) -> Vec<u8> {
        db_key(&[&self.idx_prefix, id.as_bytes()])
    }

    /// Writes `log` under the key its status selects. Status never moves
    /// backwards.
    pub fn save(&self, log: &BaseOplog) -> Result<()> {
        let key = self.storage_key(log)?;
        let idx_key = self.idx_key(&log.id);
        let mut batch = Vec::new();

        if let Some(old_key) = self.db.get(&idx_key)? {
            let old_status = self.status_of_key(&old_key);
            if log.status() < old_status {
                return Err(PttError::InvalidStatus);
            }
            if old_key != key {
                batch.push(BatchOp::Remove(old_key.clone()));
                if old_status == Status::Alive {
                    self.remove_leaf(&old_key, &mut batch)?;
                }
            }
        }

        batch.push(BatchOp::Put(key.clone(), serde_json::to_vec(log)?));
        batch.push(BatchOp::Put(idx_key, key.clone()));
        if log.status() == Status::Alive {
            if let Some(merkle) = &self.merkle {
                let (leaf_key, node) = merkle.leaf(log, &key);
                batch.push(BatchOp::Put(leaf_key, node.marshal()));
                batch.push(merkle.to_update_op(&log.update_ts, &log.id));
            }
        }
        self.db.apply_batch(batch)?;
        debug!(
            family = self.family.name(),
            log_id = %log.id,
            status = ?log.status(),
            "save oplog"
        );
        Ok(())
    }

    fn remove_leaf(&self, old_key: &[u8], batch: &mut Vec<BatchOp>) -> Result<()> {
        let Some(merkle) = &self.merkle else {
            return Ok(());
        };
        let (ts, id) = self.parse_key(old_key)?;
        batch.push(BatchOp::Remove(merkle.leaf_key(&ts, &id)));
        batch.push(merkle.to_update_op(&ts, &id));
        Ok(())
    }

    fn parse_key(&self, key: &[u8]) -> Result<(Timestamp, PttID)> {
        if key.len() < SIZE_TIMESTAMP + SIZE_PTT_ID {
            return Err(PttError::InvalidData);
        }
        let id_start = key.len() - SIZE_PTT_ID;
        let ts = Timestamp::unmarshal(&key[id_start - SIZE_TIMESTAMP..id_start])?;
        let id = PttID::from_bytes(&key[id_start..])?;
        Ok((ts, id))
    }

    pub fn get(&self, id: &PttID) -> Result<Option<BaseOplog>> {
        let Some(key) = self.db.get(&self.idx_key(id))? else {
            return Ok(None);
        };
        self.db.get_json(&key)
    }

    /// Drops a log that never made it to alive.
    pub fn remove(&self, id: &PttID) -> Result<()> {
        let idx_key = self.idx_key(id);
        let Some(key) = self.db.get(&idx_key)? else {
            return Ok(());
        };
        let mut batch = vec![BatchOp::Remove(key.clone()), BatchOp::Remove(idx_key)];
        if self.status_of_key(&key) == Status::Alive {
            self.remove_leaf(&key, &mut batch)?;
        }
        self.db.apply_batch(batch)
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<BaseOplog>> {
        self.db.scan_json(prefix)
    }

    /// Alive logs with `start <= update_ts < end`, ordered by `(update_ts, id)`.
    pub fn alive_range(&self, start: &Timestamp, end: &Timestamp) -> Result<Vec<BaseOplog>> {
        let start_key = db_key(&[&self.alive_prefix, &start.marshal()]);
        let end_key = db_key(&[&self.alive_prefix, &end.marshal()]);
        self.db
            .scan_range(&start_key, &end_key)?
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).map_err(PttError::from))
            .collect()
    }

    pub fn alive_list(&self) -> Result<Vec<BaseOplog>> {
        self.scan(&self.alive_prefix)
    }

    /// Pending and internal-pending logs.
    pub fn pending_list(&self) -> Result<Vec<BaseOplog>> {
        let mut logs = self.scan(&self.pending_prefix)?;
        logs.extend(self.scan(&self.internal_prefix)?);
        Ok(logs)
    }

    pub fn count_alive(&self) -> Result<usize> {
        self.db.count_prefix(&self.alive_prefix)
    }

    /// Loads alive logs by storage key. Keys outside this entity's alive
    /// namespace are refused.
    pub fn get_by_keys(&self, keys: &[Vec<u8>]) -> Result<Vec<BaseOplog>> {
        let mut logs = Vec::with_capacity(keys.len());
        for key in keys {
            if !key.starts_with(&self.alive_prefix) || key.len() != self.alive_prefix.len() + SIZE_TIMESTAMP + SIZE_PTT_ID {
                return Err(PttError::InvalidData);
            }
            if let Some(log) = self.db.get_json::<BaseOplog>(key)? {
                logs.push(log);
            }
        }
        Ok(logs)
    }

    pub fn alive_prefix(&self) -> &[u8] {
        &self.alive_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_signing_key, pubkey_to_address};
    use crate::merkle::MerkleLevel;
    use std::time::Duration;

    fn new_store(db: &Db, family: OplogFamily) -> OplogStore {
        OplogStore::new(
            db.clone(),
            family,
            PttID::random(),
            LockMap::new(Duration::from_millis(1), 5),
            450,
        )
    }

    fn new_log() -> (BaseOplog, ed25519_dalek::SigningKey, PttID) {
        let key = generate_signing_key();
        let id = PttID::from_pubkey_address(&pubkey_to_address(key.verifying_key().as_bytes()));
        let mut log = BaseOplog::new(OplogFamily::Master, id, id, 1, Vec::new(), None, Timestamp::now());
        log.sign(&key, None).unwrap();
        (log, key, id)
    }

    #[test]
    fn test_status_moves_key_and_leaf() {
        let db = Db::memory();
        let store = new_store(&db, OplogFamily::Master);
        let (mut log, key, id) = new_log();

        log.master_sign(id, &key, None, Timestamp::now(), 300).unwrap();
        store.save(&log).unwrap();
        assert_eq!(store.pending_list().unwrap().len(), 1);
        assert_eq!(store.count_alive().unwrap(), 0);

        log.set_master_log_id(log.id, 1);
        store.save(&log).unwrap();
        assert!(store.pending_list().unwrap().is_empty());
        assert_eq!(store.alive_list().unwrap(), vec![log.clone()]);
        assert_eq!(store.get(&log.id).unwrap(), Some(log.clone()));

        let merkle = store.merkle().unwrap();
        let (start, _) = log.update_ts.to_hr_timestamp();
        let leaves = merkle
            .get_nodes(crate::merkle::MerkleLevel::Now, &start, &Timestamp::MAX)
            .unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].key, store.storage_key(&log).unwrap());
    }

    #[test]
    fn test_marked_hour_rebuilt_after_restart() {
        let db = Db::memory();
        let entity = PttID::random();
        let open = || {
            OplogStore::new(
                db.clone(),
                OplogFamily::Master,
                entity,
                LockMap::new(Duration::from_millis(1), 5),
                450,
            )
        };
        let alive_at = |ts: Timestamp| {
            let (mut log, _, _) = new_log();
            log.update_ts = ts;
            log.set_master_log_id(log.id, 1);
            log
        };
        let first_hour = Timestamp::now().to_hr_timestamp().0.add_secs(-3 * 3600);
        let next_hour = first_hour.add_secs(3600);

        let store = open();
        store.save(&alive_at(first_hour.add_secs(10))).unwrap();
        store.merkle().unwrap().generate(&Timestamp::now()).unwrap();
        // the process stops before the generator sees this leaf
        store.save(&alive_at(next_hour.add_secs(10))).unwrap();
        drop(store);

        let store = open();
        let merkle = store.merkle().unwrap();
        merkle.generate(&Timestamp::now()).unwrap();
        assert!(merkle.get_node(MerkleLevel::Hr, &first_hour).unwrap().is_some());
        let hr = merkle
            .get_node(MerkleLevel::Hr, &next_hour)
            .unwrap()
            .expect("hour lost across restart");
        assert_eq!(hr.n_children, 1);
        let (day, _) = next_hour.to_day_timestamp();
        assert!(merkle.get_node(MerkleLevel::Day, &day).unwrap().is_some());
    }

    #[test]
    fn test_status_regression_refused() {
        let db = Db::memory();
        let store = new_store(&db, OplogFamily::Member);
        let (mut log, key, id) = new_log();
        log.family = OplogFamily::Member;
        let pending = {
            let mut l = log.clone();
            l.master_sign(id, &key, None, Timestamp::now(), 300).unwrap();
            l
        };
        log.set_master_log_id(PttID::random(), 1);
        store.save(&log).unwrap();
        assert_eq!(store.save(&pending), Err(PttError::InvalidStatus));
    }

    #[test]
    fn test_get_by_keys_refuses_foreign_keys() {
        let db = Db::memory();
        let store = new_store(&db, OplogFamily::OpKey);
        let (mut log, _, _) = new_log();
        log.set_master_log_id(log.id, 1);
        store.save(&log).unwrap();

        let key = store.storage_key(&log).unwrap();
        assert_eq!(store.get_by_keys(&[key]).unwrap().len(), 1);
        assert_eq!(
            store.get_by_keys(&[b".okdbxxxx".to_vec()]),
            Err(PttError::InvalidData)
        );
    }

    #[test]
    fn test_remove_and_range() {
        let db = Db::memory();
        let store = new_store(&db, OplogFamily::OpKey);
        let (log, _, _) = new_log();
        store.save(&log).unwrap();
        store.remove(&log.id).unwrap();
        assert!(store.get(&log.id).unwrap().is_none());

        let (mut alive, _, _) = new_log();
        alive.set_master_log_id(alive.id, 1);
        store.save(&alive).unwrap();
        let ts = alive.update_ts;
        assert_eq!(store.alive_range(&ts, &ts.add_secs(1)).unwrap().len(), 1);
        assert!(store.alive_range(&ts.add_secs(1), &ts.add_secs(2)).unwrap().is_empty());
    }
}
