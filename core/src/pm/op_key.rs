// Op-keys: the rotating symmetric keys an entity's ops travel under
//
// A key is good for sending while younger than `expire - renew` and good
// for receiving while younger than `expire`. Masters create a new key every
// `renew / 2` seconds or on demand.

use super::message::{OpKeyIdsPayload, OpKeysPayload, SyncOp};
use super::{OpType, ProtocolManager};
use crate::config::ENTITY_NOT_ALIVE_SLEEP;
use crate::crypto::{verify_key_owner, KeyInfo};
use crate::oplog::{BaseOplog, OpKeyOp, OplogFamily};
use crate::types::{Address, NodeID, PttID, Status, Timestamp};
use crate::{PttError, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct OpKeyRing {
    keys: HashMap<Address, KeyInfo>,
    oldest: Option<Address>,
}

fn send_valid(key: &KeyInfo, now: &Timestamp, renew: i64, expire: i64) -> bool {
    key.update_ts > now.add_secs(-(expire - renew))
}

fn receive_valid(key: &KeyInfo, now: &Timestamp, expire: i64) -> bool {
    key.update_ts > now.add_secs(-expire)
}

impl OpKeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: KeyInfo) {
        self.keys.insert(key.hash, key);
    }

    pub fn remove(&mut self, hash: &Address) -> Option<KeyInfo> {
        if self.oldest.as_ref() == Some(hash) {
            self.oldest = None;
        }
        self.keys.remove(hash)
    }

    pub fn get(&self, hash: &Address) -> Option<&KeyInfo> {
        self.keys.get(hash)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn hashes(&self) -> Vec<Address> {
        let mut hashes: Vec<Address> = self.keys.keys().copied().collect();
        hashes.sort();
        hashes
    }

    pub fn newest(&self) -> Option<&KeyInfo> {
        self.keys.values().max_by_key(|k| k.update_ts)
    }

    /// The newest key, unless it has already left the send window.
    pub fn newest_valid(&self, now: &Timestamp, renew: i64, expire: i64) -> Option<&KeyInfo> {
        self.newest().filter(|k| send_valid(k, now, renew, expire))
    }

    /// Oldest key still good for sending. The pick is cached until it ages out.
    pub fn oldest_valid(&mut self, now: &Timestamp, renew: i64, expire: i64) -> Option<KeyInfo> {
        if let Some(key) = self.oldest.and_then(|h| self.keys.get(&h)) {
            if send_valid(key, now, renew, expire) {
                return Some(key.clone());
            }
        }
        let oldest = self
            .keys
            .values()
            .filter(|k| send_valid(k, now, renew, expire))
            .min_by_key(|k| k.update_ts)?;
        self.oldest = Some(oldest.hash);
        Some(oldest.clone())
    }

    pub fn receivable(&self, hash: &Address, now: &Timestamp, expire: i64) -> Option<&KeyInfo> {
        self.keys.get(hash).filter(|k| receive_valid(k, now, expire))
    }

    pub fn expired(&self, now: &Timestamp, expire: i64) -> Vec<KeyInfo> {
        self.keys.values().filter(|k| !receive_valid(k, now, expire)).cloned().collect()
    }
}

impl ProtocolManager {
    // ========================================================================
    // REGISTRY
    // ========================================================================

    pub(crate) fn load_op_keys(&self) -> Result<()> {
        let now = Timestamp::now();
        let expire = self.config.expire_op_key_seconds;
        for key in self.op_key_obj.list()? {
            if !receive_valid(&key, &now, expire) {
                self.drop_op_key(&key)?;
            } else if key.status == Status::Alive {
                self.register_op_key(key);
            }
        }
        Ok(())
    }

    pub(crate) fn register_op_key(&self, key: KeyInfo) {
        let hash = key.hash;
        self.op_keys.write().insert(key);
        if let Ok(ptt) = self.ptt() {
            ptt.register_op_key(hash, self.entity_id);
        }
    }

    /// Stops using the key with id `id`. The record stays as a tombstone
    /// so a peer's copy is not taken back in.
    pub(crate) fn apply_revoke_op_key(&self, id: &PttID) -> Result<()> {
        let Some(mut key) = self.op_key_obj.get(id)? else {
            return Ok(());
        };
        self.op_keys.write().remove(&key.hash);
        if let Ok(ptt) = self.ptt() {
            ptt.remove_op_key(&key.hash);
        }
        self.op_key_obj.finalize(&mut key, Status::Deleted, Timestamp::now())?;
        info!(entity = %self.entity_id, hash = %key.hash, "op-key revoked");
        Ok(())
    }

    fn drop_op_key(&self, key: &KeyInfo) -> Result<()> {
        self.op_keys.write().remove(&key.hash);
        if let Ok(ptt) = self.ptt() {
            ptt.remove_op_key(&key.hash);
        }
        self.op_key_obj.remove(&key.id)?;
        if let Some(log_id) = &key.log_id {
            self.op_key_oplogs.remove(log_id)?;
        }
        debug!(entity = %self.entity_id, hash = %key.hash, "op-key removed");
        Ok(())
    }

    pub fn op_key_hashes(&self) -> Vec<Address> {
        self.op_keys.read().hashes()
    }

    pub fn oldest_op_key(&self) -> Result<KeyInfo> {
        let now = Timestamp::now();
        self.op_keys
            .write()
            .oldest_valid(&now, self.config.renew_op_key_seconds, self.config.expire_op_key_seconds)
            .ok_or(PttError::InvalidKey)
    }

    /// Newest key while it is still good for sending.
    pub fn newest_op_key(&self) -> Result<KeyInfo> {
        let now = Timestamp::now();
        self.op_keys
            .read()
            .newest_valid(&now, self.config.renew_op_key_seconds, self.config.expire_op_key_seconds)
            .cloned()
            .ok_or(PttError::InvalidKey)
    }

    /// Key for decrypting an incoming op, if still good for receiving.
    pub fn op_key(&self, hash: &Address) -> Option<KeyInfo> {
        let now = Timestamp::now();
        self.op_keys
            .read()
            .receivable(hash, &now, self.config.expire_op_key_seconds)
            .cloned()
    }

    pub(crate) fn op_keys_by_ids(&self, ids: &[PttID]) -> Result<Vec<KeyInfo>> {
        let mut keys = Vec::new();
        for id in ids {
            if let Some(key) = self.op_key_obj.get(id)? {
                if key.status == Status::Alive {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Alive create logs with the keys they name.
    pub(crate) fn op_key_bundle(&self) -> Result<(Vec<KeyInfo>, Vec<BaseOplog>)> {
        let logs = self.op_key_oplogs.alive_list()?;
        let ids: Vec<PttID> = logs
            .iter()
            .filter(|l| l.op == u32::from(OpKeyOp::Create))
            .map(|l| l.obj_id)
            .collect();
        Ok((self.op_keys_by_ids(&ids)?, logs))
    }

    // ========================================================================
    // CREATE / REVOKE
    // ========================================================================

    /// Derives a new op-key from my user key and seals its create log.
    pub async fn create_op_key(&self) -> Result<KeyInfo> {
        let my = &self.my_info;
        if !self.is_master(&my.user_id) {
            return Err(PttError::InvalidStatus);
        }
        let mut key = KeyInfo::derive(&my.user_key, &self.entity_id, &my.user_id)?;
        let mut log = BaseOplog::new(
            OplogFamily::OpKey,
            my.user_id,
            key.id,
            OpKeyOp::Create.into(),
            vec![],
            None,
            key.create_ts,
        );
        self.force_sign(&mut log)?;
        key.log_id = Some(log.id);
        key.status = Status::Alive;
        self.op_key_obj.save(&key)?;
        self.integrate_own(log).await?;
        info!(entity = %self.entity_id, hash = %key.hash, "op-key created");
        Ok(key)
    }

    pub async fn revoke_op_key(&self, id: PttID) -> Result<BaseOplog> {
        let my = &self.my_info;
        if !self.is_master(&my.user_id) {
            return Err(PttError::InvalidStatus);
        }
        let key = self.op_key_obj.get(&id)?.ok_or(PttError::NotFound)?;
        let mut log = BaseOplog::new(
            OplogFamily::OpKey,
            my.user_id,
            id,
            OpKeyOp::Revoke.into(),
            vec![],
            key.log_id,
            Timestamp::now(),
        );
        self.force_sign(&mut log)?;
        self.integrate_own(log).await
    }

    /// An alive create log: register the key if I hold it, else ask the
    /// sender for it.
    pub(crate) async fn apply_create_op_key(&self, log: &BaseOplog, node: Option<NodeID>) -> Result<()> {
        if let Some(mut key) = self.op_key_obj.get(&log.obj_id)? {
            if key.status == Status::Deleted {
                return Ok(());
            }
            key.log_id = Some(log.id);
            self.op_key_obj.finalize(&mut key, Status::Alive, log.update_ts)?;
            self.register_op_key(key);
            return Ok(());
        }
        if let Some(node) = node {
            let payload = OpKeyIdsPayload { ids: vec![log.obj_id] };
            self.send_to_peer(node, OpType::Oplog(OplogFamily::OpKey, SyncOp::SyncCreateOpKey), &payload)
                .await?;
        }
        Ok(())
    }

    /// Validates and stores received op-keys. Keys whose create log is
    /// alive are registered; the rest wait for their log.
    pub async fn handle_op_keys(&self, keys: Vec<KeyInfo>) -> Result<()> {
        let now = Timestamp::now();
        let expire = self.config.expire_op_key_seconds;
        for mut key in keys {
            if !key.is_valid() || key.entity_id != self.entity_id {
                return Err(PttError::InvalidKey);
            }
            verify_key_owner(&key.pubkey, &key.creator_id, key.extra.as_ref())?;
            if !receive_valid(&key, &now, expire) || self.op_keys.read().get(&key.hash).is_some() {
                continue;
            }
            let _guard = self.op_key_obj.lock(&key.id).await?;
            if matches!(self.op_key_obj.get(&key.id)?, Some(k) if k.status == Status::Deleted) {
                continue;
            }
            let alive = match &key.log_id {
                Some(log_id) => matches!(self.op_key_oplogs.get(log_id)?, Some(l) if l.status() == Status::Alive),
                None => false,
            };
            key.status = if alive { Status::Alive } else { Status::Pending };
            self.op_key_obj.save(&key)?;
            if alive {
                self.register_op_key(key);
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_sync_create_op_key(&self, data: &[u8], node: NodeID) -> Result<()> {
        let payload: OpKeyIdsPayload = serde_json::from_slice(data)?;
        let keys = self.op_keys_by_ids(&payload.ids)?;
        if keys.is_empty() {
            return Ok(());
        }
        self.send_to_peer(
            node,
            OpType::Oplog(OplogFamily::OpKey, SyncOp::SyncCreateOpKeyAck),
            &OpKeysPayload { keys },
        )
        .await
    }

    pub(crate) async fn handle_sync_create_op_key_ack(&self, data: &[u8]) -> Result<()> {
        let payload: OpKeysPayload = serde_json::from_slice(data)?;
        self.handle_op_keys(payload.keys).await
    }

    // ========================================================================
    // ROTATION
    // ========================================================================

    pub(crate) fn expire_op_keys(&self) -> Result<()> {
        let now = Timestamp::now();
        let expired = self.op_keys.read().expired(&now, self.config.expire_op_key_seconds);
        for key in expired {
            self.drop_op_key(&key)?;
        }
        Ok(())
    }

    /// Creates a key when none is fresh enough, or when forced.
    pub(crate) async fn renew_op_key(&self, force: bool) -> Result<Option<KeyInfo>> {
        if !self.is_master(&self.my_info.user_id) {
            return Ok(None);
        }
        let now = Timestamp::now();
        let half = self.config.renew_op_key_seconds / 2;
        let fresh = self
            .op_keys
            .read()
            .newest()
            .map_or(false, |k| k.update_ts > now.add_secs(-half.max(1)));
        if fresh && !force {
            return Ok(None);
        }
        self.create_op_key().await.map(Some)
    }

    fn rotation_wait(&self) -> Duration {
        let renew = self.config.renew_op_key_seconds.max(1) as f64;
        Duration::from_secs_f64(rand::thread_rng().gen_range(renew / 2.0..=renew))
    }

    pub(crate) async fn op_key_loop(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut wait = Duration::ZERO;
        loop {
            let force = tokio::select! {
                _ = quit.changed() => break,
                _ = self.force_op_key.notified() => true,
                _ = tokio::time::sleep(wait) => false,
            };
            if self.status() != Status::Alive {
                wait = ENTITY_NOT_ALIVE_SLEEP;
                continue;
            }
            wait = self.rotation_wait();
            if let Err(e) = self.expire_op_keys() {
                self.log_loop_error("expire op-keys", &e);
            }
            if let Err(e) = self.renew_op_key(force).await {
                warn!(entity = %self.entity_id, "renew op-key: {}", e);
            }
            if let Err(e) = self.renew_join_keys() {
                self.log_loop_error("renew join-keys", &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;

    fn key_at(ts: Timestamp) -> KeyInfo {
        let mut key = KeyInfo::derive(&generate_signing_key(), &PttID::random(), &PttID::random()).unwrap();
        key.update_ts = ts;
        key
    }

    #[test]
    fn test_oldest_valid_skips_send_expired() {
        let now = Timestamp::now();
        let mut ring = OpKeyRing::new();
        let old = key_at(now.add_secs(-50));
        let mid = key_at(now.add_secs(-20));
        let new = key_at(now.add_secs(-1));
        ring.insert(old.clone());
        ring.insert(mid.clone());
        ring.insert(new.clone());

        // renew 30, expire 60: sendable while younger than 30s
        assert_eq!(ring.oldest_valid(&now, 30, 60).unwrap().hash, mid.hash);
        assert!(ring.receivable(&old.hash, &now, 60).is_some());
        assert!(ring.expired(&now, 60).is_empty());

        let later = now.add_secs(25);
        assert_eq!(ring.oldest_valid(&later, 30, 60).unwrap().hash, new.hash);
        let expired = ring.expired(&later, 60);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].hash, old.hash);
    }

    #[test]
    fn test_remove_clears_cached_oldest() {
        let now = Timestamp::now();
        let mut ring = OpKeyRing::new();
        let a = key_at(now.add_secs(-5));
        let b = key_at(now.add_secs(-2));
        ring.insert(a.clone());
        ring.insert(b.clone());
        assert_eq!(ring.oldest_valid(&now, 30, 60).unwrap().hash, a.hash);
        ring.remove(&a.hash);
        assert_eq!(ring.oldest_valid(&now, 30, 60).unwrap().hash, b.hash);
        assert_eq!(ring.newest().unwrap().hash, b.hash);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_newest_valid_window() {
        let now = Timestamp::now();
        let mut ring = OpKeyRing::new();
        assert!(ring.newest_valid(&now, 30, 60).is_none());

        // renew 30, expire 60: the window closes at now - 30
        let edge = key_at(now.add_secs(-30));
        ring.insert(edge.clone());
        assert!(ring.newest_valid(&now, 30, 60).is_none());
        assert_eq!(ring.newest_valid(&now.add_secs(-1), 30, 60).unwrap().hash, edge.hash);

        let older = key_at(now.add_secs(-10));
        let newer = key_at(now.add_secs(-2));
        ring.insert(older.clone());
        ring.insert(newer.clone());
        assert_eq!(ring.newest_valid(&now, 30, 60).unwrap().hash, newer.hash);
        assert_eq!(ring.oldest_valid(&now, 30, 60).unwrap().hash, older.hash);
    }

    #[test]
    fn test_no_sendable_key() {
        let now = Timestamp::now();
        let mut ring = OpKeyRing::new();
        ring.insert(key_at(now.add_secs(-40)));
        assert!(ring.oldest_valid(&now, 30, 60).is_none());
        assert!(ring.newest().is_some());
    }
}
