// Masters: the hot map of alive masters, master log 0 and the newest
// master log that seals new oplogs

use super::ProtocolManager;
use crate::object::Person;
use crate::oplog::{BaseOplog, OplogFamily, PersonOp};
use crate::peer::PeerType;
use crate::store::{db_key, prefix};
use crate::types::{hexbytes, PttID, Status};
use crate::{PttError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Identity of the entity's first master log, pinned at join time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterLog0 {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "H", with = "hexbytes")]
    pub hash: Vec<u8>,
}

impl ProtocolManager {
    pub fn is_master(&self, id: &PttID) -> bool {
        self.masters.read().contains_key(id)
    }

    /// Alive now, or a master at some point (transferred, migrated, deleted).
    pub(crate) fn is_known_master(&self, id: &PttID) -> Result<bool> {
        if self.is_master(id) {
            return Ok(true);
        }
        Ok(self.masters_obj.get(id)?.is_some())
    }

    pub fn master_ids(&self) -> Vec<PttID> {
        let mut ids: Vec<PttID> = self.masters.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn get_master(&self, id: &PttID) -> Result<Option<Person>> {
        self.masters_obj.get(id)
    }

    pub(crate) fn load_masters(&self) -> Result<()> {
        let alive = self.masters_obj.list_by_status(Status::Alive)?;
        {
            let mut masters = self.masters.write();
            for person in alive {
                masters.insert(person.id, person);
            }
        }
        let newest = self.db.get_json::<PttID>(&self.newest_master_log_key())?;
        *self.newest_master_log_id.write() = newest;
        info!(entity = %self.entity_id, masters = self.masters.read().len(), "masters loaded");
        Ok(())
    }

    pub(crate) fn register_master(&self, person: Person) {
        let id = person.id;
        self.masters.write().insert(id, person);
        if id == self.my_info.user_id {
            return;
        }
        if let Ok(ptt) = self.ptt() {
            ptt.reclassify_user(&id);
        }
    }

    pub(crate) fn unregister_master(&self, id: &PttID) {
        if self.masters.write().remove(id).is_none() || *id == self.my_info.user_id {
            return;
        }
        if let Ok(ptt) = self.ptt() {
            ptt.reclassify_user(id);
        }
    }

    // ========================================================================
    // MASTER LOGS
    // ========================================================================

    fn newest_master_log_key(&self) -> Vec<u8> {
        db_key(&[prefix::NEWEST_MASTER_LOG_ID, self.entity_id.as_bytes()])
    }

    pub fn newest_master_log_id(&self) -> Option<PttID> {
        *self.newest_master_log_id.read()
    }

    pub(crate) fn set_newest_master_log_id(&self, id: PttID) -> Result<()> {
        *self.newest_master_log_id.write() = Some(id);
        self.db.put_json(&self.newest_master_log_key(), &id)
    }

    fn master_log0_key(&self) -> Vec<u8> {
        db_key(&[prefix::MASTER_LOG0_HASH, self.entity_id.as_bytes()])
    }

    pub fn master_log0(&self) -> Result<Option<MasterLog0>> {
        self.db.get_json(&self.master_log0_key())
    }

    pub(crate) fn save_master_log0(&self, log: &BaseOplog) -> Result<()> {
        let master0 = MasterLog0 {
            id: log.id,
            hash: log.creator_hash.clone(),
        };
        self.db.put_json(&self.master_log0_key(), &master0)
    }

    pub fn master_log0_hash(&self) -> Result<Vec<u8>> {
        Ok(self.master_log0()?.map(|m| m.hash).unwrap_or_default())
    }

    /// The creator adding itself, sealed by itself.
    pub(crate) fn new_master_log0(&self) -> Result<BaseOplog> {
        let me = self.my_info.user_id;
        let mut log = BaseOplog::new(
            OplogFamily::Master,
            me,
            me,
            PersonOp::Add.into(),
            vec![],
            None,
            self.entity.read().create_ts,
        );
        self.sign_own(&mut log)?;
        log.set_master_log_id(log.id, 1);
        Ok(log)
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    pub async fn add_master(&self, id: PttID) -> Result<BaseOplog> {
        self.add_person(OplogFamily::Master, id).await
    }

    /// Hands my master role to the member `to`. Sealed once both of us
    /// have master-signed.
    pub async fn transfer_master(&self, to: PttID) -> Result<BaseOplog> {
        let me = self.my_info.user_id;
        if !self.is_master(&me) || !self.is_member(&to) {
            return Err(PttError::InvalidOp);
        }
        self.move_person(OplogFamily::Master, PersonOp::Transfer, me, to).await
    }

    pub async fn migrate_master(&self, to: PttID) -> Result<BaseOplog> {
        let me = self.my_info.user_id;
        self.move_person(OplogFamily::Master, PersonOp::Migrate, me, to).await
    }

    pub async fn delete_master(&self, id: PttID) -> Result<BaseOplog> {
        self.delete_person(OplogFamily::Master, id).await
    }

    /// Peer type a user's nodes take in this entity, if any.
    pub fn classify_user(&self, user_id: &PttID) -> Option<PeerType> {
        if *user_id == self.my_info.user_id {
            return Some(PeerType::Me);
        }
        if self.is_master(user_id) {
            return Some(PeerType::Important);
        }
        match self.members_obj.get(user_id) {
            Ok(Some(member)) if member.status == Status::Alive => Some(PeerType::Member),
            _ => None,
        }
    }
}
