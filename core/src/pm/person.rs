// Person lifecycle shared by masters and members: add, transfer, migrate
// and delete, driven by person oplogs

use super::ProtocolManager;
use crate::object::{ObjectStore, Person, SyncInfo};
use crate::oplog::{to_delete_status, BaseOplog, OplogFamily, PersonOp};
use crate::types::{PttID, Status, Timestamp};
use crate::{PttError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Payload of transfer and migrate oplogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveData {
    #[serde(rename = "T")]
    pub to_id: PttID,
}

fn final_status(op: PersonOp) -> Status {
    match op {
        PersonOp::Add => Status::Alive,
        PersonOp::Transfer => Status::Transferred,
        PersonOp::Migrate => Status::Migrated,
        PersonOp::Delete => Status::Deleted,
    }
}

fn pending_statuses(op: PersonOp) -> (Status, Status) {
    match op {
        PersonOp::Transfer => (Status::InternalTransfer, Status::PendingTransfer),
        PersonOp::Migrate => (Status::InternalMigrate, Status::PendingMigrate),
        PersonOp::Add | PersonOp::Delete => (Status::InternalDeleted, Status::PendingDeleted),
    }
}

impl ProtocolManager {
    pub(crate) fn persons(&self, family: OplogFamily) -> Result<&ObjectStore<Person>> {
        match family {
            OplogFamily::Master => Ok(&self.masters_obj),
            OplogFamily::Member => Ok(&self.members_obj),
            OplogFamily::OpKey | OplogFamily::Ptt => Err(PttError::InvalidOp),
        }
    }

    // ========================================================================
    // APPLY
    // ========================================================================

    pub(crate) async fn apply_person_oplog(&self, log: &BaseOplog) -> Result<()> {
        let family = log.family;
        let store = self.persons(family)?;
        let op = PersonOp::try_from(log.op)?;
        match op {
            PersonOp::Add => {
                let person = {
                    let _guard = store.lock(&log.obj_id).await?;
                    let mut person = Person::new(log.obj_id, self.entity_id, log.doer_id, log.id, Status::Alive);
                    person.create_ts = log.create_ts;
                    person.update_ts = log.update_ts;
                    store.save(&person)?;
                    person
                };
                self.on_person_alive(family, person);
            }
            PersonOp::Transfer | PersonOp::Migrate => {
                let data: MoveData = serde_json::from_slice(&log.data)?;
                self.finish_person(store, log, op).await?;
                self.on_person_gone(family, &log.obj_id);

                let person = {
                    let _guard = store.lock(&data.to_id).await?;
                    let mut person = Person::new(data.to_id, self.entity_id, log.doer_id, log.id, Status::Alive);
                    person.create_ts = log.create_ts;
                    person.update_ts = log.update_ts;
                    store.save(&person)?;
                    person
                };
                self.on_person_alive(family, person);

                if self.entity.read().is_owner(&log.obj_id) {
                    self.update_entity(|e| {
                        e.remove_owner_id(&log.obj_id);
                        e.add_owner_id(data.to_id);
                    })?;
                }
                info!(
                    entity = %self.entity_id,
                    family = family.name(),
                    from = %log.obj_id,
                    to = %data.to_id,
                    "person moved"
                );
            }
            PersonOp::Delete => {
                self.finish_person(store, log, op).await?;
                self.on_person_gone(family, &log.obj_id);
            }
        }
        Ok(())
    }

    async fn finish_person(&self, store: &ObjectStore<Person>, log: &BaseOplog, op: PersonOp) -> Result<()> {
        let _guard = store.lock(&log.obj_id).await?;
        let mut person = match store.get(&log.obj_id)? {
            Some(person) => person,
            None => Person::new(log.obj_id, self.entity_id, log.doer_id, log.id, Status::Alive),
        };
        person.transfer_to_id = match op {
            PersonOp::Transfer | PersonOp::Migrate => Some(serde_json::from_slice::<MoveData>(&log.data)?.to_id),
            _ => None,
        };
        person.log_id = log.id;
        store.finalize(&mut person, final_status(op), log.update_ts)
    }

    fn on_person_alive(&self, family: OplogFamily, person: Person) {
        match family {
            OplogFamily::Master => self.register_master(person),
            _ => {
                if let Ok(ptt) = self.ptt() {
                    ptt.reclassify_user(&person.id);
                }
            }
        }
    }

    fn on_person_gone(&self, family: OplogFamily, id: &PttID) {
        match family {
            OplogFamily::Master => self.unregister_master(id),
            _ => self.unregister_user_peers(id),
        }
    }

    /// A delete-like log in flight is only recorded on the person; the
    /// person keeps its role until the log is alive.
    pub(crate) async fn apply_pending_person_oplog(&self, log: &BaseOplog) -> Result<()> {
        let op = PersonOp::try_from(log.op)?;
        if op == PersonOp::Add {
            return Ok(());
        }
        let store = self.persons(log.family)?;
        let _guard = store.lock(&log.obj_id).await?;
        let Some(mut person) = store.get(&log.obj_id)? else {
            return Ok(());
        };
        if person.status != Status::Alive {
            return Ok(());
        }
        let (internal, pending) = pending_statuses(op);
        let transfer_to_id = match op {
            PersonOp::Transfer | PersonOp::Migrate => Some(serde_json::from_slice::<MoveData>(&log.data)?.to_id),
            _ => None,
        };
        person.sync_info = Some(SyncInfo {
            log_id: log.id,
            status: to_delete_status(log, internal, pending, final_status(op)),
            update_ts: log.update_ts,
            transfer_to_id,
        });
        store.save(&person)
    }

    pub(crate) async fn revert_pending_person_oplog(&self, log: &BaseOplog) -> Result<()> {
        let store = self.persons(log.family)?;
        let _guard = store.lock(&log.obj_id).await?;
        store.clear_sync_info(&log.obj_id, &log.id)?;
        Ok(())
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Adds `id` to the family. An already alive person returns its log.
    pub(crate) async fn add_person(&self, family: OplogFamily, id: PttID) -> Result<BaseOplog> {
        let me = self.my_info.user_id;
        if !self.is_master(&me) {
            return Err(PttError::InvalidStatus);
        }
        let store = self.persons(family)?;
        if let Some(person) = store.get(&id)? {
            if person.status == Status::Alive {
                if let Some(log) = self.oplogs(family).get(&person.log_id)? {
                    return Ok(log);
                }
            }
        }

        let mut log = BaseOplog::new(family, me, id, PersonOp::Add.into(), vec![], None, Timestamp::now());
        self.sign_own(&mut log)?;
        self.try_seal(&mut log)?;
        self.integrate_own(log).await
    }

    /// Transfer or migrate `from` to `to`.
    pub(crate) async fn move_person(&self, family: OplogFamily, op: PersonOp, from: PttID, to: PttID) -> Result<BaseOplog> {
        let me = self.my_info.user_id;
        let allowed = match op {
            PersonOp::Transfer => self.is_master(&me) || (family == OplogFamily::Member && from == me),
            PersonOp::Migrate => from == me,
            PersonOp::Add | PersonOp::Delete => false,
        };
        if !allowed {
            return Err(PttError::InvalidOp);
        }
        let log = self.new_person_change(family, op, from, serde_json::to_vec(&MoveData { to_id: to })?).await?;
        self.finish_own_person_change(log).await
    }

    pub(crate) async fn delete_person(&self, family: OplogFamily, id: PttID) -> Result<BaseOplog> {
        let me = self.my_info.user_id;
        if !self.is_master(&me) && !(family == OplogFamily::Member && id == me) {
            return Err(PttError::InvalidOp);
        }
        let log = self.new_person_change(family, PersonOp::Delete, id, vec![]).await?;
        self.finish_own_person_change(log).await
    }

    async fn new_person_change(&self, family: OplogFamily, op: PersonOp, id: PttID, data: Vec<u8>) -> Result<BaseOplog> {
        let store = self.persons(family)?;
        let person = {
            let _guard = store.lock(&id).await?;
            store.get(&id)?.ok_or(PttError::NotFound)?
        };
        if person.status.is_deleted() || person.status > Status::Alive {
            return Err(PttError::AlreadyDeleted);
        }
        if person.status != Status::Alive {
            return Err(PttError::InvalidStatus);
        }
        Ok(BaseOplog::new(
            family,
            self.my_info.user_id,
            id,
            op.into(),
            data,
            Some(person.log_id),
            Timestamp::now(),
        ))
    }

    async fn finish_own_person_change(&self, mut log: BaseOplog) -> Result<BaseOplog> {
        self.sign_own(&mut log)?;
        self.try_seal(&mut log)?;
        self.integrate_own(log).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_statuses_follow_op() {
        assert_eq!(pending_statuses(PersonOp::Transfer).1, Status::PendingTransfer);
        assert_eq!(pending_statuses(PersonOp::Migrate).0, Status::InternalMigrate);
        assert_eq!(final_status(PersonOp::Delete), Status::Deleted);
    }

    #[test]
    fn test_move_data_wire_name() {
        let to = PttID::random();
        let json = serde_json::to_string(&MoveData { to_id: to }).unwrap();
        assert!(json.starts_with("{\"T\":"));
    }
}
