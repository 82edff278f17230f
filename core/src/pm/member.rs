// Members

use super::ProtocolManager;
use crate::object::Person;
use crate::oplog::{BaseOplog, OplogFamily, PersonOp};
use crate::types::{PttID, Status};
use crate::Result;

impl ProtocolManager {
    /// Adds a member. Used on approve-join; re-adding returns the existing log.
    pub async fn add_member(&self, id: PttID) -> Result<BaseOplog> {
        self.add_person(OplogFamily::Member, id).await
    }

    pub async fn transfer_member(&self, from: PttID, to: PttID) -> Result<BaseOplog> {
        self.move_person(OplogFamily::Member, PersonOp::Transfer, from, to).await
    }

    pub async fn migrate_member(&self, to: PttID) -> Result<BaseOplog> {
        let me = self.my_info.user_id;
        self.move_person(OplogFamily::Member, PersonOp::Migrate, me, to).await
    }

    pub async fn delete_member(&self, id: PttID) -> Result<BaseOplog> {
        self.delete_person(OplogFamily::Member, id).await
    }

    pub fn get_member(&self, id: &PttID) -> Result<Option<Person>> {
        self.members_obj.get(id)
    }

    pub fn is_member(&self, id: &PttID) -> bool {
        matches!(self.members_obj.get(id), Ok(Some(p)) if p.status == Status::Alive)
    }

    pub fn member_ids(&self) -> Result<Vec<PttID>> {
        Ok(self.members_obj.list_by_status(Status::Alive)?.into_iter().map(|p| p.id).collect())
    }
}
