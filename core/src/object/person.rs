// Person: a master or a member of an entity

use super::{SyncInfo, SyncObject};
use crate::types::{PttID, Status, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "EID")]
    pub entity_id: PttID,
    #[serde(rename = "CID")]
    pub creator_id: PttID,
    #[serde(rename = "CT")]
    pub create_ts: Timestamp,
    #[serde(rename = "UT")]
    pub update_ts: Timestamp,
    #[serde(rename = "l")]
    pub log_id: PttID,
    #[serde(rename = "S")]
    pub status: Status,
    #[serde(rename = "T", default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_id: Option<PttID>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub sync_info: Option<SyncInfo>,
}

impl Person {
    pub fn new(id: PttID, entity_id: PttID, creator_id: PttID, log_id: PttID, status: Status) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            entity_id,
            creator_id,
            create_ts: now,
            update_ts: now,
            log_id,
            status,
            transfer_to_id: None,
            sync_info: None,
        }
    }
}

impl SyncObject for Person {
    fn id(&self) -> &PttID {
        &self.id
    }

    fn log_id(&self) -> &PttID {
        &self.log_id
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
        self.sync_info.as_ref()
    }

    fn set_sync_info(&mut self, info: Option<SyncInfo>) {
        self.sync_info = info;
    }
}
