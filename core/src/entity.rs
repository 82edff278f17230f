// Entity records and the hooks a hosting service plugs into its entities

use crate::types::{NodeID, PttID, Status, Timestamp};
use crate::{PttError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How a join request is answered: into a shared entity, or into the
/// personal entity of the same user on another device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Entity,
    Me,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "CID")]
    pub creator_id: PttID,
    #[serde(rename = "CT")]
    pub create_ts: Timestamp,
    #[serde(rename = "UT")]
    pub update_ts: Timestamp,
    #[serde(rename = "S")]
    pub status: Status,
    #[serde(rename = "N")]
    pub name: String,
    #[serde(rename = "s")]
    pub service: String,
    #[serde(rename = "O", default)]
    pub owner_ids: Vec<PttID>,
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<PttID>,
    #[serde(rename = "P", default)]
    pub personal: bool,
}

impl EntityInfo {
    pub fn new(id: PttID, creator_id: PttID, name: String, service: String, ts: Timestamp) -> Self {
        Self {
            id,
            creator_id,
            create_ts: ts,
            update_ts: ts,
            status: Status::Alive,
            name,
            service,
            owner_ids: vec![creator_id],
            log_id: None,
            personal: false,
        }
    }

    pub fn is_owner(&self, id: &PttID) -> bool {
        self.owner_ids.contains(id)
    }

    pub fn add_owner_id(&mut self, id: PttID) {
        if !self.is_owner(&id) {
            self.owner_ids.push(id);
        }
    }

    pub fn remove_owner_id(&mut self, id: &PttID) {
        self.owner_ids.retain(|o| o != id);
    }
}

/// Service-specific behaviour of an entity. Defaults accept every joiner
/// and carry no content ops.
#[async_trait]
pub trait EntityHooks: Send + Sync {
    async fn is_suspicious_id(&self, _user_id: &PttID, _node: &NodeID) -> bool {
        false
    }

    async fn is_good_id(&self, _user_id: &PttID, _node: &NodeID) -> bool {
        true
    }

    async fn postcreate(&self, _entity: &EntityInfo) -> Result<()> {
        Ok(())
    }

    async fn postdelete(&self, _entity: &EntityInfo) -> Result<()> {
        Ok(())
    }

    /// Content ops (op >= `OpType::ENTITY_BASE`).
    async fn handle_message(&self, _entity_id: &PttID, _op: u32, _data: &[u8], _node: &NodeID) -> Result<()> {
        Err(PttError::NotImplemented)
    }
}

pub struct DefaultHooks;

#[async_trait]
impl EntityHooks for DefaultHooks {}
