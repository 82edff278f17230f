// Op-key recovery between nodes
//
// A node that cannot read an op frame answers `OpFail`. The sender offers
// its alive op-keys and their create logs (`RequestOpKey`) to an identified
// member, and the member answers with its own (`RequestOpKeyAck`). A peer
// the sender does not count as a member is asked first (`OpCheckMember`).
// Recovery frames are plain: the keys never travel under a key the other
// side may lack.

use super::codec::CodeType;
use super::Ptt;
use crate::crypto::KeyInfo;
use crate::oplog::{BaseOplog, OplogFamily};
use crate::pm::ProtocolManager;
use crate::types::{Address, NodeID, PttID};
use crate::{PttError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpFailPayload {
    #[serde(rename = "H")]
    pub hash: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityIdPayload {
    #[serde(rename = "ID")]
    pub entity_id: PttID,
}

/// Body of both `RequestOpKey` and `RequestOpKeyAck`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpKeysBundle {
    #[serde(rename = "ID")]
    pub entity_id: PttID,
    #[serde(rename = "K", default)]
    pub keys: Vec<KeyInfo>,
    #[serde(rename = "L", default)]
    pub logs: Vec<BaseOplog>,
}

impl OpKeysBundle {
    fn of(pm: &ProtocolManager) -> Result<Self> {
        let (keys, logs) = pm.op_key_bundle()?;
        Ok(Self {
            entity_id: *pm.entity_id(),
            keys,
            logs,
        })
    }
}

impl Ptt {
    pub(crate) async fn send_op_fail(&self, node: NodeID, hash: Address) -> Result<()> {
        self.send_plain(node, CodeType::OpFail, &OpFailPayload { hash }).await
    }

    fn is_entity_member(&self, pm: &ProtocolManager, node: &NodeID) -> Result<bool> {
        let user_id = self.peer_user(node).ok_or(PttError::InvalidNode)?;
        Ok(pm.classify_user(&user_id).is_some())
    }

    async fn send_op_keys(&self, node: NodeID, code: CodeType, pm: &ProtocolManager) -> Result<()> {
        let bundle = OpKeysBundle::of(pm)?;
        debug!(%node, entity = %bundle.entity_id, keys = bundle.keys.len(), ?code, "send op-keys");
        self.send_plain(node, code, &bundle).await
    }

    /// Keys before logs: a create log then finds its key stored.
    async fn merge_op_keys(&self, pm: &ProtocolManager, node: NodeID, bundle: OpKeysBundle) -> Result<()> {
        let n_keys = bundle.keys.len();
        pm.handle_op_keys(bundle.keys).await?;
        pm.handle_oplogs(OplogFamily::OpKey, bundle.logs, Some(node)).await?;
        debug!(%node, entity = %bundle.entity_id, keys = n_keys, "op-keys merged");
        Ok(())
    }

    /// My op under `hash` was unreadable to `node`.
    pub(crate) async fn handle_op_fail(&self, node: NodeID, payload: OpFailPayload) -> Result<()> {
        let Some(pm) = self.op_pm(&payload.hash) else {
            return Ok(());
        };
        if self.peer_user(&node).is_none() {
            debug!(%node, entity = %pm.entity_id(), "op fail from unidentified peer");
            return Ok(());
        }
        if self.is_entity_member(&pm, &node)? {
            return self.send_op_keys(node, CodeType::RequestOpKey, &pm).await;
        }
        let payload = EntityIdPayload {
            entity_id: *pm.entity_id(),
        };
        self.send_plain(node, CodeType::OpCheckMember, &payload).await
    }

    /// Offers my keys if I still host the entity, else says I left.
    pub(crate) async fn handle_op_check_member(&self, node: NodeID, payload: EntityIdPayload) -> Result<()> {
        match self.entity(&payload.entity_id) {
            Some(pm) => self.send_op_keys(node, CodeType::RequestOpKey, &pm).await,
            None => self.send_plain(node, CodeType::OpCheckMemberAck, &payload).await,
        }
    }

    /// The peer no longer hosts the entity.
    pub(crate) fn handle_op_check_member_ack(&self, node: NodeID, payload: EntityIdPayload) -> Result<()> {
        if let Some(pm) = self.entity(&payload.entity_id) {
            pm.unregister_peer(&node);
        }
        Ok(())
    }

    pub(crate) async fn handle_request_op_key(&self, node: NodeID, bundle: OpKeysBundle) -> Result<()> {
        let entity_id = bundle.entity_id;
        let Some(pm) = self.entity(&entity_id) else {
            return self
                .send_plain(node, CodeType::OpCheckMemberAck, &EntityIdPayload { entity_id })
                .await;
        };
        if !self.is_entity_member(&pm, &node)? {
            return self
                .send_plain(node, CodeType::RequestOpKeyFail, &EntityIdPayload { entity_id })
                .await;
        }
        self.merge_op_keys(&pm, node, bundle).await?;
        info!(%node, entity = %entity_id, "op-keys requested");
        self.send_op_keys(node, CodeType::RequestOpKeyAck, &pm).await
    }

    pub(crate) async fn handle_request_op_key_ack(&self, node: NodeID, bundle: OpKeysBundle) -> Result<()> {
        let pm: Arc<ProtocolManager> = self.entity(&bundle.entity_id).ok_or(PttError::InvalidEntity)?;
        if !self.is_entity_member(&pm, &node)? {
            return Err(PttError::InvalidNode);
        }
        info!(%node, entity = %bundle.entity_id, "op-keys recovered");
        self.merge_op_keys(&pm, node, bundle).await
    }

    /// Falls back to a full sync with whoever answers next.
    pub(crate) fn handle_request_op_key_fail(&self, node: NodeID, payload: EntityIdPayload) -> Result<()> {
        warn!(%node, entity = %payload.entity_id, "op-key request refused");
        if let Some(pm) = self.entity(&payload.entity_id) {
            pm.force_sync();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_payload_wire_names() {
        let json = serde_json::to_string(&OpFailPayload { hash: Address([3; 20]) }).unwrap();
        assert!(json.starts_with("{\"H\":"));

        let bundle = OpKeysBundle {
            entity_id: PttID::random(),
            keys: vec![],
            logs: vec![],
        };
        let json = serde_json::to_string(&bundle).unwrap();
        let back: OpKeysBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entity_id, bundle.entity_id);
        assert!(back.keys.is_empty());
    }

    #[test]
    fn test_bundle_fields_default() {
        let id = PttID::random();
        let json = serde_json::to_string(&EntityIdPayload { entity_id: id }).unwrap();
        let bundle: OpKeysBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(bundle.entity_id, id);
        assert!(bundle.logs.is_empty());
    }
}
