// Entity lifecycle driven from the PM: founding, bootstrapping from a join
// bundle, and deletion through an entity oplog

use super::message::ApproveJoinPayload;
use super::ProtocolManager;
use crate::oplog::{BaseOplog, OplogFamily, PttOp};
use crate::ptt::codec::CodeType;
use crate::types::{NodeID, PttID, Status, Timestamp};
use crate::{PttError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Payload of a join log on the personal entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEntityData {
    #[serde(rename = "ID")]
    pub entity_id: PttID,
    #[serde(rename = "s")]
    pub service: String,
}

/// Carried by the `EntityDeleted` code: the alive delete log proves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDeletedPayload {
    #[serde(rename = "ID")]
    pub entity_id: PttID,
    #[serde(rename = "L")]
    pub log: BaseOplog,
}

impl ProtocolManager {
    /// Founds the entity: master log 0, my member log, the first op-key and
    /// the create log.
    pub(crate) async fn found(&self) -> Result<()> {
        let me = self.my_info.user_id;
        let log0 = self.new_master_log0()?;
        self.save_master_log0(&log0)?;
        self.integrate_own(log0).await?;
        if !self.is_master(&me) {
            return Err(PttError::InvalidMaster0);
        }

        self.add_member(me).await?;
        self.create_op_key().await?;

        let mut log = BaseOplog::new(
            OplogFamily::Ptt,
            me,
            self.entity_id,
            PttOp::CreateEntity.into(),
            vec![],
            None,
            self.entity.read().create_ts,
        );
        self.force_sign(&mut log)?;
        let log = self.integrate_own(log).await?;
        self.update_entity(|e| e.log_id = Some(log.id))?;

        self.hooks.postcreate(&self.entity()).await?;
        info!(entity = %self.entity_id, "entity created");
        Ok(())
    }

    /// Replays an approve-join bundle from the inviter at `node`.
    pub(crate) async fn bootstrap(&self, bundle: ApproveJoinPayload, node: NodeID) -> Result<()> {
        if bundle.entity_id != self.entity_id || bundle.master_log0.family != OplogFamily::Master {
            return Err(PttError::InvalidData);
        }
        self.save_master_log0(&bundle.master_log0)?;
        self.handle_op_keys(vec![bundle.op_key]).await?;

        let mut master_logs = vec![bundle.master_log0];
        master_logs.extend(bundle.master_logs);
        self.handle_oplogs(OplogFamily::Master, master_logs, Some(node)).await?;
        if self.master_ids().is_empty() {
            return Err(PttError::InvalidMaster0);
        }
        self.handle_oplogs(OplogFamily::Member, bundle.member_logs, Some(node)).await?;
        self.handle_oplogs(OplogFamily::OpKey, vec![bundle.op_key_log], Some(node)).await?;
        if self.op_key_hashes().is_empty() {
            return Err(PttError::InvalidKey);
        }
        info!(entity = %self.entity_id, masters = self.master_ids().len(), "entity bootstrapped");
        Ok(())
    }

    /// Records on my personal entity that I joined `entity_id`, so my other
    /// devices learn of it.
    pub(crate) async fn record_join(&self, entity_id: PttID, service: String) -> Result<BaseOplog> {
        if !self.is_personal() {
            return Err(PttError::InvalidEntity);
        }
        let data = serde_json::to_vec(&JoinEntityData { entity_id, service })?;
        let mut log = BaseOplog::new(
            OplogFamily::Ptt,
            self.my_info.user_id,
            entity_id,
            PttOp::JoinEntity.into(),
            data,
            None,
            Timestamp::now(),
        );
        self.sign_own(&mut log)?;
        self.try_seal(&mut log)?;
        self.integrate_own(log).await
    }

    /// Entities joined from my other devices, as seen on my personal entity.
    pub fn joined_entities(&self) -> Result<Vec<JoinEntityData>> {
        let mut joined = Vec::new();
        for log in self.entity_oplogs.alive_list()? {
            if log.op == u32::from(PttOp::JoinEntity) {
                joined.push(serde_json::from_slice(&log.data)?);
            }
        }
        Ok(joined)
    }

    // ========================================================================
    // DELETE
    // ========================================================================

    /// Starts deleting the entity. Alive once every master signs.
    pub async fn delete_entity(&self) -> Result<BaseOplog> {
        let me = self.my_info.user_id;
        if !self.is_master(&me) {
            return Err(PttError::InvalidOp);
        }
        let entity = self.entity();
        if entity.status.is_deleted() {
            return Err(PttError::AlreadyDeleted);
        }
        let mut log = BaseOplog::new(
            OplogFamily::Ptt,
            me,
            self.entity_id,
            PttOp::DeleteEntity.into(),
            vec![],
            entity.log_id,
            Timestamp::now(),
        );
        self.sign_own(&mut log)?;
        self.try_seal(&mut log)?;
        self.integrate_own(log).await
    }

    /// The delete log is alive: tear the entity down everywhere.
    pub(crate) async fn apply_delete_entity(&self, log: &BaseOplog) -> Result<()> {
        if self.status() == Status::Deleted {
            return Ok(());
        }
        self.update_entity(|e| {
            e.status = Status::Deleted;
            e.update_ts = log.update_ts;
            e.log_id = Some(log.id);
        })?;
        let entity = self.entity();
        if let Err(e) = self.hooks.postdelete(&entity).await {
            warn!(entity = %self.entity_id, "postdelete: {}", e);
        }

        let ptt = self.ptt()?;
        let payload = EntityDeletedPayload {
            entity_id: self.entity_id,
            log: log.clone(),
        };
        let peers: Vec<NodeID> = self.peers.read().keys().copied().collect();
        for node in peers {
            if let Err(e) = ptt.send_plain(node, CodeType::EntityDeleted, &payload).await {
                warn!(entity = %self.entity_id, %node, "send entity deleted: {}", e);
            }
        }
        info!(entity = %self.entity_id, "entity deleted");
        ptt.entity_deleted(&self.entity_id);
        Ok(())
    }

    /// A peer says the entity is gone. The delete log goes through the
    /// normal pipeline, so an unsealed claim changes nothing.
    pub(crate) async fn handle_entity_deleted(&self, payload: EntityDeletedPayload, node: NodeID) -> Result<()> {
        if payload.entity_id != self.entity_id
            || payload.log.obj_id != self.entity_id
            || payload.log.op != u32::from(PttOp::DeleteEntity)
        {
            return Err(PttError::InvalidData);
        }
        self.handle_oplogs(OplogFamily::Ptt, vec![payload.log], Some(node)).await?;
        Ok(())
    }
}
