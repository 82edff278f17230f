// Inviter side of the join handshake, and the join-keys invitations carry

use super::message::{ApproveJoinPayload, ChallengePayload, JoinAckChallengePayload, JoinEntityPayload};
use super::{ConfirmJoin, JoinChallenge, OpType, ProtocolManager};
use crate::config::{MAX_JOIN_KEYS, MAX_SYNC_OPLOG_ACK, RENEW_JOIN_KEY_SECONDS, SIZE_CHALLENGE};
use crate::crypto::{random_bytes, KeyInfo};
use crate::entity::JoinType;
use crate::ptt::codec::CodeType;
use crate::ptt::identify::IdentifyAck;
use crate::ptt::join::Invitation;
use crate::types::{Address, NodeID, PttID, Status, Timestamp};
use crate::{PttError, Result};
use tracing::{info, warn};

impl ProtocolManager {
    // ========================================================================
    // JOIN KEYS
    // ========================================================================

    pub(crate) fn create_join_key(&self) -> Result<KeyInfo> {
        let my = &self.my_info;
        let mut key = KeyInfo::derive(&my.user_key, &self.entity_id, &my.user_id)?;
        key.status = Status::Alive;
        let retired = {
            let mut keys = self.join_keys.write();
            keys.push(key.clone());
            let excess = keys.len().saturating_sub(MAX_JOIN_KEYS);
            keys.drain(..excess).collect::<Vec<_>>()
        };
        if let Ok(ptt) = self.ptt() {
            ptt.register_join_key(key.hash, self.entity_id);
            for old in retired {
                ptt.remove_join_key(&old.hash);
            }
        }
        Ok(key)
    }

    pub fn join_key(&self, hash: &Address) -> Option<KeyInfo> {
        self.join_keys.read().iter().find(|k| k.hash == *hash).cloned()
    }

    /// Live join keys, oldest first.
    pub fn join_key_list(&self) -> Vec<KeyInfo> {
        self.join_keys.read().clone()
    }

    pub(crate) fn renew_join_keys(&self) -> Result<()> {
        if !self.is_master(&self.my_info.user_id) {
            return Ok(());
        }
        let now = Timestamp::now();
        let stale = self
            .join_keys
            .read()
            .last()
            .map_or(true, |k| k.update_ts < now.add_secs(-RENEW_JOIN_KEY_SECONDS));
        if stale {
            self.create_join_key()?;
        }
        Ok(())
    }

    /// A join-key answers one joiner; a fresh one replaces it.
    fn retire_join_key(&self, hash: &Address) -> Result<()> {
        self.join_keys.write().retain(|k| k.hash != *hash);
        if let Ok(ptt) = self.ptt() {
            ptt.remove_join_key(hash);
        }
        self.create_join_key()?;
        Ok(())
    }

    /// Invitation to hand to a joiner out of band.
    pub fn invitation(&self, join_type: JoinType) -> Result<Invitation> {
        if self.status() != Status::Alive {
            return Err(PttError::InvalidStatus);
        }
        let existing = self.join_keys.read().last().cloned();
        let key = match existing {
            Some(key) => key,
            None => self.create_join_key()?,
        };
        let entity = self.entity();
        Ok(Invitation {
            node: self.my_info.node_id,
            hash: key.hash,
            key,
            name: entity.name,
            entity_id: entity.id,
            creator_id: entity.creator_id,
            service: entity.service,
            join_type,
        })
    }

    // ========================================================================
    // HANDSHAKE
    // ========================================================================

    pub(crate) async fn handle_join_message(&self, op: OpType, data: &[u8], node: NodeID, key: &KeyInfo) -> Result<()> {
        match op {
            OpType::Join => self.handle_join(data, node, key).await,
            OpType::JoinEntity => self.handle_join_entity(data, node, key).await,
            _ => Err(PttError::InvalidOp),
        }
    }

    /// Proves who I am to the joiner and challenges it back.
    async fn handle_join(&self, data: &[u8], node: NodeID, key: &KeyInfo) -> Result<()> {
        let join: ChallengePayload = serde_json::from_slice(data)?;
        if join.challenge.len() != SIZE_CHALLENGE {
            return Err(PttError::InvalidData);
        }
        let my_challenge = random_bytes(SIZE_CHALLENGE);
        self.join_challenges.lock().insert(
            node,
            JoinChallenge {
                challenge: my_challenge.clone(),
                hash: key.hash,
            },
        );
        let payload = JoinAckChallengePayload {
            ack: IdentifyAck::new(&join.challenge, &self.my_info),
            challenge: join.challenge,
            my_challenge,
            entity_id: self.entity_id,
            name: self.entity.read().name.clone(),
            master0_hash: self.master_log0_hash()?,
        };
        let data = serde_json::to_vec(&payload)?;
        self.ptt()?
            .send_encrypted(node, CodeType::JoinAck, key, OpType::JoinAckChallenge.into(), &data)
            .await
    }

    async fn handle_join_entity(&self, data: &[u8], node: NodeID, key: &KeyInfo) -> Result<()> {
        let payload: JoinEntityPayload = serde_json::from_slice(data)?;
        let challenge = self.join_challenges.lock().remove(&node).ok_or(PttError::InvalidData)?;
        if challenge.hash != key.hash {
            return Err(PttError::InvalidData);
        }
        let user_id = payload.ack.verify(&challenge.challenge, &node)?;
        if user_id != payload.user_id {
            return Err(PttError::InvalidData);
        }
        if payload.master0_hash != self.master_log0_hash()? {
            return Err(PttError::InvalidMaster0);
        }
        if self.hooks.is_suspicious_id(&user_id, &node).await {
            warn!(entity = %self.entity_id, user = %user_id, "suspicious joiner refused");
            return Err(PttError::InvalidEntity);
        }

        self.ptt()?.set_peer_user(node, user_id).await?;
        let confirm = ConfirmJoin {
            user_id,
            node,
            join_key_hash: key.hash,
        };
        self.confirm_joins.lock().insert(user_id, confirm);
        info!(entity = %self.entity_id, user = %user_id, name = %payload.name, "join request confirmed");

        if self.hooks.is_good_id(&user_id, &node).await {
            self.approve_join(user_id).await?;
        }
        Ok(())
    }

    /// Joiners verified but not yet approved.
    pub fn confirm_joins(&self) -> Vec<ConfirmJoin> {
        self.confirm_joins.lock().values().copied().collect()
    }

    /// Adds the confirmed joiner and hands it the entity bundle under the
    /// join-key it came with.
    pub async fn approve_join(&self, user_id: PttID) -> Result<()> {
        let confirm = self.confirm_joins.lock().get(&user_id).copied().ok_or(PttError::NotFound)?;
        let key = self.join_key(&confirm.join_key_hash).ok_or(PttError::InvalidKey)?;

        let payload = {
            let _guard = self.entity_lock.lock().await;
            let join_type = if user_id == self.my_info.user_id { JoinType::Me } else { JoinType::Entity };
            if join_type == JoinType::Entity {
                self.add_member(user_id).await?;
            }
            self.approve_bundle()?
        };
        let data = serde_json::to_vec(&payload)?;
        let ptt = self.ptt()?;
        ptt.send_encrypted(confirm.node, CodeType::JoinAck, &key, OpType::ApproveJoin.into(), &data)
            .await?;

        self.confirm_joins.lock().remove(&user_id);
        if let Some(peer_type) = self.classify_user(&user_id) {
            self.register_peer(confirm.node, peer_type);
            ptt.upgrade_peer(&confirm.node, peer_type);
        }
        self.retire_join_key(&key.hash)?;
        info!(entity = %self.entity_id, user = %user_id, "join approved");
        Ok(())
    }

    fn approve_bundle(&self) -> Result<ApproveJoinPayload> {
        let master0 = self.master_log0()?.ok_or(PttError::InvalidMaster0)?;
        let master_log0 = self.master_oplogs.get(&master0.id)?.ok_or(PttError::InvalidMaster0)?;
        let master_logs = self
            .master_oplogs
            .alive_list()?
            .into_iter()
            .filter(|l| l.id != master0.id)
            .collect();
        let mut member_logs = self.member_oplogs.alive_list()?;
        let op_key = self.newest_op_key()?;
        let op_key_log_id = op_key.log_id.ok_or(PttError::InvalidKey)?;
        let op_key_log = self.op_key_oplogs.get(&op_key_log_id)?.ok_or(PttError::InvalidKey)?;
        if member_logs.len() > MAX_SYNC_OPLOG_ACK {
            // the rest arrives with the first sync
            member_logs.sort_by_key(|l| std::cmp::Reverse(l.update_ts));
            member_logs.truncate(MAX_SYNC_OPLOG_ACK);
        }
        Ok(ApproveJoinPayload {
            entity_id: self.entity_id,
            entity: self.entity(),
            master_log0,
            master_logs,
            member_logs,
            op_key,
            op_key_log,
        })
    }
}
