// Joiner side of the join handshake
//
// An invitation travels out of band. The joiner proves who it is under the
// invitation's join-key, the inviter answers with the entity bundle, and
// the joiner's service bootstraps the entity from it.

use super::codec::{CodeType, PttEventData};
use super::identify::IdentifyAck;
use super::Ptt;
use crate::config::SIZE_CHALLENGE;
use crate::crypto::{decrypt_data, random_bytes, KeyInfo};
use crate::entity::JoinType;
use crate::pm::message::{ApproveJoinPayload, ChallengePayload, JoinAckChallengePayload, JoinEntityPayload};
use crate::pm::OpType;
use crate::types::{Address, NodeID, PttID};
use crate::{PttError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    #[serde(rename = "N")]
    pub node: NodeID,
    #[serde(rename = "H")]
    pub hash: Address,
    #[serde(rename = "K")]
    pub key: KeyInfo,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "ID")]
    pub entity_id: PttID,
    #[serde(rename = "CID")]
    pub creator_id: PttID,
    #[serde(rename = "s")]
    pub service: String,
    #[serde(rename = "T")]
    pub join_type: JoinType,
}

impl Invitation {
    /// Base58 text for sharing by hand.
    pub fn encode(&self) -> Result<String> {
        Ok(bs58::encode(serde_json::to_vec(self)?).into_string())
    }

    pub fn decode(text: &str) -> Result<Self> {
        let bytes = bs58::decode(text.trim()).into_vec().map_err(|_| PttError::InvalidData)?;
        let invitation: Self = serde_json::from_slice(&bytes)?;
        invitation.validate()?;
        Ok(invitation)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.key.is_valid() || self.key.hash != self.hash {
            return Err(PttError::InvalidKey);
        }
        if self.entity_id.ref_part() != self.creator_id.address().as_bytes() {
            return Err(PttError::InvalidEntity);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JoinStatus {
    Invalid,
    Pending,
    Requested,
    WaitAccepted,
    Accepted,
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub invitation: Invitation,
    pub challenge: Vec<u8>,
    pub status: JoinStatus,
    pub master0_hash: Vec<u8>,
    pub inviter: Option<PttID>,
}

impl Ptt {
    /// Starts joining the entity behind `invitation`. Completes in the
    /// background once the inviter's node is reachable.
    pub async fn join(&self, invitation: Invitation) -> Result<()> {
        invitation.validate()?;
        if invitation.node == self.my_info.node_id {
            return Err(PttError::AlreadyMyNode);
        }
        if self.entity(&invitation.entity_id).is_some() {
            return Err(PttError::AlreadyExists);
        }
        if self.service(&invitation.service).is_none() {
            return Err(PttError::InvalidEntity);
        }

        let node = invitation.node;
        let hash = invitation.hash;
        let request = JoinRequest {
            invitation,
            challenge: random_bytes(SIZE_CHALLENGE),
            status: JoinStatus::Pending,
            master0_hash: vec![],
            inviter: None,
        };
        self.join_requests.lock().insert(hash, request);
        info!(%node, %hash, "join requested");

        if self.peer(&node).is_some_and(|p| p.handshake_done) {
            self.try_join(hash).await
        } else {
            self.transport
                .dial(node)
                .await
                .map_err(|e| PttError::Transport(e.to_string()))
        }
    }

    pub fn join_requests(&self) -> Vec<JoinRequest> {
        self.join_requests.lock().values().cloned().collect()
    }

    pub fn join_status(&self, hash: &Address) -> Option<JoinStatus> {
        self.join_requests.lock().get(hash).map(|r| r.status)
    }

    async fn try_join(&self, hash: Address) -> Result<()> {
        let (node, key, challenge) = {
            let requests = self.join_requests.lock();
            let request = requests.get(&hash).ok_or(PttError::NotFound)?;
            if request.status != JoinStatus::Pending {
                return Ok(());
            }
            (request.invitation.node, request.invitation.key.clone(), request.challenge.clone())
        };
        let data = serde_json::to_vec(&ChallengePayload { challenge })?;
        self.send_encrypted(node, CodeType::Join, &key, OpType::Join.into(), &data)
            .await?;
        self.set_join_status(&hash, JoinStatus::Requested);
        Ok(())
    }

    /// Sends pending joins once `node` finishes its handshake.
    pub(crate) async fn retry_join_requests(&self, node: NodeID) {
        let hashes: Vec<Address> = self
            .join_requests
            .lock()
            .iter()
            .filter(|(_, r)| r.invitation.node == node && r.status == JoinStatus::Pending)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in hashes {
            if let Err(e) = self.try_join(hash).await {
                warn!(%node, %hash, "join: {}", e);
            }
        }
    }

    fn set_join_status(&self, hash: &Address, status: JoinStatus) {
        if let Some(request) = self.join_requests.lock().get_mut(hash) {
            request.status = status;
        }
    }

    pub(crate) async fn handle_join_ack_frame(&self, node: NodeID, ev: &PttEventData) -> Result<()> {
        let hash = Address::from_bytes(&ev.hash)?;
        let key = {
            let requests = self.join_requests.lock();
            let request = requests.get(&hash).ok_or(PttError::InvalidKey)?;
            if request.invitation.node != node {
                return Err(PttError::InvalidNode);
            }
            request.invitation.key.clone()
        };
        let (op, data) = decrypt_data(&ev.enc_data, &key)?;
        match OpType::try_from(op)? {
            OpType::JoinAckChallenge => self.handle_join_ack_challenge(node, hash, &key, &data).await,
            OpType::ApproveJoin => self.handle_approve_join(node, hash, &data).await,
            _ => Err(PttError::InvalidOp),
        }
    }

    /// The inviter proved itself: prove myself back.
    async fn handle_join_ack_challenge(&self, node: NodeID, hash: Address, key: &KeyInfo, data: &[u8]) -> Result<()> {
        let payload: JoinAckChallengePayload = serde_json::from_slice(data)?;
        let (challenge, entity_id, creator_id) = {
            let requests = self.join_requests.lock();
            let request = requests.get(&hash).ok_or(PttError::InvalidKey)?;
            if request.status != JoinStatus::Requested {
                return Err(PttError::InvalidStatus);
            }
            (request.challenge.clone(), request.invitation.entity_id, request.invitation.creator_id)
        };
        if payload.challenge != challenge || payload.my_challenge.len() != SIZE_CHALLENGE {
            return Err(PttError::InvalidData);
        }
        if payload.entity_id != entity_id || entity_id.ref_part() != creator_id.address().as_bytes() {
            return Err(PttError::InvalidEntity);
        }
        let inviter = payload.ack.verify(&challenge, &node)?;
        self.set_peer_user(node, inviter).await?;

        let reply = JoinEntityPayload {
            user_id: self.my_info.user_id,
            name: self.my_info.name.clone(),
            master0_hash: payload.master0_hash.clone(),
            ack: IdentifyAck::new(&payload.my_challenge, &self.my_info),
        };
        let data = serde_json::to_vec(&reply)?;
        self.send_encrypted(node, CodeType::Join, key, OpType::JoinEntity.into(), &data)
            .await?;

        if let Some(request) = self.join_requests.lock().get_mut(&hash) {
            request.status = JoinStatus::WaitAccepted;
            request.master0_hash = payload.master0_hash;
            request.inviter = Some(inviter);
        }
        debug!(%node, entity = %entity_id, name = %payload.name, "join challenge answered");
        Ok(())
    }

    async fn handle_approve_join(&self, node: NodeID, hash: Address, data: &[u8]) -> Result<()> {
        let bundle: ApproveJoinPayload = serde_json::from_slice(data)?;
        let service = {
            let requests = self.join_requests.lock();
            let request = requests.get(&hash).ok_or(PttError::InvalidKey)?;
            if request.status != JoinStatus::WaitAccepted {
                return Err(PttError::InvalidStatus);
            }
            if bundle.entity_id != request.invitation.entity_id || bundle.entity.id != bundle.entity_id {
                return Err(PttError::InvalidEntity);
            }
            if bundle.master_log0.creator_hash != request.master0_hash {
                return Err(PttError::InvalidMaster0);
            }
            request.invitation.service.clone()
        };
        let spm = self.service(&service).ok_or(PttError::InvalidEntity)?;
        let entity_id = bundle.entity_id;
        spm.create_join_entity(bundle, node).await?;

        self.set_join_status(&hash, JoinStatus::Accepted);
        self.join_requests.lock().remove(&hash);
        info!(%node, entity = %entity_id, "joined entity");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptt::MyInfo;
    use crate::types::Status;

    fn invitation() -> Invitation {
        let inviter = MyInfo::generate("alice");
        let entity_id = PttID::new_with_ref_id(&inviter.user_id);
        let mut key = KeyInfo::derive(&inviter.user_key, &entity_id, &inviter.user_id).unwrap();
        key.status = Status::Alive;
        Invitation {
            node: inviter.node_id,
            hash: key.hash,
            key,
            name: "board".into(),
            entity_id,
            creator_id: inviter.user_id,
            service: "test".into(),
            join_type: JoinType::Entity,
        }
    }

    #[test]
    fn test_invitation_text_roundtrip() {
        let inv = invitation();
        let text = inv.encode().unwrap();
        let back = Invitation::decode(&text).unwrap();
        assert_eq!(back.entity_id, inv.entity_id);
        assert_eq!(back.hash, inv.hash);
        assert!(back.key.is_valid());
    }

    #[test]
    fn test_invitation_rejects_mismatched_hash() {
        let mut inv = invitation();
        inv.hash = Address([9; 20]);
        assert_eq!(inv.validate(), Err(PttError::InvalidKey));
    }

    #[test]
    fn test_invitation_rejects_foreign_entity() {
        let mut inv = invitation();
        inv.entity_id = PttID::random();
        assert_eq!(inv.validate(), Err(PttError::InvalidEntity));
        assert!(Invitation::decode("not-base58-0OIl").is_err());
    }

    #[test]
    fn test_join_status_order() {
        assert!(JoinStatus::Pending < JoinStatus::Requested);
        assert!(JoinStatus::WaitAccepted < JoinStatus::Accepted);
    }
}
