// Identify a peer through an entity's op channel
//
// Used when a node speaks an entity's op-key but its user is unknown.

use super::message::{ChallengePayload, IdentifyAckPayload};
use super::{OpType, ProtocolManager};
use crate::config::SIZE_CHALLENGE;
use crate::crypto::random_bytes;
use crate::ptt::identify::IdentifyAck;
use crate::types::NodeID;
use crate::{PttError, Result};
use tracing::debug;

impl ProtocolManager {
    pub async fn identify_peer(&self, node: NodeID) -> Result<()> {
        let challenge = random_bytes(SIZE_CHALLENGE);
        self.identify_challenges.lock().insert(node, challenge.clone());
        debug!(entity = %self.entity_id, %node, "identify peer");
        self.send_to_peer(node, OpType::IdentifyPeer, &ChallengePayload { challenge }).await
    }

    pub(crate) async fn handle_identify_peer(&self, data: &[u8], node: NodeID) -> Result<()> {
        let payload: ChallengePayload = serde_json::from_slice(data)?;
        if payload.challenge.len() != SIZE_CHALLENGE {
            return Err(PttError::InvalidData);
        }
        let ack = IdentifyAck::new(&payload.challenge, &self.my_info);
        self.send_to_peer(node, OpType::IdentifyPeerAck, &IdentifyAckPayload { ack }).await
    }

    pub(crate) async fn handle_identify_peer_ack(&self, data: &[u8], node: NodeID) -> Result<()> {
        let payload: IdentifyAckPayload = serde_json::from_slice(data)?;
        let challenge = self.identify_challenges.lock().remove(&node).ok_or(PttError::InvalidData)?;
        let user_id = payload.ack.verify(&challenge, &node)?;
        self.ptt()?.set_peer_user(node, user_id).await
    }
}
