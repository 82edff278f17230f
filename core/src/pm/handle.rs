// Op dispatch for traffic decrypted under one of this entity's op-keys

use super::{OpType, ProtocolManager};
use crate::peer::PeerType;
use crate::types::NodeID;
use crate::{PttError, Result};
use tracing::debug;

impl ProtocolManager {
    /// Identify ops are answered before any membership check. Everything
    /// else needs a peer of this entity at `Pending` or above.
    pub async fn handle_message(&self, op: u32, data: &[u8], node: NodeID) -> Result<()> {
        let op = OpType::try_from(op)?;
        match op {
            OpType::IdentifyPeer => return self.handle_identify_peer(data, node).await,
            OpType::IdentifyPeerAck => return self.handle_identify_peer_ack(data, node).await,
            OpType::Join | OpType::JoinAckChallenge | OpType::JoinEntity | OpType::ApproveJoin => {
                return Err(PttError::InvalidOp);
            }
            OpType::Oplog(..) | OpType::Entity(_) => {}
        }

        let Some(peer_type) = self.admit_peer(node).await? else {
            debug!(entity = %self.entity_id, %node, ?op, "drop op from unknown peer");
            return Ok(());
        };
        if peer_type < PeerType::Pending {
            return Ok(());
        }

        match op {
            OpType::Oplog(family, msg) => self.handle_sync_message(family, msg, data, node).await,
            OpType::Entity(n) => self.hooks.handle_message(&self.entity_id, n, data, &node).await,
            _ => Err(PttError::InvalidOp),
        }
    }

    /// Registers the sender under its peer type here. An unidentified
    /// sender is asked to identify and its op is dropped.
    async fn admit_peer(&self, node: NodeID) -> Result<Option<PeerType>> {
        if let Some(peer_type) = self.peer_type(&node) {
            return Ok(Some(peer_type));
        }
        let ptt = self.ptt()?;
        let Some(user_id) = ptt.peer_user(&node) else {
            self.identify_peer(node).await?;
            return Ok(None);
        };
        let peer_type = self.classify_user(&user_id);
        if let Some(peer_type) = peer_type {
            self.register_peer(node, peer_type);
            ptt.upgrade_peer(&node, peer_type);
        }
        Ok(peer_type)
    }
}
