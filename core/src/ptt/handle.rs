// Transport events: connect handshake, frame routing and the node-level
// identify exchange

use super::codec::{unmarshal_frame, CodeType, PttEventData, PttStatus};
use super::identify::IdentifyAck;
use super::Ptt;
use crate::config::{HANDSHAKE_TIMEOUT, SIZE_CHALLENGE};
use crate::crypto::{decrypt_data, random_bytes};
use crate::pm::entity::EntityDeletedPayload;
use crate::pm::message::{ChallengePayload, IdentifyAckPayload};
use crate::pm::OpType;
use crate::types::{Address, NodeID};
use crate::{PttError, Result};
use tracing::{debug, info, warn};

impl Ptt {
    pub(crate) async fn handle_connected(&self, node: NodeID) {
        if node == self.my_info.node_id {
            return;
        }
        if let Err(e) = self.add_peer(node) {
            debug!(%node, "refuse peer: {}", e);
            self.drop_peer(node);
            return;
        }
        debug!(%node, "peer connected");
        let status = PttStatus {
            version: self.config.version,
            network_id: self.config.network_id,
        };
        if let Err(e) = self.send_plain(node, CodeType::Status, &status).await {
            debug!(%node, "send status: {}", e);
        }

        let Ok(this) = self.arc() else {
            return;
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
            if this.peer(&node).is_some_and(|p| !p.handshake_done) {
                warn!(%node, "handshake timeout");
                this.drop_peer(node);
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub(crate) fn handle_disconnected(&self, node: &NodeID) {
        if self.remove_peer(node).is_some() {
            debug!(%node, "peer disconnected");
        }
    }

    pub(crate) async fn handle_frame(&self, node: NodeID, bytes: &[u8]) {
        if let Err(e) = self.dispatch_frame(node, bytes).await {
            if e.is_protocol_violation() {
                self.peer_violation(&node, &e);
            } else {
                debug!(%node, "frame: {}", e);
            }
        }
    }

    async fn dispatch_frame(&self, node: NodeID, bytes: &[u8]) -> Result<()> {
        let peer = self.peer(&node).ok_or(PttError::PeerShutdown)?;
        let ev = unmarshal_frame(bytes, &self.my_info.node_id)?;
        if !peer.handshake_done && ev.code != CodeType::Status {
            return Err(PttError::InvalidData);
        }
        if ev.code.is_encrypted() && ev.hash.is_empty() {
            return Err(PttError::InvalidData);
        }

        match ev.code {
            CodeType::Status => self.handle_status(node, ev.decode_plain()?).await,
            CodeType::Join => self.handle_join_frame(node, &ev).await,
            CodeType::JoinAck => self.handle_join_ack_frame(node, &ev).await,
            CodeType::Op => self.handle_op_frame(node, &ev).await,
            CodeType::OpFail => self.handle_op_fail(node, ev.decode_plain()?).await,
            CodeType::OpCheckMember => self.handle_op_check_member(node, ev.decode_plain()?).await,
            CodeType::OpCheckMemberAck => self.handle_op_check_member_ack(node, ev.decode_plain()?),
            CodeType::RequestOpKey => self.handle_request_op_key(node, ev.decode_plain()?).await,
            CodeType::RequestOpKeyAck => self.handle_request_op_key_ack(node, ev.decode_plain()?).await,
            CodeType::RequestOpKeyFail => self.handle_request_op_key_fail(node, ev.decode_plain()?),
            CodeType::EntityDeleted => self.handle_entity_deleted_frame(node, ev.decode_plain()?).await,
            CodeType::IdentifyPeer => self.handle_identify_peer(node, ev.decode_plain()?).await,
            CodeType::IdentifyPeerFail => {
                info!(%node, "peer refused to identify");
                Ok(())
            }
            CodeType::IdentifyPeerWithMyID => self.handle_identify_with_my_id(node, ev.decode_plain()?).await,
            CodeType::IdentifyPeerWithMyIDChallenge => {
                self.handle_identify_with_my_id_challenge(node, ev.decode_plain()?).await
            }
            CodeType::IdentifyPeerWithMyIDChallengeAck => {
                self.handle_identify_with_my_id_challenge_ack(node, ev.decode_plain()?).await
            }
            CodeType::IdentifyPeerWithMyIDAck => self.handle_identify_with_my_id_ack(node, ev.decode_plain()?).await,
        }
    }

    // ========================================================================
    // STATUS HANDSHAKE
    // ========================================================================

    async fn handle_status(&self, node: NodeID, status: PttStatus) -> Result<()> {
        if status.version != self.config.version || status.network_id != self.config.network_id {
            warn!(%node, version = status.version, network = status.network_id, "status mismatch");
            self.drop_peer(node);
            return Err(PttError::InvalidData);
        }
        {
            let mut peers = self.peers.write();
            let peer = peers.get_mut(&node).ok_or(PttError::PeerShutdown)?;
            if peer.handshake_done {
                return Err(PttError::InvalidData);
            }
            peer.handshake_done = true;
        }
        debug!(%node, "handshake done");

        if let Some(dial) = self.take_dial(&node) {
            if let Some(pm) = self.op_pm(&dial.op_key_hash) {
                pm.identify_peer(node).await?;
            }
        }
        if self.my_info.node_id < node {
            self.identify_with_my_id(node).await?;
        }
        self.retry_join_requests(node).await;
        Ok(())
    }

    // ========================================================================
    // ENCRYPTED CHANNELS
    // ========================================================================

    async fn handle_join_frame(&self, node: NodeID, ev: &PttEventData) -> Result<()> {
        let hash = Address::from_bytes(&ev.hash)?;
        let entity_id = self.join_entity(&hash).ok_or(PttError::InvalidKey)?;
        let pm = self.entity(&entity_id).ok_or(PttError::InvalidEntity)?;
        let key = pm.join_key(&hash).ok_or(PttError::InvalidKey)?;
        let (op, data) = decrypt_data(&ev.enc_data, &key)?;
        pm.handle_join_message(OpType::try_from(op)?, &data, node, &key).await
    }

    /// Op traffic under an unknown key gets `OpFail`, which starts op-key
    /// recovery on the sender.
    async fn handle_op_frame(&self, node: NodeID, ev: &PttEventData) -> Result<()> {
        let hash = Address::from_bytes(&ev.hash)?;
        let found = self.op_pm(&hash).and_then(|pm| pm.op_key(&hash).map(|key| (pm, key)));
        let Some((pm, key)) = found else {
            debug!(%node, %hash, "op under unknown key");
            return self.send_op_fail(node, hash).await;
        };
        let (op, data) = decrypt_data(&ev.enc_data, &key)?;
        pm.handle_message(op, &data, node).await
    }

    async fn handle_entity_deleted_frame(&self, node: NodeID, payload: EntityDeletedPayload) -> Result<()> {
        let Some(pm) = self.entity(&payload.entity_id) else {
            return Ok(());
        };
        if pm.peer_type(&node).is_none() {
            return Err(PttError::InvalidEntity);
        }
        pm.handle_entity_deleted(payload, node).await
    }

    // ========================================================================
    // IDENTIFY
    // ========================================================================
    //
    // The node with the smaller id opens:
    //   A -> B  IdentifyPeerWithMyID            {C: ca}
    //   B -> A  IdentifyPeerWithMyIDChallenge   {C: cb}
    //   A -> B  IdentifyPeerWithMyIDChallengeAck{A: ack(cb)}
    //   B -> A  IdentifyPeerWithMyIDAck         {A: ack(ca)}
    // `IdentifyPeer{C}` asks for a one-way proof, answered with
    // `IdentifyPeerWithMyIDAck`.

    fn new_identify_challenge(&self, node: NodeID) -> Vec<u8> {
        let challenge = random_bytes(SIZE_CHALLENGE);
        self.identify_challenges.lock().insert(node, challenge.clone());
        challenge
    }

    fn take_identify_challenge(&self, node: &NodeID) -> Result<Vec<u8>> {
        self.identify_challenges.lock().remove(node).ok_or(PttError::InvalidData)
    }

    /// Asks `node` to prove its user. Identified peers are skipped.
    pub async fn identify_peer(&self, node: NodeID) -> Result<()> {
        if self.peer_user(&node).is_some() {
            return Ok(());
        }
        let challenge = self.new_identify_challenge(node);
        self.send_plain(node, CodeType::IdentifyPeer, &ChallengePayload { challenge }).await
    }

    async fn identify_with_my_id(&self, node: NodeID) -> Result<()> {
        let challenge = self.new_identify_challenge(node);
        self.send_plain(node, CodeType::IdentifyPeerWithMyID, &ChallengePayload { challenge }).await
    }

    async fn handle_identify_peer(&self, node: NodeID, payload: ChallengePayload) -> Result<()> {
        if payload.challenge.len() != SIZE_CHALLENGE {
            return self.send_plain(node, CodeType::IdentifyPeerFail, &()).await;
        }
        let ack = IdentifyAck::new(&payload.challenge, &self.my_info);
        self.send_plain(node, CodeType::IdentifyPeerWithMyIDAck, &IdentifyAckPayload { ack }).await
    }

    /// Keeps their challenge until they answer mine.
    async fn handle_identify_with_my_id(&self, node: NodeID, payload: ChallengePayload) -> Result<()> {
        if payload.challenge.len() != SIZE_CHALLENGE {
            return Err(PttError::InvalidData);
        }
        self.peer_challenges.lock().insert(node, payload.challenge);
        let challenge = self.new_identify_challenge(node);
        self.send_plain(node, CodeType::IdentifyPeerWithMyIDChallenge, &ChallengePayload { challenge })
            .await
    }

    async fn handle_identify_with_my_id_challenge(&self, node: NodeID, payload: ChallengePayload) -> Result<()> {
        if payload.challenge.len() != SIZE_CHALLENGE || !self.identify_challenges.lock().contains_key(&node) {
            return Err(PttError::InvalidData);
        }
        let ack = IdentifyAck::new(&payload.challenge, &self.my_info);
        self.send_plain(node, CodeType::IdentifyPeerWithMyIDChallengeAck, &IdentifyAckPayload { ack })
            .await
    }

    async fn handle_identify_with_my_id_challenge_ack(&self, node: NodeID, payload: IdentifyAckPayload) -> Result<()> {
        let challenge = self.take_identify_challenge(&node)?;
        let their_challenge = self.peer_challenges.lock().remove(&node).ok_or(PttError::InvalidData)?;
        let user_id = payload.ack.verify(&challenge, &node)?;
        self.set_peer_user(node, user_id).await?;

        let ack = IdentifyAck::new(&their_challenge, &self.my_info);
        self.send_plain(node, CodeType::IdentifyPeerWithMyIDAck, &IdentifyAckPayload { ack }).await
    }

    async fn handle_identify_with_my_id_ack(&self, node: NodeID, payload: IdentifyAckPayload) -> Result<()> {
        let challenge = self.take_identify_challenge(&node)?;
        let user_id = payload.ack.verify(&challenge, &node)?;
        self.set_peer_user(node, user_id).await
    }
}
