// Entity peers and the send fan-out

use super::{OpType, ProtocolManager, SendEvent};
use crate::peer::PeerType;
use crate::types::{NodeID, PttID};
use crate::{PttError, Result};
use rand::seq::IteratorRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

impl ProtocolManager {
    /// Registers or re-types a peer. New peers are queued for a first sync.
    /// Returns whether the peer is new here.
    pub fn register_peer(&self, node: NodeID, peer_type: PeerType) -> bool {
        let previous = self.peers.write().insert(node, peer_type);
        if previous.is_some() {
            return false;
        }
        debug!(entity = %self.entity_id, %node, ?peer_type, "register peer");
        self.queue_sync(node);
        true
    }

    fn queue_sync(&self, node: NodeID) {
        if self.is_started() && self.new_peer_tx.try_send(node).is_err() {
            debug!(entity = %self.entity_id, %node, "new-peer queue full");
        }
    }

    pub fn unregister_peer(&self, node: &NodeID) {
        if self.peers.write().remove(node).is_some() {
            debug!(entity = %self.entity_id, %node, "unregister peer");
        }
    }

    pub fn peer_type(&self, node: &NodeID) -> Option<PeerType> {
        self.peers.read().get(node).copied()
    }

    pub fn peers(&self) -> HashMap<NodeID, PeerType> {
        self.peers.read().clone()
    }

    pub(crate) fn unregister_user_peers(&self, user_id: &PttID) {
        let Ok(ptt) = self.ptt() else {
            return;
        };
        for node in ptt.nodes_of_user(user_id) {
            self.unregister_peer(&node);
        }
    }

    /// Registers every connected peer whose user belongs to this entity
    /// and queues each for a sync.
    pub(crate) fn load_peers(&self) {
        let Ok(ptt) = self.ptt() else {
            return;
        };
        for (node, user_id) in ptt.identified_peers() {
            if let Some(peer_type) = self.classify_user(&user_id) {
                if !self.register_peer(node, peer_type) {
                    self.queue_sync(node);
                }
                ptt.upgrade_peer(&node, peer_type);
            }
        }
    }

    pub(crate) fn random_peer(&self) -> Option<NodeID> {
        self.peers.read().keys().copied().choose(&mut rand::thread_rng())
    }

    pub(crate) fn random_peer_of_type(&self, peer_type: PeerType) -> Option<NodeID> {
        self.peers
            .read()
            .iter()
            .filter(|(_, t)| **t == peer_type)
            .map(|(node, _)| *node)
            .choose(&mut rand::thread_rng())
    }

    /// Dials the masters' known nodes when no important peer is connected.
    pub(crate) fn connect_master(&self) {
        if self.random_peer_of_type(PeerType::Important).is_some() {
            return;
        }
        let (Ok(ptt), Ok(key)) = (self.ptt(), self.oldest_op_key()) else {
            return;
        };
        ptt.connect_users(&self.master_ids(), key.hash, PeerType::Important);
    }

    // ========================================================================
    // SENDING
    // ========================================================================

    /// Queues `payload` for every peer in `peers`.
    pub(crate) fn send_to_peers<T: Serialize>(&self, op: OpType, payload: &T, peers: Vec<NodeID>) -> Result<()> {
        let data = serde_json::to_vec(payload)?;
        self.send_tx.try_send(SendEvent { op, data, peers }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PttError::Busy,
            mpsc::error::TrySendError::Closed(_) => PttError::PeerShutdown,
        })
    }

    /// Sends to one peer under the oldest valid op-key.
    pub(crate) async fn send_to_peer<T: Serialize>(&self, node: NodeID, op: OpType, payload: &T) -> Result<()> {
        let data = serde_json::to_vec(payload)?;
        let key = self.oldest_op_key()?;
        self.ptt()?.send_op(node, &key, op.into(), &data).await
    }

    pub(crate) async fn send_loop(self: Arc<Self>, mut rx: mpsc::Receiver<SendEvent>, mut quit: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                event = rx.recv() => match event {
                    Some(event) => self.send_event(event).await,
                    None => break,
                },
            }
        }
    }

    async fn send_event(&self, event: SendEvent) {
        let key = match self.oldest_op_key() {
            Ok(key) => key,
            Err(e) => {
                warn!(entity = %self.entity_id, op = ?event.op, "no op-key to send: {}", e);
                return;
            }
        };
        let Ok(ptt) = self.ptt() else {
            return;
        };
        let op = u32::from(event.op);
        for node in event.peers {
            if let Err(e) = ptt.send_op(node, &key, op, &event.data).await {
                debug!(entity = %self.entity_id, %node, "send op: {}", e);
            }
        }
    }
}
