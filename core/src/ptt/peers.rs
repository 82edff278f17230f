// Peer bookkeeping at the node level: admission, user binding, dialing

use super::Ptt;
use crate::config::IDENTIFY_PEER_TIMEOUT;
use crate::peer::{PeerType, PttPeer};
use crate::store::{db_key, prefix, Db};
use crate::types::{Address, NodeID, PttID, Timestamp};
use crate::{PttError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// An entity waiting for a dialed node to show up, so it can identify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialInfo {
    pub op_key_hash: Address,
    pub peer_type: PeerType,
    pub ts: Timestamp,
}

#[derive(Serialize, Deserialize)]
struct UserNodes {
    #[serde(rename = "ID")]
    user_id: PttID,
    #[serde(rename = "N")]
    nodes: Vec<NodeID>,
}

pub(crate) fn load_user_nodes(db: &Db) -> Result<HashMap<PttID, HashSet<NodeID>>> {
    Ok(db
        .scan_json::<UserNodes>(prefix::USER_NODE)?
        .into_iter()
        .map(|u| (u.user_id, u.nodes.into_iter().collect()))
        .collect())
}

impl Ptt {
    // ========================================================================
    // POOLS
    // ========================================================================

    pub fn peer(&self, node: &NodeID) -> Option<PttPeer> {
        self.peers.read().get(node).cloned()
    }

    pub fn peers(&self) -> Vec<PttPeer> {
        self.peers.read().all()
    }

    pub fn count_peers(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peer_user(&self, node: &NodeID) -> Option<PttID> {
        self.peers.read().get(node).and_then(|p| p.user_id)
    }

    /// Connected peers whose user is known.
    pub fn identified_peers(&self) -> Vec<(NodeID, PttID)> {
        self.peers
            .read()
            .all()
            .into_iter()
            .filter_map(|p| p.user_id.map(|u| (p.node_id, u)))
            .collect()
    }

    /// Connected nodes of `user_id`.
    pub fn nodes_of_user(&self, user_id: &PttID) -> Vec<NodeID> {
        self.peers.read().nodes_of_user(user_id)
    }

    /// Every node `user_id` was ever identified on, connected or not.
    pub fn known_nodes_of_user(&self, user_id: &PttID) -> Vec<NodeID> {
        self.user_nodes
            .read()
            .get(user_id)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Admits a newly connected node as `Random`.
    pub(crate) fn add_peer(&self, node: NodeID) -> Result<()> {
        let evicted = self.peers.write().add(PttPeer::new(node, PeerType::Random))?;
        if let Some(evicted) = evicted {
            self.drop_peer(evicted);
        }
        Ok(())
    }

    /// Moves a peer up to `peer_type`. Lower types are ignored.
    pub(crate) fn upgrade_peer(&self, node: &NodeID, peer_type: PeerType) {
        let result = self.peers.write().set_peer_type(node, peer_type, false);
        match result {
            Ok(Some(evicted)) => self.drop_peer(evicted),
            Ok(None) | Err(PttError::InvalidStatus) | Err(PttError::NotFound) => {}
            Err(e) => debug!(%node, ?peer_type, "upgrade peer: {}", e),
        }
    }

    /// Re-types every connected node of `user_id` from what each entity
    /// says about the user, registering or unregistering it per entity.
    pub(crate) fn reclassify_user(&self, user_id: &PttID) {
        let nodes = self.nodes_of_user(user_id);
        if nodes.is_empty() {
            return;
        }
        let peer_type = self.classify_user_in_entities(user_id, &nodes);
        for node in nodes {
            let result = self.peers.write().set_peer_type(&node, peer_type, true);
            match result {
                Ok(Some(evicted)) => self.drop_peer(evicted),
                Ok(None) => {}
                Err(e) => warn!(%node, ?peer_type, "reclassify peer: {}", e),
            }
        }
    }

    /// Best type across my entities, registering `nodes` where the user
    /// belongs and unregistering them elsewhere. `Pending` if nowhere.
    fn classify_user_in_entities(&self, user_id: &PttID, nodes: &[NodeID]) -> PeerType {
        let mut best = if *user_id == self.my_info.user_id {
            PeerType::Me
        } else {
            PeerType::Pending
        };
        for pm in self.entities() {
            match pm.classify_user(user_id) {
                Some(t) => {
                    best = best.max(t);
                    for node in nodes {
                        pm.register_peer(*node, t);
                    }
                }
                None => {
                    for node in nodes {
                        pm.unregister_peer(node);
                    }
                }
            }
        }
        best
    }

    /// Binds `node` to `user_id` once identification succeeds.
    pub async fn set_peer_user(&self, node: NodeID, user_id: PttID) -> Result<()> {
        {
            let mut peers = self.peers.write();
            let peer = peers.get_mut(&node).ok_or(PttError::NotFound)?;
            match peer.user_id {
                Some(existing) if existing != user_id => return Err(PttError::InvalidNode),
                Some(_) => {}
                None => peer.user_id = Some(user_id),
            }
        }
        self.remember_user_node(user_id, node)?;

        let peer_type = self.classify_user_in_entities(&user_id, &[node]);
        self.upgrade_peer(&node, peer_type);
        info!(%node, user = %user_id, ?peer_type, "peer identified");
        Ok(())
    }

    fn remember_user_node(&self, user_id: PttID, node: NodeID) -> Result<()> {
        let nodes = {
            let mut user_nodes = self.user_nodes.write();
            let nodes = user_nodes.entry(user_id).or_default();
            if !nodes.insert(node) {
                return Ok(());
            }
            nodes.iter().copied().collect()
        };
        self.db.put_json(
            &db_key(&[prefix::USER_NODE, user_id.as_bytes()]),
            &UserNodes { user_id, nodes },
        )
    }

    /// Drops the peer from the pools and every entity.
    pub(crate) fn remove_peer(&self, node: &NodeID) -> Option<PttPeer> {
        let peer = self.peers.write().remove(node)?;
        for pm in self.entities() {
            pm.unregister_peer(node);
        }
        self.identify_challenges.lock().remove(node);
        self.peer_challenges.lock().remove(node);
        Some(peer)
    }

    /// Removes and disconnects a peer, from sync or async context.
    pub(crate) fn drop_peer(&self, node: NodeID) {
        self.remove_peer(&node);
        let transport = self.transport.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.disconnect(node).await {
                        debug!(%node, "disconnect: {}", e);
                    }
                });
            }
            Err(_) => debug!(%node, "no runtime to disconnect on"),
        }
    }

    /// Counts a protocol violation. Too many demote and disconnect.
    pub(crate) fn peer_violation(&self, node: &NodeID, err: &PttError) {
        let violations = {
            let mut peers = self.peers.write();
            let Some(peer) = peers.get_mut(node) else {
                return;
            };
            peer.violations += 1;
            peer.violations
        };
        warn!(%node, violations, "protocol violation: {}", err);
        if violations >= crate::config::MAX_PEER_VIOLATIONS {
            let _ = self.peers.write().set_peer_type(node, PeerType::Random, true);
            self.drop_peer(*node);
        }
    }

    // ========================================================================
    // DIALING
    // ========================================================================

    /// Records that the entity owning `op_key_hash` expects `node`.
    /// Returns false if the same node was dialed within the identify timeout.
    pub fn add_dial(&self, node: NodeID, op_key_hash: Address, peer_type: PeerType) -> bool {
        let now = Timestamp::now();
        let recent = now.add_secs(-(IDENTIFY_PEER_TIMEOUT.as_secs() as i64));
        let mut history = self.dial_history.lock();
        if let Some(dial) = history.get(&node) {
            if dial.ts > recent {
                return false;
            }
        }
        history.insert(node, DialInfo { op_key_hash, peer_type, ts: now });
        true
    }

    pub(crate) fn take_dial(&self, node: &NodeID) -> Option<DialInfo> {
        self.dial_history.lock().remove(node)
    }

    /// Dials the known, unconnected nodes of `users` on behalf of the
    /// entity owning `op_key_hash`.
    pub(crate) fn connect_users(&self, users: &[PttID], op_key_hash: Address, peer_type: PeerType) {
        let my_node = self.my_info.node_id;
        let mut to_dial = Vec::new();
        for user_id in users {
            for node in self.known_nodes_of_user(user_id) {
                if node == my_node || self.peers.read().contains(&node) {
                    continue;
                }
                if self.add_dial(node, op_key_hash, peer_type) {
                    to_dial.push(node);
                }
            }
        }
        if to_dial.is_empty() {
            return;
        }
        let transport = self.transport.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            for node in to_dial {
                if let Err(e) = transport.dial(node).await {
                    debug!(%node, "dial: {}", e);
                }
            }
        });
    }
}
