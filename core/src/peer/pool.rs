// Peer pools partitioned by peer type, with per-pool and global caps

use super::{PeerType, PttPeer};
use crate::config::PttConfig;
use crate::types::{NodeID, PttID};
use crate::{PttError, Result};
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Every peer sits in exactly one pool. Moving a peer between pools
/// happens under one `&mut self` borrow.
pub struct PeerPools {
    config: PttConfig,
    peers: HashMap<NodeID, PttPeer>,
    pools: HashMap<PeerType, HashSet<NodeID>>,
}

impl PeerPools {
    pub fn new(config: PttConfig) -> Self {
        let pools = PeerType::POOLS.iter().map(|t| (*t, HashSet::new())).collect();
        Self {
            config,
            peers: HashMap::new(),
            pools,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, node: &NodeID) -> Option<&PttPeer> {
        self.peers.get(node)
    }

    pub fn get_mut(&mut self, node: &NodeID) -> Option<&mut PttPeer> {
        self.peers.get_mut(node)
    }

    pub fn contains(&self, node: &NodeID) -> bool {
        self.peers.contains_key(node)
    }

    fn cap(&self, peer_type: PeerType) -> usize {
        match peer_type {
            PeerType::Me => usize::MAX,
            PeerType::Hub => self.config.max_hub_peers,
            PeerType::Important => self.config.max_important_peers,
            PeerType::Member => self.config.max_member_peers,
            PeerType::Pending => self.config.max_pending_peers,
            PeerType::Random => self.config.max_random_peers,
            PeerType::Err | PeerType::Removed => 0,
        }
    }

    pub fn pool_len(&self, peer_type: PeerType) -> usize {
        self.pools.get(&peer_type).map(|p| p.len()).unwrap_or(0)
    }

    /// Makes room for one more peer of `peer_type`. Returns the evicted
    /// node, if any.
    fn make_room(&mut self, peer_type: PeerType) -> Result<Option<NodeID>> {
        if !peer_type.has_pool() {
            return Err(PttError::InvalidNode);
        }
        if self.pool_len(peer_type) >= self.cap(peer_type) {
            return match self.drop_from_pool(peer_type) {
                Some(node) => Ok(Some(node)),
                None => Err(PttError::TooManyPeers),
            };
        }
        if self.peers.len() >= self.config.max_peers {
            return match self.drop_any_peer(peer_type) {
                Some(node) => Ok(Some(node)),
                None => Err(PttError::TooManyPeers),
            };
        }
        Ok(None)
    }

    pub fn add(&mut self, peer: PttPeer) -> Result<Option<NodeID>> {
        if self.peers.contains_key(&peer.node_id) {
            return Err(PttError::AlreadyRegistered);
        }
        let evicted = self.make_room(peer.peer_type)?;
        if let Some(pool) = self.pools.get_mut(&peer.peer_type) {
            pool.insert(peer.node_id);
        }
        self.peers.insert(peer.node_id, peer);
        Ok(evicted)
    }

    /// Moves a peer to another pool. Demotion needs `force`.
    pub fn set_peer_type(&mut self, node: &NodeID, peer_type: PeerType, force: bool) -> Result<Option<NodeID>> {
        let current = self.peers.get(node).ok_or(PttError::NotFound)?.peer_type;
        if current == peer_type {
            return Ok(None);
        }
        if peer_type < current && !force {
            return Err(PttError::InvalidStatus);
        }

        // The moving peer leaves its pool first so it never evicts itself.
        if let Some(pool) = self.pools.get_mut(&current) {
            pool.remove(node);
        }
        let evicted = match self.make_room_excluding(peer_type, node) {
            Ok(evicted) => evicted,
            Err(e) => {
                if let Some(pool) = self.pools.get_mut(&current) {
                    pool.insert(*node);
                }
                return Err(e);
            }
        };
        if let Some(pool) = self.pools.get_mut(&peer_type) {
            pool.insert(*node);
        }
        if let Some(peer) = self.peers.get_mut(node) {
            peer.peer_type = peer_type;
        }
        debug!(node = %node, from = ?current, to = ?peer_type, "set peer type");
        Ok(evicted)
    }

    fn make_room_excluding(&mut self, peer_type: PeerType, node: &NodeID) -> Result<Option<NodeID>> {
        if !peer_type.has_pool() {
            return Err(PttError::InvalidNode);
        }
        if self.pool_len(peer_type) >= self.cap(peer_type) {
            let victim = self
                .pools
                .get(&peer_type)
                .and_then(|p| p.iter().filter(|n| *n != node).choose(&mut rand::thread_rng()).copied());
            return match victim {
                Some(victim) => {
                    self.remove(&victim);
                    Ok(Some(victim))
                }
                None => Err(PttError::TooManyPeers),
            };
        }
        Ok(None)
    }

    pub fn remove(&mut self, node: &NodeID) -> Option<PttPeer> {
        let peer = self.peers.remove(node)?;
        if let Some(pool) = self.pools.get_mut(&peer.peer_type) {
            pool.remove(node);
        }
        Some(peer)
    }

    fn drop_from_pool(&mut self, peer_type: PeerType) -> Option<NodeID> {
        let victim = self
            .pools
            .get(&peer_type)?
            .iter()
            .choose(&mut rand::thread_rng())
            .copied()?;
        self.remove(&victim);
        Some(victim)
    }

    /// Evicts a random peer from the weakest non-empty pool at or below
    /// `peer_type`. Me-peers are never evicted.
    pub fn drop_any_peer(&mut self, peer_type: PeerType) -> Option<NodeID> {
        for pool_type in PeerType::POOLS {
            if pool_type > peer_type || pool_type == PeerType::Me {
                break;
            }
            if self.pool_len(pool_type) > 0 {
                return self.drop_from_pool(pool_type);
            }
        }
        None
    }

    pub fn nodes_of_type(&self, peer_type: PeerType) -> Vec<NodeID> {
        self.pools
            .get(&peer_type)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn nodes_of_user(&self, user_id: &PttID) -> Vec<NodeID> {
        self.peers
            .values()
            .filter(|p| p.user_id.as_ref() == Some(user_id))
            .map(|p| p.node_id)
            .collect()
    }

    pub fn all(&self) -> Vec<PttPeer> {
        self.peers.values().cloned().collect()
    }
}
