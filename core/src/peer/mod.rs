// Peers: one per open connection, classified by what we know about them

pub mod pool;

pub use pool::PeerPools;

use crate::types::{NodeID, PttID, Timestamp};
use serde::{Deserialize, Serialize};

/// Ordered: `Pending` is the admission gate for entity traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeerType {
    Err,
    Removed,
    Random,
    Pending,
    Member,
    Important,
    Hub,
    Me,
}

impl PeerType {
    /// Types that own a pool, weakest first.
    pub const POOLS: [PeerType; 6] = [
        PeerType::Random,
        PeerType::Pending,
        PeerType::Member,
        PeerType::Important,
        PeerType::Hub,
        PeerType::Me,
    ];

    pub fn has_pool(self) -> bool {
        self >= PeerType::Random
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PttPeer {
    pub node_id: NodeID,
    pub user_id: Option<PttID>,
    pub peer_type: PeerType,
    pub handshake_done: bool,
    pub violations: u32,
    pub connected_at: Timestamp,
}

impl PttPeer {
    pub fn new(node_id: NodeID, peer_type: PeerType) -> Self {
        Self {
            node_id,
            user_id: None,
            peer_type,
            handshake_done: false,
            violations: 0,
            connected_at: Timestamp::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_type_order_gate() {
        assert!(PeerType::Random < PeerType::Pending);
        assert!(PeerType::Member >= PeerType::Pending);
        assert!(PeerType::Me > PeerType::Hub);
        assert!(!PeerType::Removed.has_pool());
    }
}
