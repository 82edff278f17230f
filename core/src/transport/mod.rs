// Transport: framed peer-to-peer delivery behind one trait
//
// Ptt never sees sockets. It gets `TransportEvent`s on a channel and hands
// frames back through `PeerTransport`. `memory` wires nodes together in
// process; `swarm` runs the same contract over libp2p.

pub mod behaviour;
pub mod memory;
pub mod swarm;

pub use behaviour::{FrameRequest, FrameResponse, PttBehaviour};
pub use memory::{MemoryHub, MemoryTransport};
pub use swarm::{start_swarm, node_id_to_peer_id, peer_id_to_node_id, SwarmCommand, SwarmHandle};

use crate::types::NodeID;
use anyhow::Result;
use async_trait::async_trait;

/// Events delivered to Ptt, one channel per node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(NodeID),
    Disconnected(NodeID),
    Frame(NodeID, Vec<u8>),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_node_id(&self) -> NodeID;

    /// Delivers one frame. Frames above the protocol limit are refused.
    async fn send(&self, node: NodeID, frame: Vec<u8>) -> Result<()>;

    async fn dial(&self, node: NodeID) -> Result<()>;

    async fn disconnect(&self, node: NodeID) -> Result<()>;
}

pub(crate) fn check_frame_size(len: usize) -> Result<()> {
    if len > crate::config::PROTOCOL_MAX_MSG_SIZE {
        anyhow::bail!("frame too large: {} bytes", len);
    }
    Ok(())
}
