// In-process transport: a hub of node inboxes

use super::{check_frame_size, PeerTransport, TransportEvent};
use crate::types::NodeID;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct HubInner {
    inboxes: HashMap<NodeID, mpsc::UnboundedSender<TransportEvent>>,
    links: HashSet<(NodeID, NodeID)>,
}

fn link(a: NodeID, b: NodeID) -> (NodeID, NodeID) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shared switchboard. Cloning shares the same hub.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<RwLock<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node` and returns its transport plus its event stream.
    pub fn join(&self, node: NodeID) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().inboxes.insert(node, tx);
        let transport = Arc::new(MemoryTransport {
            node,
            hub: self.clone(),
        });
        (transport, rx)
    }

    /// Drops a node and tells everyone linked to it.
    pub fn leave(&self, node: &NodeID) {
        let mut inner = self.inner.write();
        inner.inboxes.remove(node);
        let peers: Vec<NodeID> = inner
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == node {
                    Some(*b)
                } else if b == node {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect();
        for peer in peers {
            inner.links.remove(&link(*node, peer));
            if let Some(tx) = inner.inboxes.get(&peer) {
                let _ = tx.send(TransportEvent::Disconnected(*node));
            }
        }
    }

    pub fn is_linked(&self, a: &NodeID, b: &NodeID) -> bool {
        self.inner.read().links.contains(&link(*a, *b))
    }
}

pub struct MemoryTransport {
    node: NodeID,
    hub: MemoryHub,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_node_id(&self) -> NodeID {
        self.node
    }

    async fn send(&self, node: NodeID, frame: Vec<u8>) -> Result<()> {
        check_frame_size(frame.len())?;
        let inner = self.hub.inner.read();
        if !inner.links.contains(&link(self.node, node)) {
            return Err(anyhow!("not connected to {}", node));
        }
        let tx = inner.inboxes.get(&node).ok_or_else(|| anyhow!("unknown node {}", node))?;
        tx.send(TransportEvent::Frame(self.node, frame))
            .map_err(|_| anyhow!("node {} is gone", node))
    }

    async fn dial(&self, node: NodeID) -> Result<()> {
        let mut inner = self.hub.inner.write();
        if node == self.node {
            return Err(anyhow!("cannot dial self"));
        }
        if !inner.inboxes.contains_key(&node) {
            return Err(anyhow!("unknown node {}", node));
        }
        if !inner.links.insert(link(self.node, node)) {
            return Ok(());
        }
        debug!(from = %self.node, to = %node, "memory dial");
        if let Some(tx) = inner.inboxes.get(&self.node) {
            let _ = tx.send(TransportEvent::Connected(node));
        }
        if let Some(tx) = inner.inboxes.get(&node) {
            let _ = tx.send(TransportEvent::Connected(self.node));
        }
        Ok(())
    }

    async fn disconnect(&self, node: NodeID) -> Result<()> {
        let mut inner = self.hub.inner.write();
        if !inner.links.remove(&link(self.node, node)) {
            return Ok(());
        }
        if let Some(tx) = inner.inboxes.get(&self.node) {
            let _ = tx.send(TransportEvent::Disconnected(node));
        }
        if let Some(tx) = inner.inboxes.get(&node) {
            let _ = tx.send(TransportEvent::Disconnected(self.node));
        }
        Ok(())
    }
}
