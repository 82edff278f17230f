// A running node: Ptt over the libp2p swarm
//
// Each start builds a fresh Ptt and swarm over the same store, which is
// how `restart` brings a node back without leaving the process.

use crate::config::Config;
use anyhow::{Context, Result};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use ptt_core::store::Db;
use ptt_core::transport::{peer_id_to_node_id, start_swarm, PeerTransport, SwarmHandle};
use ptt_core::{DefaultService, MyInfo, NodeID, PmConfig, Ptt, ServiceProtocolManager};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The service every CLI node hosts.
pub const BOARD_SERVICE: &str = "board";

pub struct Node {
    pub ptt: Arc<Ptt>,
    pub board: Arc<ServiceProtocolManager>,
    pub swarm: SwarmHandle,
}

impl Node {
    pub async fn start(config: &Config, db: Db, my_info: MyInfo) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port).parse()?;
        let swarm = start_swarm(&my_info.node_key, Some(listen_addr), event_tx)
            .await
            .context("Failed to start network")?;

        let ptt = Ptt::new(
            config.ptt_config(),
            PmConfig::default(),
            db,
            my_info,
            Arc::new(swarm.clone()),
        )
        .context("Failed to create node")?;
        let board = ptt
            .register_service(Arc::new(DefaultService::new(BOARD_SERVICE)))
            .await
            .context("Failed to register service")?;
        ptt.start(event_rx).await.context("Failed to start node")?;

        let node = Self { ptt, board, swarm };
        for addr in &config.bootstrap_nodes {
            if let Err(e) = node.dial_addr(addr).await {
                warn!(%addr, "bootstrap dial failed: {}", e);
            }
        }
        info!(node = %node.ptt.node_id(), "node up");
        Ok(node)
    }

    /// Dials a `/p2p/<peer id>`-terminated multiaddr.
    pub async fn dial_addr(&self, addr: &str) -> Result<NodeID> {
        let (node, addr) = parse_peer_addr(addr)?;
        self.swarm.add_address(node, addr).await?;
        self.swarm.dial(node).await?;
        Ok(node)
    }

    pub async fn stop(&self) {
        self.ptt.stop().await;
        if let Err(e) = self.swarm.shutdown().await {
            warn!("swarm shutdown: {}", e);
        }
    }
}

/// Splits `/ip4/../tcp/../p2p/<peer id>` into the node id and the
/// transport address.
pub fn parse_peer_addr(addr: &str) -> Result<(NodeID, Multiaddr)> {
    let mut addr: Multiaddr = addr.parse().context("Invalid multiaddr")?;
    let peer_id: PeerId = match addr.pop() {
        Some(Protocol::P2p(peer_id)) => peer_id,
        _ => anyhow::bail!("Address must end in /p2p/<peer id>"),
    };
    let node = peer_id_to_node_id(&peer_id).context("Peer id is not an ed25519 node id")?;
    Ok((node, addr))
}
