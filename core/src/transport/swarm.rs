// libp2p swarm: the running network node behind `PeerTransport`
//
// TCP + DNS, Noise encryption, Yamux multiplexing, and the behaviours from
// behaviour.rs. A node id is the ed25519 public key of the libp2p identity,
// so node ids and peer ids convert both ways without a lookup table.

use super::behaviour::{FrameRequest, FrameResponse, PttBehaviour, PttBehaviourEvent};
use super::{check_frame_size, PeerTransport, TransportEvent};
use crate::types::NodeID;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use futures::StreamExt;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::{identify, identity, request_response, swarm::SwarmEvent, Multiaddr, PeerId};
use std::collections::HashMap;
use tokio::sync::mpsc;

pub fn node_id_to_peer_id(node: &NodeID) -> Result<PeerId> {
    let pubkey = identity::ed25519::PublicKey::try_from_bytes(&node.0).context("invalid node id")?;
    Ok(identity::PublicKey::from(pubkey).to_peer_id())
}

/// Only ed25519 peer ids (identity multihash) map back to a node id.
pub fn peer_id_to_node_id(peer_id: &PeerId) -> Option<NodeID> {
    let multihash = peer_id.as_ref();
    if multihash.code() != 0 {
        return None;
    }
    let pubkey = identity::PublicKey::try_decode_protobuf(multihash.digest()).ok()?;
    let pubkey = pubkey.try_into_ed25519().ok()?;
    Some(NodeID(pubkey.to_bytes()))
}

/// Commands that can be sent to the swarm task
#[derive(Debug)]
pub enum SwarmCommand {
    SendFrame {
        peer_id: PeerId,
        data: Vec<u8>,
        reply: mpsc::Sender<Result<(), String>>,
    },
    Dial {
        peer_id: PeerId,
        reply: mpsc::Sender<Result<(), String>>,
    },
    Disconnect {
        peer_id: PeerId,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Remember an address to dial a peer at
    AddAddress { peer_id: PeerId, addr: Multiaddr },
    Listen {
        addr: Multiaddr,
        reply: mpsc::Sender<Result<(), String>>,
    },
    GetPeers { reply: mpsc::Sender<Vec<PeerId>> },
    Shutdown,
}

/// Handle to communicate with the running swarm task
#[derive(Clone)]
pub struct SwarmHandle {
    node_id: NodeID,
    command_tx: mpsc::Sender<SwarmCommand>,
}

impl SwarmHandle {
    async fn request(&self, command: SwarmCommand, mut reply_rx: mpsc::Receiver<Result<(), String>>) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| anyhow!("Swarm task not running"))?;

        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("No reply from swarm"))?
            .map_err(|e| anyhow!(e))
    }

    pub async fn listen(&self, addr: Multiaddr) -> Result<()> {
        let (reply, reply_rx) = mpsc::channel(1);
        self.request(SwarmCommand::Listen { addr, reply }, reply_rx).await
    }

    pub async fn add_address(&self, node: NodeID, addr: Multiaddr) -> Result<()> {
        let peer_id = node_id_to_peer_id(&node)?;
        self.command_tx
            .send(SwarmCommand::AddAddress { peer_id, addr })
            .await
            .map_err(|_| anyhow!("Swarm task not running"))
    }

    pub async fn get_peers(&self) -> Result<Vec<NodeID>> {
        let (reply, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(SwarmCommand::GetPeers { reply })
            .await
            .map_err(|_| anyhow!("Swarm task not running"))?;

        let peers = reply_rx.recv().await.ok_or_else(|| anyhow!("No reply from swarm"))?;
        Ok(peers.iter().filter_map(peer_id_to_node_id).collect())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(SwarmCommand::Shutdown)
            .await
            .map_err(|_| anyhow!("Swarm task not running"))
    }
}

#[async_trait]
impl PeerTransport for SwarmHandle {
    fn local_node_id(&self) -> NodeID {
        self.node_id
    }

    async fn send(&self, node: NodeID, frame: Vec<u8>) -> Result<()> {
        check_frame_size(frame.len())?;
        let peer_id = node_id_to_peer_id(&node)?;
        let (reply, reply_rx) = mpsc::channel(1);
        self.request(
            SwarmCommand::SendFrame {
                peer_id,
                data: frame,
                reply,
            },
            reply_rx,
        )
        .await
    }

    async fn dial(&self, node: NodeID) -> Result<()> {
        let peer_id = node_id_to_peer_id(&node)?;
        let (reply, reply_rx) = mpsc::channel(1);
        self.request(SwarmCommand::Dial { peer_id, reply }, reply_rx).await
    }

    async fn disconnect(&self, node: NodeID) -> Result<()> {
        let peer_id = node_id_to_peer_id(&node)?;
        let (reply, reply_rx) = mpsc::channel(1);
        self.request(SwarmCommand::Disconnect { peer_id, reply }, reply_rx).await
    }
}

/// Build and start the libp2p swarm under the node signing key.
///
/// This spawns a tokio task that runs the swarm event loop and forwards
/// connection changes and frames to `event_tx`.
pub async fn start_swarm(
    node_key: &SigningKey,
    listen_addr: Option<Multiaddr>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) -> Result<SwarmHandle> {
    let keypair = identity::Keypair::ed25519_from_bytes(node_key.to_bytes()).context("invalid node key")?;
    let node_id = NodeID(node_key.verifying_key().to_bytes());

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )?
        .with_dns()?
        .with_behaviour(|key| PttBehaviour::new(key))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(std::time::Duration::from_secs(300)))
        .build();

    let addr = match listen_addr {
        Some(addr) => addr,
        None => "/ip4/0.0.0.0/tcp/0".parse()?,
    };
    swarm.listen_on(addr)?;

    let (command_tx, mut command_rx) = mpsc::channel::<SwarmCommand>(256);
    let handle = SwarmHandle { node_id, command_tx };

    let mut known_addrs: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(PttBehaviourEvent::Frames(
                            request_response::Event::Message { peer, message, .. }
                        )) => {
                            if let request_response::Message::Request { request, channel, .. } = message {
                                let accepted = match peer_id_to_node_id(&peer) {
                                    Some(node) if request.data.len() <= crate::config::PROTOCOL_MAX_MSG_SIZE => {
                                        let _ = event_tx.send(TransportEvent::Frame(node, request.data));
                                        FrameResponse { accepted: true, error: None }
                                    }
                                    Some(_) => FrameResponse { accepted: false, error: Some("frame too large".to_string()) },
                                    None => FrameResponse { accepted: false, error: Some("unsupported peer id".to_string()) },
                                };
                                let _ = swarm.behaviour_mut().frames.send_response(channel, accepted);
                            }
                        }

                        SwarmEvent::Behaviour(PttBehaviourEvent::Frames(
                            request_response::Event::OutboundFailure { peer, error, .. }
                        )) => {
                            tracing::warn!("Frame to {} failed: {}", peer, error);
                        }

                        SwarmEvent::Behaviour(PttBehaviourEvent::Identify(
                            identify::Event::Received { peer_id, info, .. }
                        )) => {
                            tracing::debug!("Identified peer {} with {} addresses", peer_id, info.listen_addrs.len());
                            let addrs = known_addrs.entry(peer_id).or_default();
                            for addr in info.listen_addrs {
                                if !addrs.contains(&addr) {
                                    addrs.push(addr);
                                }
                            }
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            tracing::info!("Listening on {}", address);
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, num_established, .. } => {
                            tracing::info!("Connected to {} via {}", peer_id, endpoint.get_remote_address());
                            if num_established.get() == 1 {
                                match peer_id_to_node_id(&peer_id) {
                                    Some(node) => { let _ = event_tx.send(TransportEvent::Connected(node)); }
                                    None => { let _ = swarm.disconnect_peer_id(peer_id); }
                                }
                            }
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            tracing::info!("Disconnected from {}", peer_id);
                            if num_established == 0 {
                                if let Some(node) = peer_id_to_node_id(&peer_id) {
                                    let _ = event_tx.send(TransportEvent::Disconnected(node));
                                }
                            }
                        }

                        _ => {}
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SwarmCommand::SendFrame { peer_id, data, reply } => {
                            if swarm.is_connected(&peer_id) {
                                swarm.behaviour_mut().frames.send_request(&peer_id, FrameRequest { data });
                                let _ = reply.send(Ok(())).await;
                            } else {
                                let _ = reply.send(Err(format!("not connected to {}", peer_id))).await;
                            }
                        }

                        SwarmCommand::Dial { peer_id, reply } => {
                            let opts = match known_addrs.get(&peer_id) {
                                Some(addrs) => DialOpts::peer_id(peer_id).addresses(addrs.clone()).build(),
                                None => DialOpts::peer_id(peer_id).build(),
                            };
                            let result = swarm.dial(opts).map_err(|e| e.to_string());
                            let _ = reply.send(result).await;
                        }

                        SwarmCommand::Disconnect { peer_id, reply } => {
                            let _ = swarm.disconnect_peer_id(peer_id);
                            let _ = reply.send(Ok(())).await;
                        }

                        SwarmCommand::AddAddress { peer_id, addr } => {
                            let addrs = known_addrs.entry(peer_id).or_default();
                            if !addrs.contains(&addr) {
                                addrs.push(addr);
                            }
                        }

                        SwarmCommand::Listen { addr, reply } => {
                            let result = swarm.listen_on(addr).map(|_| ()).map_err(|e| e.to_string());
                            let _ = reply.send(result).await;
                        }

                        SwarmCommand::GetPeers { reply } => {
                            let peers: Vec<PeerId> = swarm.connected_peers().cloned().collect();
                            let _ = reply.send(peers).await;
                        }

                        SwarmCommand::Shutdown => {
                            tracing::info!("Swarm shutting down");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(handle)
}
