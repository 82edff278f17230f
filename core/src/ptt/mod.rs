// Ptt: the process-wide node with its peers, routing tables and entity dispatch
//
// One Ptt per process. It owns the peer pools, the fingerprint tables that
// route op-key and join-key traffic to entities, and the service registry.
// Transport events arrive on one channel and are handled in order.

pub mod codec;
pub mod handle;
pub mod identify;
pub mod join;
pub mod my_info;
pub mod op_key;
pub mod peers;

pub use join::{Invitation, JoinRequest, JoinStatus};
pub use my_info::MyInfo;

use crate::config::{PmConfig, PttConfig};
use crate::crypto::{encrypt_data, KeyInfo};
use crate::peer::PeerPools;
use crate::pm::ProtocolManager;
use crate::spm::{Service, ServiceProtocolManager};
use crate::store::Db;
use crate::transport::{PeerTransport, TransportEvent};
use crate::types::{Address, NodeID, PttID};
use crate::{PttError, Result};
use codec::{marshal_frame, marshal_plain, CodeType};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Ptt {
    config: PttConfig,
    pm_config: PmConfig,
    db: Db,
    my_info: Arc<MyInfo>,
    transport: Arc<dyn PeerTransport>,

    peers: RwLock<PeerPools>,
    /// Users' known devices, learned from identification.
    user_nodes: RwLock<HashMap<PttID, HashSet<NodeID>>>,
    dial_history: Mutex<HashMap<NodeID, peers::DialInfo>>,
    /// Challenges I sent, awaiting a proof.
    identify_challenges: Mutex<HashMap<NodeID, Vec<u8>>>,
    /// Challenges a peer sent me, answered once it proves itself.
    peer_challenges: Mutex<HashMap<NodeID, Vec<u8>>>,

    /// op-key fingerprint -> entity
    ops: RwLock<HashMap<Address, PttID>>,
    /// join-key fingerprint -> entity
    joins: RwLock<HashMap<Address, PttID>>,
    join_requests: Mutex<HashMap<Address, JoinRequest>>,

    entities: RwLock<HashMap<PttID, Arc<ProtocolManager>>>,
    services: RwLock<HashMap<String, Arc<ServiceProtocolManager>>>,

    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    self_ref: Weak<Ptt>,
}

impl Ptt {
    pub fn new(
        config: PttConfig,
        pm_config: PmConfig,
        db: Db,
        my_info: MyInfo,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>> {
        if transport.local_node_id() != my_info.node_id {
            return Err(PttError::InvalidNode);
        }
        let user_nodes = peers::load_user_nodes(&db)?;
        let (quit, _) = watch::channel(false);
        Ok(Arc::new_cyclic(|self_ref| Self {
            peers: RwLock::new(PeerPools::new(config.clone())),
            config,
            pm_config,
            db,
            my_info: Arc::new(my_info),
            transport,
            user_nodes: RwLock::new(user_nodes),
            dial_history: Mutex::new(HashMap::new()),
            identify_challenges: Mutex::new(HashMap::new()),
            peer_challenges: Mutex::new(HashMap::new()),
            ops: RwLock::new(HashMap::new()),
            joins: RwLock::new(HashMap::new()),
            join_requests: Mutex::new(HashMap::new()),
            entities: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            quit,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &PttConfig {
        &self.config
    }

    pub fn pm_config(&self) -> &PmConfig {
        &self.pm_config
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn my_info(&self) -> &Arc<MyInfo> {
        &self.my_info
    }

    pub fn node_id(&self) -> NodeID {
        self.my_info.node_id
    }

    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref.upgrade().ok_or(PttError::PeerShutdown)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Starts every registered service and the transport event loop.
    pub async fn start(&self, events: mpsc::UnboundedReceiver<TransportEvent>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PttError::AlreadyStarted);
        }
        let services: Vec<_> = self.services.read().values().cloned().collect();
        for spm in services {
            spm.start()?;
        }
        let this = self.arc()?;
        let task = tokio::spawn(this.event_loop(events, self.quit.subscribe()));
        self.tasks.lock().push(task);
        info!(node = %self.my_info.node_id, user = %self.my_info.user_id, "ptt started");
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.quit.send(true);
        let services: Vec<_> = self.services.read().values().cloned().collect();
        for spm in services {
            spm.stop();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let nodes: Vec<NodeID> = self.peers.read().all().iter().map(|p| p.node_id).collect();
        for node in nodes {
            if let Err(e) = self.transport.disconnect(node).await {
                debug!(%node, "disconnect: {}", e);
            }
        }
        if let Err(e) = self.db.flush() {
            warn!("flush on stop: {}", e);
        }
        self.started.store(false, Ordering::SeqCst);
        info!(node = %self.my_info.node_id, "ptt stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>, mut quit: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                _ = quit.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                TransportEvent::Connected(node) => self.handle_connected(node).await,
                TransportEvent::Disconnected(node) => self.handle_disconnected(&node),
                TransportEvent::Frame(node, bytes) => self.handle_frame(node, &bytes).await,
            }
        }
        debug!(node = %self.my_info.node_id, "event loop done");
    }

    // ========================================================================
    // SERVICES AND ENTITIES
    // ========================================================================

    /// Registers a service. Its entities start with the node, or at once
    /// if the node is already running.
    pub async fn register_service(&self, service: Arc<dyn Service>) -> Result<Arc<ServiceProtocolManager>> {
        let name = service.name().to_string();
        let spm = {
            let mut services = self.services.write();
            if services.contains_key(&name) {
                return Err(PttError::AlreadyRegistered);
            }
            let spm = ServiceProtocolManager::new(&self.arc()?, service);
            services.insert(name.clone(), spm.clone());
            spm
        };
        if self.is_started() {
            spm.start()?;
        }
        info!(service = %name, "service registered");
        Ok(spm)
    }

    pub fn service(&self, name: &str) -> Option<Arc<ServiceProtocolManager>> {
        self.services.read().get(name).cloned()
    }

    pub(crate) fn register_entity(&self, pm: Arc<ProtocolManager>) -> Result<()> {
        let mut entities = self.entities.write();
        if entities.contains_key(pm.entity_id()) {
            return Err(PttError::AlreadyRegistered);
        }
        entities.insert(*pm.entity_id(), pm);
        Ok(())
    }

    pub(crate) fn unregister_entity(&self, id: &PttID) -> Option<Arc<ProtocolManager>> {
        self.entities.write().remove(id)
    }

    pub fn entity(&self, id: &PttID) -> Option<Arc<ProtocolManager>> {
        self.entities.read().get(id).cloned()
    }

    pub fn entities(&self) -> Vec<Arc<ProtocolManager>> {
        self.entities.read().values().cloned().collect()
    }

    /// My personal entity, if one is hosted here.
    pub fn personal_entity(&self) -> Option<Arc<ProtocolManager>> {
        self.entities.read().values().find(|pm| pm.is_personal()).cloned()
    }

    /// Stops a deleted entity and drops it from its service.
    pub(crate) fn entity_deleted(&self, id: &PttID) {
        let Some(pm) = self.unregister_entity(id) else {
            return;
        };
        let service = pm.entity().service;
        if let Some(spm) = self.service(&service) {
            spm.remove_entity(id);
        }
        pm.stop();
    }

    // ========================================================================
    // ROUTING TABLES
    // ========================================================================

    pub(crate) fn register_op_key(&self, hash: Address, entity_id: PttID) {
        self.ops.write().insert(hash, entity_id);
    }

    pub(crate) fn remove_op_key(&self, hash: &Address) {
        self.ops.write().remove(hash);
    }

    pub(crate) fn register_join_key(&self, hash: Address, entity_id: PttID) {
        self.joins.write().insert(hash, entity_id);
    }

    pub(crate) fn remove_join_key(&self, hash: &Address) {
        self.joins.write().remove(hash);
    }

    /// Entity whose op-key has fingerprint `hash`.
    pub fn op_entity(&self, hash: &Address) -> Option<PttID> {
        self.ops.read().get(hash).copied()
    }

    pub fn join_entity(&self, hash: &Address) -> Option<PttID> {
        self.joins.read().get(hash).copied()
    }

    fn op_pm(&self, hash: &Address) -> Option<Arc<ProtocolManager>> {
        let entity_id = self.op_entity(hash)?;
        self.entity(&entity_id)
    }

    // ========================================================================
    // SENDING
    // ========================================================================

    pub(crate) async fn send_frame(&self, node: NodeID, frame: Vec<u8>) -> Result<()> {
        if !self.peers.read().contains(&node) {
            return Err(PttError::PeerShutdown);
        }
        self.transport
            .send(node, frame)
            .await
            .map_err(|e| PttError::Transport(e.to_string()))
    }

    /// Sends `op` under an entity op-key.
    pub(crate) async fn send_op(&self, node: NodeID, key: &KeyInfo, op: u32, data: &[u8]) -> Result<()> {
        self.send_encrypted(node, CodeType::Op, key, op, data).await
    }

    pub(crate) async fn send_encrypted(&self, node: NodeID, code: CodeType, key: &KeyInfo, op: u32, data: &[u8]) -> Result<()> {
        let enc = encrypt_data(op, data, key)?;
        let frame = marshal_frame(node, code, key.hash.as_bytes(), enc)?;
        self.send_frame(node, frame).await
    }

    pub(crate) async fn send_plain<T: Serialize>(&self, node: NodeID, code: CodeType, payload: &T) -> Result<()> {
        let frame = marshal_plain(node, code, payload)?;
        self.send_frame(node, frame).await
    }
}

impl Drop for Ptt {
    fn drop(&mut self) {
        let _ = self.quit.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerType, PttPeer};
    use crate::transport::MockPeerTransport;

    fn ptt_with(my_info: MyInfo, transport: MockPeerTransport) -> Result<Arc<Ptt>> {
        Ptt::new(
            PttConfig::default(),
            PmConfig::default(),
            Db::memory(),
            my_info,
            Arc::new(transport),
        )
    }

    #[test]
    fn test_rejects_foreign_transport() {
        let mut transport = MockPeerTransport::new();
        transport.expect_local_node_id().return_const(NodeID([7; 32]));
        let result = ptt_with(MyInfo::generate("alice"), transport);
        assert_eq!(result.err(), Some(PttError::InvalidNode));
    }

    #[tokio::test]
    async fn test_send_frame_needs_registered_peer() {
        let my_info = MyInfo::generate("alice");
        let peer = NodeID([9; 32]);
        let mut transport = MockPeerTransport::new();
        transport.expect_local_node_id().return_const(my_info.node_id);
        transport
            .expect_send()
            .withf(move |node, _| *node == peer)
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("link closed")));
        let ptt = ptt_with(my_info, transport).expect("Failed to create ptt");

        assert_eq!(ptt.send_frame(peer, vec![1]).await, Err(PttError::PeerShutdown));

        ptt.peers
            .write()
            .add(PttPeer::new(peer, PeerType::Random))
            .expect("Failed to add peer");
        assert!(matches!(
            ptt.send_frame(peer, vec![1]).await,
            Err(PttError::Transport(_))
        ));
    }
}
