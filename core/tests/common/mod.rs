//! Shared harness: in-process nodes on a MemoryHub with short sync timers

#![allow(dead_code)]

use ptt_core::entity::JoinType;
use ptt_core::store::Db;
use ptt_core::transport::{MemoryHub, MemoryTransport};
use ptt_core::{DefaultService, MyInfo, PmConfig, ProtocolManager, Ptt, PttConfig, ServiceProtocolManager};
use std::sync::Arc;
use std::time::Duration;

pub const SERVICE: &str = "board";

pub struct TestNode {
    pub ptt: Arc<Ptt>,
    pub spm: Arc<ServiceProtocolManager>,
    pub transport: Arc<MemoryTransport>,
}

impl TestNode {
    pub fn node_id(&self) -> ptt_core::NodeID {
        self.ptt.node_id()
    }

    pub fn user_id(&self) -> ptt_core::PttID {
        self.ptt.my_info().user_id
    }
}

/// Honors RUST_LOG; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_pm_config() -> PmConfig {
    PmConfig {
        min_sync_random_seconds: 1,
        max_sync_random_seconds: 2,
        generate_merkle_seconds: 1,
        ..PmConfig::default()
    }
}

pub async fn spawn_node(hub: &MemoryHub, name: &str) -> TestNode {
    spawn_node_with(hub, MyInfo::generate(name), Db::memory()).await
}

pub async fn spawn_node_with(hub: &MemoryHub, my_info: MyInfo, db: Db) -> TestNode {
    spawn_node_config(hub, my_info, db, PttConfig::default()).await
}

pub async fn spawn_node_config(hub: &MemoryHub, my_info: MyInfo, db: Db, config: PttConfig) -> TestNode {
    spawn_node_full(hub, my_info, db, config, fast_pm_config()).await
}

/// A node whose entities run with `pm_config`.
pub async fn spawn_node_pm(hub: &MemoryHub, name: &str, pm_config: PmConfig) -> TestNode {
    spawn_node_full(hub, MyInfo::generate(name), Db::memory(), PttConfig::default(), pm_config).await
}

pub async fn spawn_node_full(
    hub: &MemoryHub,
    my_info: MyInfo,
    db: Db,
    config: PttConfig,
    pm_config: PmConfig,
) -> TestNode {
    init_tracing();
    let (transport, events) = hub.join(my_info.node_id);
    let ptt = Ptt::new(config, pm_config, db, my_info, transport.clone())
        .expect("Failed to create node");
    let spm = ptt
        .register_service(Arc::new(DefaultService::new(SERVICE)))
        .await
        .expect("Failed to register service");
    ptt.start(events).await.expect("Failed to start node");
    TestNode { ptt, spm, transport }
}

/// Polls `check` until it holds, failing the test after 15 seconds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Dials `b` from `a` and waits until both sides know each other's user.
pub async fn connect(a: &TestNode, b: &TestNode) {
    use ptt_core::transport::PeerTransport;
    a.transport.dial(b.node_id()).await.expect("Failed to dial");
    let (a_user, b_user) = (a.user_id(), b.user_id());
    wait_until("mutual identify", || {
        a.ptt.peer_user(&b.node_id()) == Some(b_user) && b.ptt.peer_user(&a.node_id()) == Some(a_user)
    })
    .await;
}

/// `joiner` joins `entity` through one of its invitations.
pub async fn join(entity: &Arc<ProtocolManager>, joiner: &TestNode) -> Arc<ProtocolManager> {
    let invitation = entity.invitation(JoinType::Entity).expect("Failed to create invitation");
    joiner.ptt.join(invitation).await.expect("Failed to start join");
    let id = *entity.entity_id();
    wait_until("joined entity", || joiner.ptt.entity(&id).is_some_and(|pm| pm.is_started())).await;
    let joined = joiner.ptt.entity(&id).expect("joined entity missing");
    let joiner_id = joiner.user_id();
    wait_until("host sees member", || entity.is_member(&joiner_id)).await;
    joined
}
