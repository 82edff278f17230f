// Protocol manager: one per entity
//
// Owns the entity's masters, members, op-keys and join-keys together with
// the four oplog families that drive them, and runs the entity's sync,
// op-key rotation, Merkle generation and send fan-out tasks.

pub mod entity;
pub mod handle;
pub mod identify;
pub mod join;
pub mod master;
pub mod member;
pub mod message;
pub mod op_key;
pub mod oplog;
pub mod peer;
pub mod person;
pub mod sync;

pub use message::{OpType, SyncOp};
pub use op_key::OpKeyRing;
pub use oplog::{broadcast_plan, BroadcastBatch, SealRule};
pub use sync::is_to_sync_peer;

use crate::config::PmConfig;
use crate::crypto::KeyInfo;
use crate::entity::{EntityHooks, EntityInfo};
use crate::object::{ObjectStore, Person};
use crate::oplog::{OplogFamily, OplogStore};
use crate::peer::PeerType;
use crate::ptt::{MyInfo, Ptt};
use crate::store::{db_key, prefix, Db};
use crate::types::{Address, LockMap, NodeID, PttID, Status};
use crate::{PttError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const NEW_PEER_CHANNEL_SIZE: usize = 32;
const SEND_CHANNEL_SIZE: usize = 256;

/// One fan-out job: the same op sent to every listed peer under the
/// oldest valid op-key at send time.
#[derive(Debug)]
pub(crate) struct SendEvent {
    pub op: OpType,
    pub data: Vec<u8>,
    pub peers: Vec<NodeID>,
}

pub(crate) struct JoinChallenge {
    pub challenge: Vec<u8>,
    pub hash: Address,
}

/// A verified joiner waiting for the hooks or the user to approve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmJoin {
    pub user_id: PttID,
    pub node: NodeID,
    pub join_key_hash: Address,
}

pub struct ProtocolManager {
    ptt: Weak<Ptt>,
    my_info: Arc<MyInfo>,
    config: PmConfig,
    hooks: Arc<dyn EntityHooks>,
    db: Db,
    entity_id: PttID,
    entity: RwLock<EntityInfo>,

    master_oplogs: OplogStore,
    member_oplogs: OplogStore,
    op_key_oplogs: OplogStore,
    entity_oplogs: OplogStore,

    masters_obj: ObjectStore<Person>,
    members_obj: ObjectStore<Person>,
    op_key_obj: ObjectStore<KeyInfo>,

    masters: RwLock<HashMap<PttID, Person>>,
    newest_master_log_id: RwLock<Option<PttID>>,
    op_keys: RwLock<OpKeyRing>,
    join_keys: RwLock<Vec<KeyInfo>>,
    join_challenges: Mutex<HashMap<NodeID, JoinChallenge>>,
    confirm_joins: Mutex<HashMap<PttID, ConfirmJoin>>,
    identify_challenges: Mutex<HashMap<NodeID, Vec<u8>>>,
    peers: RwLock<HashMap<NodeID, PeerType>>,

    /// Serializes approve-join and entity-level writes.
    entity_lock: tokio::sync::Mutex<()>,

    new_peer_tx: mpsc::Sender<NodeID>,
    new_peer_rx: Mutex<Option<mpsc::Receiver<NodeID>>>,
    send_tx: mpsc::Sender<SendEvent>,
    send_rx: Mutex<Option<mpsc::Receiver<SendEvent>>>,
    force_sync: Notify,
    force_op_key: Notify,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    self_ref: Weak<ProtocolManager>,
}

fn new_locks(config: &PmConfig) -> LockMap {
    LockMap::new(config.sleep_time_lock(), config.n_iter_lock)
}

impl ProtocolManager {
    pub fn new(ptt: &Arc<Ptt>, entity: EntityInfo, hooks: Arc<dyn EntityHooks>) -> Arc<Self> {
        let config = ptt.pm_config().clone();
        let db = ptt.db().clone();
        let entity_id = entity.id;
        let expire_generate = config.expire_generate_merkle_seconds;
        let oplogs = |family| OplogStore::new(db.clone(), family, entity_id, new_locks(&config), expire_generate);

        let master_oplogs = oplogs(OplogFamily::Master);
        let member_oplogs = oplogs(OplogFamily::Member);
        let op_key_oplogs = oplogs(OplogFamily::OpKey);
        let entity_oplogs = oplogs(OplogFamily::Ptt);

        let masters_obj = ObjectStore::new(db.clone(), prefix::MASTER_OBJ, &entity_id, new_locks(&config));
        let members_obj = ObjectStore::new(db.clone(), prefix::MEMBER_OBJ, &entity_id, new_locks(&config));
        let op_key_obj = ObjectStore::new(db.clone(), prefix::OP_KEY, &entity_id, new_locks(&config));

        let (new_peer_tx, new_peer_rx) = mpsc::channel(NEW_PEER_CHANNEL_SIZE);
        let (send_tx, send_rx) = mpsc::channel(SEND_CHANNEL_SIZE);
        let (quit, _) = watch::channel(false);

        Arc::new_cyclic(|self_ref| Self {
            ptt: Arc::downgrade(ptt),
            my_info: ptt.my_info().clone(),
            config,
            hooks,
            db,
            entity_id,
            entity: RwLock::new(entity),
            master_oplogs,
            member_oplogs,
            op_key_oplogs,
            entity_oplogs,
            masters_obj,
            members_obj,
            op_key_obj,
            masters: RwLock::new(HashMap::new()),
            newest_master_log_id: RwLock::new(None),
            op_keys: RwLock::new(OpKeyRing::new()),
            join_keys: RwLock::new(Vec::new()),
            join_challenges: Mutex::new(HashMap::new()),
            confirm_joins: Mutex::new(HashMap::new()),
            identify_challenges: Mutex::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            entity_lock: tokio::sync::Mutex::new(()),
            new_peer_tx,
            new_peer_rx: Mutex::new(Some(new_peer_rx)),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            force_sync: Notify::new(),
            force_op_key: Notify::new(),
            quit,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn entity_id(&self) -> &PttID {
        &self.entity_id
    }

    pub fn entity(&self) -> EntityInfo {
        self.entity.read().clone()
    }

    pub fn status(&self) -> Status {
        self.entity.read().status
    }

    pub fn is_personal(&self) -> bool {
        self.entity.read().personal
    }

    pub fn config(&self) -> &PmConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<dyn EntityHooks> {
        &self.hooks
    }

    pub fn my_info(&self) -> &Arc<MyInfo> {
        &self.my_info
    }

    pub fn oplogs(&self, family: OplogFamily) -> &OplogStore {
        match family {
            OplogFamily::Master => &self.master_oplogs,
            OplogFamily::Member => &self.member_oplogs,
            OplogFamily::OpKey => &self.op_key_oplogs,
            OplogFamily::Ptt => &self.entity_oplogs,
        }
    }

    pub(crate) fn ptt(&self) -> Result<Arc<Ptt>> {
        self.ptt.upgrade().ok_or(PttError::PeerShutdown)
    }

    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref.upgrade().ok_or(PttError::InvalidEntity)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    // ========================================================================
    // ENTITY RECORD
    // ========================================================================

    pub(crate) fn entity_key(id: &PttID) -> Vec<u8> {
        db_key(&[prefix::ENTITY, id.as_bytes()])
    }

    pub fn save_entity(&self) -> Result<()> {
        let entity = self.entity.read().clone();
        self.db.put_json(&Self::entity_key(&self.entity_id), &entity)
    }

    pub(crate) fn update_entity<F: FnOnce(&mut EntityInfo)>(&self, f: F) -> Result<()> {
        {
            let mut entity = self.entity.write();
            f(&mut entity);
        }
        self.save_entity()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Loads persisted state and spawns the background tasks.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PttError::AlreadyStarted);
        }
        self.load_masters()?;
        self.load_op_keys()?;
        if self.is_master(&self.my_info.user_id) && self.join_keys.read().is_empty() {
            self.create_join_key()?;
        }

        let this = self.arc()?;
        let new_peer_rx = self.new_peer_rx.lock().take().ok_or(PttError::AlreadyStarted)?;
        let send_rx = self.send_rx.lock().take().ok_or(PttError::AlreadyStarted)?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(this.clone().sync_loop(new_peer_rx, self.quit.subscribe())));
        tasks.push(tokio::spawn(this.clone().op_key_loop(self.quit.subscribe())));
        tasks.push(tokio::spawn(this.clone().send_loop(send_rx, self.quit.subscribe())));
        for family in [OplogFamily::Master, OplogFamily::Member] {
            tasks.push(tokio::spawn(this.clone().merkle_loop(family, self.quit.subscribe())));
        }
        info!(entity = %self.entity_id, "entity started");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.quit.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for hash in self.op_keys.read().hashes() {
            if let Ok(ptt) = self.ptt() {
                ptt.remove_op_key(&hash);
            }
        }
        for key in self.join_keys.read().iter() {
            if let Ok(ptt) = self.ptt() {
                ptt.remove_join_key(&key.hash);
            }
        }
        info!(entity = %self.entity_id, "entity stopped");
    }

    pub fn force_sync(&self) {
        self.force_sync.notify_one();
    }

    pub fn force_op_key(&self) {
        self.force_op_key.notify_one();
    }

    pub(crate) fn log_loop_error(&self, what: &str, err: &PttError) {
        if *err != PttError::Busy {
            warn!(entity = %self.entity_id, "{}: {}", what, err);
        }
    }
}

impl Drop for ProtocolManager {
    fn drop(&mut self) {
        let _ = self.quit.send(true);
    }
}
