// Service protocol manager: the entities one service hosts
//
// A service names a kind of entity and supplies the hooks its entities run.
// The SPM loads the service's entities at start, creates new ones and
// bootstraps the ones joined through an invitation.

use crate::entity::{DefaultHooks, EntityHooks, EntityInfo};
use crate::pm::message::ApproveJoinPayload;
use crate::pm::ProtocolManager;
use crate::ptt::Ptt;
use crate::store::prefix;
use crate::types::{NodeID, PttID, Timestamp};
use crate::{PttError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    fn hooks(&self, _entity: &EntityInfo) -> Arc<dyn EntityHooks> {
        Arc::new(DefaultHooks)
    }
}

/// A service with default hooks, for entities that carry only membership.
pub struct DefaultService {
    name: String,
}

impl DefaultService {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

impl Service for DefaultService {
    fn name(&self) -> &str {
        &self.name
    }
}

pub struct ServiceProtocolManager {
    ptt: Weak<Ptt>,
    service: Arc<dyn Service>,
    entities: RwLock<HashMap<PttID, Arc<ProtocolManager>>>,
    started: AtomicBool,
}

impl ServiceProtocolManager {
    pub(crate) fn new(ptt: &Arc<Ptt>, service: Arc<dyn Service>) -> Arc<Self> {
        Arc::new(Self {
            ptt: Arc::downgrade(ptt),
            service,
            entities: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        self.service.name()
    }

    fn ptt(&self) -> Result<Arc<Ptt>> {
        self.ptt.upgrade().ok_or(PttError::PeerShutdown)
    }

    pub fn entity(&self, id: &PttID) -> Option<Arc<ProtocolManager>> {
        self.entities.read().get(id).cloned()
    }

    pub fn entities(&self) -> Vec<Arc<ProtocolManager>> {
        self.entities.read().values().cloned().collect()
    }

    /// Loads the service's live entities from the store and starts them.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PttError::AlreadyStarted);
        }
        let ptt = self.ptt()?;
        let stored = ptt.db().scan_json::<EntityInfo>(prefix::ENTITY)?;
        let mut loaded = 0;
        for info in stored {
            if info.service != self.name() || info.status.is_deleted() {
                continue;
            }
            let pm = ProtocolManager::new(&ptt, info.clone(), self.service.hooks(&info));
            self.add(&ptt, pm.clone())?;
            pm.start()?;
            pm.load_peers();
            loaded += 1;
        }
        info!(service = %self.name(), entities = loaded, "service started");
        Ok(())
    }

    pub fn stop(&self) {
        for pm in self.entities() {
            pm.stop();
        }
        self.started.store(false, Ordering::SeqCst);
    }

    fn add(&self, ptt: &Ptt, pm: Arc<ProtocolManager>) -> Result<()> {
        ptt.register_entity(pm.clone())?;
        self.entities.write().insert(*pm.entity_id(), pm);
        Ok(())
    }

    pub(crate) fn remove_entity(&self, id: &PttID) -> Option<Arc<ProtocolManager>> {
        self.entities.write().remove(id)
    }

    /// Undoes a half-made entity.
    fn discard(&self, ptt: &Ptt, pm: &ProtocolManager) {
        let id = *pm.entity_id();
        self.remove_entity(&id);
        ptt.unregister_entity(&id);
        pm.stop();
        if let Err(e) = ptt.db().remove(&ProtocolManager::entity_key(&id)) {
            warn!(entity = %id, "discard entity: {}", e);
        }
    }

    /// Creates an entity with me as its only master and member. A user
    /// has at most one personal entity.
    pub async fn create_entity(&self, name: &str, personal: bool) -> Result<Arc<ProtocolManager>> {
        let ptt = self.ptt()?;
        if personal && ptt.personal_entity().is_some() {
            return Err(PttError::AlreadyExists);
        }
        let me = ptt.my_info().user_id;
        let id = PttID::new_with_ref_id(&me);
        let mut info = EntityInfo::new(id, me, name.to_string(), self.name().to_string(), Timestamp::now());
        info.personal = personal;

        let pm = ProtocolManager::new(&ptt, info.clone(), self.service.hooks(&info));
        pm.save_entity()?;
        self.add(&ptt, pm.clone())?;
        if let Err(e) = pm.found().await {
            self.discard(&ptt, &pm);
            return Err(e);
        }
        pm.start()?;
        info!(service = %self.name(), entity = %id, name, "entity created");
        Ok(pm)
    }

    /// Builds a joined entity from the inviter's bundle and records the
    /// join on my personal entity.
    pub(crate) async fn create_join_entity(&self, bundle: ApproveJoinPayload, node: NodeID) -> Result<Arc<ProtocolManager>> {
        let ptt = self.ptt()?;
        let entity_id = bundle.entity_id;
        if ptt.entity(&entity_id).is_some() {
            return Err(PttError::AlreadyExists);
        }
        let info = bundle.entity.clone();
        if info.service != self.name() || info.status.is_deleted() {
            return Err(PttError::InvalidEntity);
        }
        if info.personal && ptt.personal_entity().is_some() {
            return Err(PttError::AlreadyExists);
        }

        let pm = ProtocolManager::new(&ptt, info.clone(), self.service.hooks(&info));
        pm.save_entity()?;
        self.add(&ptt, pm.clone())?;
        if let Err(e) = pm.bootstrap(bundle, node).await {
            self.discard(&ptt, &pm);
            return Err(e);
        }
        pm.start()?;
        pm.load_peers();

        if !info.personal {
            if let Some(personal) = ptt.personal_entity() {
                if let Err(e) = personal.record_join(entity_id, info.service.clone()).await {
                    warn!(entity = %entity_id, "record join: {}", e);
                }
            }
        }
        Ok(pm)
    }
}
