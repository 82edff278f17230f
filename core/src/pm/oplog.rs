// Oplog pipeline: signing, sealing, integration and broadcast

use super::message::{OplogsPayload, SyncOp};
use super::person::MoveData;
use super::{OpType, ProtocolManager};
use crate::oplog::{partition_by_sign_state, BaseOplog, OpKeyOp, OplogFamily, PersonOp, PttOp};
use crate::peer::PeerType;
use crate::types::{NodeID, PttID, Status, Timestamp};
use crate::{PttError, Result};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Who has to master-sign a log before it can be sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealRule {
    /// The doer moving itself to another id.
    SelfMove,
    /// Any current master.
    AnyMaster,
    /// The doer, who must be a master.
    DoerMaster,
    /// Every current master.
    AllMasters,
    /// Both sides of a master transfer.
    Transfer,
}

impl SealRule {
    pub fn of(log: &BaseOplog) -> Self {
        match log.family {
            OplogFamily::Master | OplogFamily::Member if log.op == u32::from(PersonOp::Migrate) => SealRule::SelfMove,
            OplogFamily::Master if log.op == u32::from(PersonOp::Transfer) => SealRule::Transfer,
            OplogFamily::Master => SealRule::AllMasters,
            OplogFamily::Member => SealRule::AnyMaster,
            OplogFamily::OpKey => SealRule::DoerMaster,
            OplogFamily::Ptt => SealRule::AllMasters,
        }
    }
}

/// Receiving side of a master transfer.
pub fn transfer_master_to(log: &BaseOplog) -> Option<PttID> {
    if log.family != OplogFamily::Master || log.op != u32::from(PersonOp::Transfer) {
        return None;
    }
    serde_json::from_slice::<MoveData>(&log.data).ok().map(|d| d.to_id)
}

/// A create log for a key that would already have expired.
fn is_stale_op_key_create(log: &BaseOplog, now: &Timestamp, expire: i64) -> bool {
    log.family == OplogFamily::OpKey && log.op == u32::from(OpKeyOp::Create) && log.is_expired(now, expire)
}

fn has_transfer_signs(log: &BaseOplog) -> bool {
    transfer_master_to(log).is_some_and(|to| log.has_master_sign(&log.obj_id) && log.has_master_sign(&to))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastBatch {
    pub msg: SyncOp,
    pub oplogs: Vec<BaseOplog>,
    pub peers: Vec<NodeID>,
}

/// Splits changed logs into the three broadcast buckets: sealed logs to
/// every peer, logs still collecting my devices' signatures to my other
/// devices, and logs waiting on masters to important peers.
pub fn broadcast_plan(logs: Vec<BaseOplog>, peers: &HashMap<NodeID, PeerType>, exclude: Option<&NodeID>) -> [BroadcastBatch; 3] {
    let (alive, internal, pending) = partition_by_sign_state(logs);
    let select = |want: Option<PeerType>| -> Vec<NodeID> {
        let mut nodes: Vec<NodeID> = peers
            .iter()
            .filter(|(node, t)| Some(*node) != exclude && want.map_or(true, |w| **t == w))
            .map(|(node, _)| *node)
            .collect();
        nodes.sort();
        nodes
    };
    [
        BroadcastBatch {
            msg: SyncOp::Adds,
            oplogs: alive,
            peers: select(None),
        },
        BroadcastBatch {
            msg: SyncOp::AddPendings,
            oplogs: internal,
            peers: select(Some(PeerType::Me)),
        },
        BroadcastBatch {
            msg: SyncOp::AddPendings,
            oplogs: pending,
            peers: select(Some(PeerType::Important)),
        },
    ]
}

impl ProtocolManager {
    // ========================================================================
    // SIGNING
    // ========================================================================

    /// Creator signature by this node on behalf of my user, then the device
    /// and user signatures. Masters' user signatures count toward sealing.
    pub(crate) fn sign_own(&self, log: &mut BaseOplog) -> Result<()> {
        let my = &self.my_info;
        let now = Timestamp::now();
        let expire = self.config.expire_oplog_seconds;
        log.sign(&my.node_key, Some(my.node_extra.clone()))?;
        log.internal_sign(my.node_sign_id, &my.node_key, None, now, expire)?;
        log.master_sign(my.user_id, &my.user_key, None, now, expire)?;
        Ok(())
    }

    /// Signs and seals immediately under the newest master log.
    pub(crate) fn force_sign(&self, log: &mut BaseOplog) -> Result<()> {
        let master_log_id = self.newest_master_log_id().ok_or(PttError::InvalidStatus)?;
        self.sign_own(log)?;
        log.set_master_log_id(master_log_id, 1);
        Ok(())
    }

    /// Seals `log` when its rule is satisfied by the current masters.
    pub(crate) fn try_seal(&self, log: &mut BaseOplog) -> Result<bool> {
        if log.master_log_id.is_some() {
            return Ok(false);
        }
        let Some(master_log_id) = self.newest_master_log_id() else {
            return Ok(false);
        };
        let weight = match SealRule::of(log) {
            SealRule::SelfMove => log.has_master_sign(&log.doer_id).then_some(1),
            SealRule::DoerMaster => (self.is_master(&log.doer_id) && log.has_master_sign(&log.doer_id)).then_some(1),
            SealRule::AnyMaster => log.master_signs.iter().any(|s| self.is_master(&s.id)).then_some(1),
            SealRule::AllMasters => {
                let masters = self.master_ids();
                (!masters.is_empty() && masters.iter().all(|m| log.has_master_sign(m))).then_some(masters.len() as u32)
            }
            SealRule::Transfer => (self.is_master(&log.obj_id) && has_transfer_signs(log)).then_some(2),
        };
        match weight {
            Some(weight) => {
                log.set_master_log_id(master_log_id, weight);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Checks a received seal against the master log it names.
    pub(crate) fn validate_seal(&self, log: &BaseOplog) -> Result<bool> {
        let Some(master_log_id) = log.master_log_id else {
            return Ok(true);
        };
        if master_log_id == log.id {
            return self.is_valid_master_log0(log);
        }
        match self.master_oplogs.get(&master_log_id)? {
            Some(master_log) if master_log.status() == Status::Alive => {}
            _ => return Ok(false),
        }

        Ok(match SealRule::of(log) {
            SealRule::SelfMove => log.has_master_sign(&log.doer_id),
            SealRule::DoerMaster => self.is_known_master(&log.doer_id)? && log.has_master_sign(&log.doer_id),
            SealRule::AnyMaster => {
                let mut found = false;
                for sign in &log.master_signs {
                    if self.is_known_master(&sign.id)? {
                        found = true;
                        break;
                    }
                }
                found
            }
            SealRule::AllMasters => {
                let mut signers = 0usize;
                for sign in &log.master_signs {
                    if self.is_known_master(&sign.id)? {
                        signers += 1;
                    }
                }
                if log.weight == 0 || signers < log.weight as usize {
                    false
                } else if Some(master_log_id) == self.newest_master_log_id() {
                    self.master_ids().iter().all(|m| log.has_master_sign(m))
                } else {
                    true
                }
            }
            SealRule::Transfer => self.is_known_master(&log.obj_id)? && has_transfer_signs(log),
        })
    }

    /// The first master log seals itself: the creator adding itself.
    fn is_valid_master_log0(&self, log: &BaseOplog) -> Result<bool> {
        if log.family != OplogFamily::Master
            || log.op != u32::from(PersonOp::Add)
            || log.obj_id != log.doer_id
            || !log.has_master_sign(&log.doer_id)
        {
            return Ok(false);
        }
        Ok(match self.master_log0()? {
            Some(master0) => master0.id == log.id && master0.hash == log.creator_hash,
            None => true,
        })
    }

    fn check_doer(&self, log: &BaseOplog) -> Result<bool> {
        let doer = &log.doer_id;
        let sealed = log.master_log_id.is_some();
        let is_master = if sealed { self.is_known_master(doer)? } else { self.is_master(doer) };
        Ok(match log.family {
            OplogFamily::Master => is_master || log.master_log_id == Some(log.id),
            OplogFamily::Member => is_master || *doer == log.obj_id,
            OplogFamily::OpKey | OplogFamily::Ptt => is_master,
        })
    }

    // ========================================================================
    // INTEGRATION
    // ========================================================================

    /// Verifies, merges, co-signs and stores received logs, applies the
    /// ones that became alive and re-broadcasts what changed. All logs are
    /// processed; the first protocol violation is returned afterwards.
    pub async fn handle_oplogs(&self, family: OplogFamily, mut logs: Vec<BaseOplog>, node: Option<NodeID>) -> Result<Vec<BaseOplog>> {
        logs.sort_by(|a, b| a.create_ts.cmp(&b.create_ts).then(a.id.cmp(&b.id)));
        let mut changed = Vec::new();
        let mut violation = None;
        for log in logs {
            if log.family != family {
                violation.get_or_insert(PttError::InvalidData);
                continue;
            }
            let log_id = log.id;
            match self.handle_oplog(log, node).await {
                Ok(Some(log)) => changed.push(log),
                Ok(None) => {}
                Err(e) if e.is_protocol_violation() => {
                    warn!(entity = %self.entity_id, family = family.name(), log_id = %log_id, "bad oplog: {}", e);
                    violation.get_or_insert(e);
                }
                Err(e) => debug!(entity = %self.entity_id, family = family.name(), log_id = %log_id, "skip oplog: {}", e),
            }
        }
        self.broadcast_oplogs(family, changed.clone(), node.as_ref());
        match violation {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }

    async fn handle_oplog(&self, mut log: BaseOplog, node: Option<NodeID>) -> Result<Option<BaseOplog>> {
        let store = self.oplogs(log.family);
        let _guard = store.lock(&log.id).await?;
        log.verify()?;
        if !self.check_doer(&log)? {
            debug!(entity = %self.entity_id, log_id = %log.id, doer = %log.doer_id, "doer not allowed");
            return Ok(None);
        }
        if is_stale_op_key_create(&log, &Timestamp::now(), self.config.expire_op_key_seconds) {
            debug!(entity = %self.entity_id, log_id = %log.id, "op-key create log past expiry, skipped");
            return Ok(None);
        }
        if log.master_log_id.is_some() && !self.validate_seal(&log)? {
            debug!(entity = %self.entity_id, log_id = %log.id, "seal not valid, kept as pending");
            log.unseal();
        }

        let existing = store.get(&log.id)?;
        let was_alive = existing.as_ref().map_or(false, |e| e.status() == Status::Alive);
        let (mut log, mut changed) = match existing {
            Some(mut mine) => {
                let changed = mine.merge(&log)?;
                (mine, changed)
            }
            None => {
                if let Some(pre) = &log.pre_log_id {
                    if let Some(pre_log) = store.get(pre)? {
                        if pre_log.obj_id != log.obj_id {
                            return Err(PttError::InvalidData);
                        }
                    }
                }
                (log, true)
            }
        };

        if !was_alive {
            let now = Timestamp::now();
            let expire = self.config.expire_oplog_seconds;
            if log.status() != Status::Alive && log.is_expired(&now, expire) {
                store.remove(&log.id)?;
                self.revert_pending_oplog(&log).await?;
                return Ok(None);
            }
            if log.status() != Status::Alive {
                let my = &self.my_info;
                if log.doer_id == my.user_id {
                    changed |= log.internal_sign(my.node_sign_id, &my.node_key, None, now, expire)?;
                }
                if self.is_master(&my.user_id) || transfer_master_to(&log) == Some(my.user_id) {
                    changed |= log.master_sign(my.user_id, &my.user_key, None, now, expire)?;
                }
                changed |= self.try_seal(&mut log)?;
            }
        }
        if !changed {
            return Ok(None);
        }

        let alive = log.status() == Status::Alive;
        if alive {
            log.is_sync = true;
        }
        store.save(&log)?;
        if alive && !was_alive {
            self.apply_oplog(&log, node).await?;
        } else if !alive {
            self.apply_pending_oplog(&log).await?;
        }
        Ok(Some(log))
    }

    /// Stores and applies a log created here, then broadcasts it.
    pub(crate) async fn integrate_own(&self, mut log: BaseOplog) -> Result<BaseOplog> {
        let store = self.oplogs(log.family);
        let alive = log.status() == Status::Alive;
        {
            let _guard = store.lock(&log.id).await?;
            log.is_sync = alive;
            store.save(&log)?;
        }
        if alive {
            self.apply_oplog(&log, None).await?;
        } else {
            self.apply_pending_oplog(&log).await?;
        }
        if !alive {
            self.send_to_transfer_target(&log);
        }
        self.broadcast_oplogs(log.family, vec![log.clone()], None);
        Ok(log)
    }

    async fn apply_oplog(&self, log: &BaseOplog, node: Option<NodeID>) -> Result<()> {
        debug!(entity = %self.entity_id, family = log.family.name(), log_id = %log.id, op = log.op, "oplog alive");
        match log.family {
            OplogFamily::Master => {
                self.apply_person_oplog(log).await?;
                self.set_newest_master_log_id(log.id)?;
            }
            OplogFamily::Member => self.apply_person_oplog(log).await?,
            OplogFamily::OpKey => match OpKeyOp::try_from(log.op)? {
                OpKeyOp::Create => self.apply_create_op_key(log, node).await?,
                OpKeyOp::Revoke => self.apply_revoke_op_key(&log.obj_id)?,
            },
            OplogFamily::Ptt => match PttOp::try_from(log.op)? {
                PttOp::DeleteEntity => self.apply_delete_entity(log).await?,
                PttOp::CreateEntity | PttOp::JoinEntity => {}
            },
        }
        Ok(())
    }

    async fn apply_pending_oplog(&self, log: &BaseOplog) -> Result<()> {
        match log.family {
            OplogFamily::Master | OplogFamily::Member => self.apply_pending_person_oplog(log).await,
            OplogFamily::OpKey | OplogFamily::Ptt => Ok(()),
        }
    }

    async fn revert_pending_oplog(&self, log: &BaseOplog) -> Result<()> {
        match log.family {
            OplogFamily::Master | OplogFamily::Member => self.revert_pending_person_oplog(log).await,
            OplogFamily::OpKey | OplogFamily::Ptt => Ok(()),
        }
    }

    // ========================================================================
    // BROADCAST
    // ========================================================================

    pub(crate) fn broadcast_oplogs(&self, family: OplogFamily, logs: Vec<BaseOplog>, exclude: Option<&NodeID>) {
        if logs.is_empty() {
            return;
        }
        let peers = self.peers.read().clone();
        for batch in broadcast_plan(logs, &peers, exclude) {
            if batch.oplogs.is_empty() {
                continue;
            }
            if batch.peers.is_empty() {
                if batch.msg == SyncOp::AddPendings {
                    self.connect_master();
                }
                continue;
            }
            let payload = OplogsPayload { oplogs: batch.oplogs };
            if let Err(e) = self.send_to_peers(OpType::Oplog(family, batch.msg), &payload, batch.peers) {
                warn!(entity = %self.entity_id, "broadcast oplogs: {}", e);
            }
        }
    }

    /// A pending master transfer also goes to the receiving user's nodes,
    /// which are not important peers until the transfer is done.
    pub(crate) fn send_to_transfer_target(&self, log: &BaseOplog) {
        let Some(to) = transfer_master_to(log) else {
            return;
        };
        let Ok(ptt) = self.ptt() else {
            return;
        };
        let peers: Vec<NodeID> = {
            let registered = self.peers.read();
            ptt.nodes_of_user(&to)
                .into_iter()
                .filter(|node| registered.contains_key(node))
                .collect()
        };
        if peers.is_empty() {
            return;
        }
        let payload = OplogsPayload { oplogs: vec![log.clone()] };
        if let Err(e) = self.send_to_peers(OpType::Oplog(log.family, SyncOp::AddPendings), &payload, peers) {
            warn!(entity = %self.entity_id, "send transfer to target: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;

    fn log(family: OplogFamily, op: u32) -> BaseOplog {
        let doer = PttID::random();
        let mut log = BaseOplog::new(family, doer, PttID::random(), op, vec![], None, Timestamp::now());
        log.sign(&generate_signing_key(), None).ok();
        log
    }

    #[test]
    fn test_seal_rules() {
        assert_eq!(SealRule::of(&log(OplogFamily::Master, PersonOp::Add.into())), SealRule::AllMasters);
        assert_eq!(SealRule::of(&log(OplogFamily::Master, PersonOp::Transfer.into())), SealRule::Transfer);
        assert_eq!(SealRule::of(&log(OplogFamily::Member, PersonOp::Transfer.into())), SealRule::AnyMaster);
        assert_eq!(SealRule::of(&log(OplogFamily::Master, PersonOp::Migrate.into())), SealRule::SelfMove);
        assert_eq!(SealRule::of(&log(OplogFamily::Member, PersonOp::Delete.into())), SealRule::AnyMaster);
        assert_eq!(SealRule::of(&log(OplogFamily::Member, PersonOp::Migrate.into())), SealRule::SelfMove);
        assert_eq!(SealRule::of(&log(OplogFamily::OpKey, OpKeyOp::Create.into())), SealRule::DoerMaster);
        assert_eq!(SealRule::of(&log(OplogFamily::Ptt, PttOp::DeleteEntity.into())), SealRule::AllMasters);
    }

    #[test]
    fn test_transfer_needs_both_sides() {
        let now = Timestamp::now();
        let (from, to) = (PttID::random(), PttID::random());
        let data = serde_json::to_vec(&MoveData { to_id: to }).unwrap();
        let mut log = BaseOplog::new(OplogFamily::Master, from, from, PersonOp::Transfer.into(), data, None, now);
        log.sign(&generate_signing_key(), None).unwrap();
        assert_eq!(transfer_master_to(&log), Some(to));

        log.master_sign(from, &generate_signing_key(), None, now, 60).unwrap();
        assert!(!has_transfer_signs(&log));
        log.master_sign(to, &generate_signing_key(), None, now, 60).unwrap();
        assert!(has_transfer_signs(&log));

        let member = BaseOplog::new(OplogFamily::Member, from, from, PersonOp::Transfer.into(), vec![], None, now);
        assert_eq!(transfer_master_to(&member), None);
    }

    #[test]
    fn test_stale_op_key_create() {
        let now = Timestamp::now();
        let doer = PttID::random();
        let old = BaseOplog::new(OplogFamily::OpKey, doer, doer, OpKeyOp::Create.into(), vec![], None, now.add_secs(-120));
        assert!(is_stale_op_key_create(&old, &now, 60));
        assert!(!is_stale_op_key_create(&old, &now, 600));

        let revoke = BaseOplog::new(OplogFamily::OpKey, doer, doer, OpKeyOp::Revoke.into(), vec![], None, now.add_secs(-120));
        assert!(!is_stale_op_key_create(&revoke, &now, 60));
        let member = BaseOplog::new(OplogFamily::Member, doer, doer, PersonOp::Add.into(), vec![], None, now.add_secs(-120));
        assert!(!is_stale_op_key_create(&member, &now, 60));
    }

    #[test]
    fn test_broadcast_plan_buckets() {
        let now = Timestamp::now();
        let key = generate_signing_key();
        let signer = PttID::random();

        let mut alive = log(OplogFamily::Member, PersonOp::Add.into());
        alive.master_sign(signer, &key, None, now, 60).unwrap();
        alive.set_master_log_id(PttID::random(), 1);

        let mut internal = log(OplogFamily::Member, PersonOp::Add.into());
        internal.internal_sign(signer, &key, None, now, 60).unwrap();

        let mut pending = log(OplogFamily::Member, PersonOp::Add.into());
        pending.master_sign(signer, &key, None, now, 60).unwrap();

        let me = NodeID([1; 32]);
        let important = NodeID([2; 32]);
        let member = NodeID([3; 32]);
        let source = NodeID([4; 32]);
        let peers: HashMap<NodeID, PeerType> = [
            (me, PeerType::Me),
            (important, PeerType::Important),
            (member, PeerType::Member),
            (source, PeerType::Important),
        ]
        .into_iter()
        .collect();

        let [adds, internals, pendings] = broadcast_plan(
            vec![pending.clone(), alive.clone(), internal.clone()],
            &peers,
            Some(&source),
        );
        assert_eq!(adds.msg, SyncOp::Adds);
        assert_eq!(adds.oplogs, vec![alive]);
        assert_eq!(adds.peers, vec![me, important, member]);

        assert_eq!(internals.msg, SyncOp::AddPendings);
        assert_eq!(internals.oplogs, vec![internal]);
        assert_eq!(internals.peers, vec![me]);

        assert_eq!(pendings.msg, SyncOp::AddPendings);
        assert_eq!(pendings.oplogs, vec![pending]);
        assert_eq!(pendings.peers, vec![important]);
    }

    #[test]
    fn test_broadcast_plan_empty() {
        let plan = broadcast_plan(vec![], &HashMap::new(), None);
        assert!(plan.iter().all(|b| b.oplogs.is_empty() && b.peers.is_empty()));
    }
}
