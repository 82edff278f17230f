// Oplog sync between two peers of an entity
//
// Merkle families compare tree summaries before `to_sync_time` and
// exchange leaves after it. On divergence one side pulls: bucket by bucket
// through ForceSyncByMerkle, or by time window through InvalidSync and
// ForceSync. Op-key and entity families carry their alive logs directly.

use super::message::{
    ForceSyncAckPayload, ForceSyncByMerkleAckPayload, MerkleChildren, MerkleNodesPayload, OplogsPayload, SyncAckPayload,
    SyncNewOplogsPayload, SyncPayload, SyncRange,
};
use super::{OpType, ProtocolManager, SyncOp};
use crate::config::MAX_SYNC_OPLOG_ACK;
use crate::merkle::{diff_merkle_nodes, diff_merkle_tree, merge_merkle_node_keys, validate_merkle_tree, Merkle, MerkleLevel};
use crate::oplog::{BaseOplog, OplogFamily};
use crate::peer::PeerType;
use crate::types::{NodeID, PttID, Status, Timestamp};
use crate::{PttError, Result};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Whether I pull from the peer after a failed Merkle validation; the
/// other side pushes by sending InvalidSync.
pub fn is_to_sync_peer(
    is_me: bool,
    is_my_master: bool,
    is_peer_master: bool,
    my_sync_ts: &Timestamp,
    their_sync_ts: &Timestamp,
    my_key: &[u8],
    peer_key: &[u8],
) -> bool {
    if !is_me && !is_peer_master {
        return false;
    }
    if !is_me && !is_my_master && is_peer_master {
        return true;
    }
    if my_sync_ts != their_sync_ts {
        return my_sync_ts < their_sync_ts;
    }
    my_key < peer_key
}

const SYNC_ORDER: [OplogFamily; 4] = [
    OplogFamily::OpKey,
    OplogFamily::Master,
    OplogFamily::Member,
    OplogFamily::Ptt,
];

impl ProtocolManager {
    fn merkle(&self, family: OplogFamily) -> Result<&Merkle> {
        self.oplogs(family).merkle().ok_or(PttError::InvalidOp)
    }

    fn generate_family_merkle(&self, family: OplogFamily) -> Result<()> {
        match self.merkle(family)?.generate(&Timestamp::now()) {
            Err(PttError::Busy) => Ok(()),
            other => other,
        }
    }

    /// Rebuilds the master and member Merkle trees.
    pub fn generate_merkle(&self) -> Result<()> {
        for family in [OplogFamily::Master, OplogFamily::Member] {
            self.generate_family_merkle(family)?;
        }
        Ok(())
    }

    // ========================================================================
    // LOOPS
    // ========================================================================

    pub(crate) async fn sync_loop(self: Arc<Self>, mut new_peer_rx: mpsc::Receiver<NodeID>, mut quit: watch::Receiver<bool>) {
        loop {
            let (min, max) = (self.config.min_sync_random_seconds, self.config.max_sync_random_seconds.max(self.config.min_sync_random_seconds));
            let wait = Duration::from_secs(rand::thread_rng().gen_range(min..=max));
            let peer = tokio::select! {
                _ = quit.changed() => break,
                Some(node) = new_peer_rx.recv() => Some(node),
                _ = self.force_sync.notified() => None,
                _ = tokio::time::sleep(wait) => None,
            };
            if self.status() != Status::Alive {
                continue;
            }
            let Some(node) = peer.or_else(|| self.random_peer()) else {
                self.load_peers();
                continue;
            };
            if let Err(e) = self.sync_peer(node).await {
                if e == PttError::PeerShutdown {
                    self.unregister_peer(&node);
                } else {
                    self.log_loop_error("sync peer", &e);
                }
            }
        }
    }

    pub(crate) async fn merkle_loop(self: Arc<Self>, family: OplogFamily, mut quit: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.generate_merkle_seconds.max(1)));
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.generate_family_merkle(family) {
                        self.log_loop_error("generate merkle", &e);
                    }
                }
            }
        }
    }

    /// One sync round with `node` over every family.
    pub async fn sync_peer(&self, node: NodeID) -> Result<()> {
        debug!(entity = %self.entity_id, %node, "sync peer");
        for family in SYNC_ORDER {
            self.expire_pending_oplogs(family).await?;
            let store = self.oplogs(family);
            if family.has_merkle() {
                self.generate_family_merkle(family)?;
                let merkle = self.merkle(family)?;
                let ts = merkle.to_sync_time()?;
                let (nodes, _) = merkle.get_merkle_tree_list(&ts)?;
                let payload = SyncPayload {
                    to_sync_time: ts,
                    last_sync_time: merkle.sync_time()?,
                    nodes,
                };
                self.send_to_peer(node, OpType::Oplog(family, SyncOp::Sync), &payload).await?;
            } else {
                let payload = OplogsPayload {
                    oplogs: store.alive_list()?,
                };
                self.send_to_peer(node, OpType::Oplog(family, SyncOp::Sync), &payload).await?;
            }

            let pending = store.pending_list()?;
            if !pending.is_empty() {
                let payload = OplogsPayload { oplogs: pending };
                self.send_to_peer(node, OpType::Oplog(family, SyncOp::SyncPending), &payload).await?;
            }
        }
        Ok(())
    }

    /// Drops my pending logs that can no longer collect signatures.
    async fn expire_pending_oplogs(&self, family: OplogFamily) -> Result<()> {
        let store = self.oplogs(family);
        let now = Timestamp::now();
        for log in store.pending_list()? {
            if log.is_expired(&now, self.config.expire_oplog_seconds) {
                let _guard = store.lock(&log.id).await?;
                store.remove(&log.id)?;
                self.revert_expired_oplog(&log).await?;
                debug!(entity = %self.entity_id, family = family.name(), log_id = %log.id, "pending oplog failed");
            }
        }
        Ok(())
    }

    async fn revert_expired_oplog(&self, log: &BaseOplog) -> Result<()> {
        match log.family {
            OplogFamily::Master | OplogFamily::Member => self.revert_pending_person_oplog(log).await,
            OplogFamily::OpKey | OplogFamily::Ptt => Ok(()),
        }
    }

    // ========================================================================
    // HANDLERS
    // ========================================================================

    pub(crate) async fn handle_sync_message(&self, family: OplogFamily, msg: SyncOp, data: &[u8], node: NodeID) -> Result<()> {
        match msg {
            SyncOp::Sync if family.has_merkle() => self.handle_sync(family, data, node).await,
            SyncOp::Sync => self.handle_sync_oplogs(family, data, node).await,
            SyncOp::SyncAck => self.handle_sync_ack(family, data, node).await,
            SyncOp::SyncNewOplogs => self.handle_sync_new_oplogs(family, data, node).await,
            SyncOp::SyncNewOplogsAck | SyncOp::SyncPendingAck | SyncOp::Adds | SyncOp::AddPendings => {
                let payload: OplogsPayload = serde_json::from_slice(data)?;
                self.handle_oplogs(family, payload.oplogs, Some(node)).await.map(|_| ())
            }
            SyncOp::SyncPending => self.handle_sync_pending(family, data, node).await,
            SyncOp::ForceSync => self.handle_force_sync(family, data, node).await,
            SyncOp::ForceSyncAck => self.handle_force_sync_ack(family, data, node).await,
            SyncOp::ForceSyncByMerkle => self.handle_force_sync_by_merkle(family, data, node).await,
            SyncOp::ForceSyncByMerkleAck => self.handle_force_sync_by_merkle_ack(family, data, node).await,
            SyncOp::InvalidSync => self.handle_invalid_sync(family, data, node).await,
            SyncOp::SyncCreateOpKey if family == OplogFamily::OpKey => self.handle_sync_create_op_key(data, node).await,
            SyncOp::SyncCreateOpKeyAck if family == OplogFamily::OpKey => self.handle_sync_create_op_key_ack(data).await,
            SyncOp::SyncCreateOpKey | SyncOp::SyncCreateOpKeyAck => Err(PttError::InvalidOp),
        }
    }

    /// Families without a Merkle tree: take theirs, return what they lack.
    async fn handle_sync_oplogs(&self, family: OplogFamily, data: &[u8], node: NodeID) -> Result<()> {
        let payload: OplogsPayload = serde_json::from_slice(data)?;
        let theirs: HashSet<PttID> = payload.oplogs.iter().map(|l| l.id).collect();
        let result = self.handle_oplogs(family, payload.oplogs, Some(node)).await;

        let missing: Vec<BaseOplog> = self
            .oplogs(family)
            .alive_list()?
            .into_iter()
            .filter(|l| !theirs.contains(&l.id))
            .collect();
        if !missing.is_empty() {
            let reply = OplogsPayload { oplogs: missing };
            self.send_to_peer(node, OpType::Oplog(family, SyncOp::SyncNewOplogsAck), &reply).await?;
        }
        result.map(|_| ())
    }

    async fn handle_sync(&self, family: OplogFamily, data: &[u8], node: NodeID) -> Result<()> {
        let payload: SyncPayload = serde_json::from_slice(data)?;
        self.generate_family_merkle(family)?;
        let merkle = self.merkle(family)?;
        let ts = merkle.to_sync_time()?.min(payload.to_sync_time);
        let (my_nodes, _) = merkle.get_merkle_tree_list(&ts)?;

        if !validate_merkle_tree(&my_nodes, &payload.nodes, &ts) {
            merkle.save_fail_sync_time(&Timestamp::now())?;
            if self.should_pull(family, node, &payload.last_sync_time)? {
                let (my_new, _) = diff_merkle_nodes(&my_nodes, &payload.nodes);
                let upper: Vec<_> = my_new.into_iter().filter(|n| n.level != MerkleLevel::Now).collect();
                info!(entity = %self.entity_id, family = family.name(), %node, buckets = upper.len(), "merkle diverged, pulling");
                if !upper.is_empty() {
                    let req = MerkleNodesPayload { nodes: upper };
                    self.send_to_peer(node, OpType::Oplog(family, SyncOp::ForceSyncByMerkle), &req).await?;
                }
            } else {
                let from_ts = diff_merkle_tree(&my_nodes, &payload.nodes).unwrap_or(Timestamp::ZERO);
                info!(entity = %self.entity_id, family = family.name(), %node, "merkle diverged, asking peer to pull");
                let range = SyncRange { from_ts, to_ts: ts };
                self.send_to_peer(node, OpType::Oplog(family, SyncOp::InvalidSync), &range).await?;
            }
        }
        self.send_sync_acks(family, node, ts).await
    }

    fn should_pull(&self, family: OplogFamily, node: NodeID, their_sync_ts: &Timestamp) -> Result<bool> {
        let my = &self.my_info;
        let is_me = self.peer_type(&node) == Some(PeerType::Me);
        let peer_user = self.ptt()?.peer_user(&node);
        let is_peer_master = peer_user.map_or(false, |u| self.is_master(&u));
        let my_sync_ts = self.merkle(family)?.sync_time()?;
        let (my_key, peer_key) = if is_me {
            (my.node_id.as_bytes().to_vec(), node.as_bytes().to_vec())
        } else {
            (
                my.user_id.as_bytes().to_vec(),
                peer_user.map(|u| u.as_bytes().to_vec()).unwrap_or_default(),
            )
        };
        Ok(is_to_sync_peer(
            is_me,
            self.is_master(&my.user_id),
            is_peer_master,
            &my_sync_ts,
            their_sync_ts,
            &my_key,
            &peer_key,
        ))
    }

    /// Leaves from `ts` on, in batches.
    async fn send_sync_acks(&self, family: OplogFamily, node: NodeID, ts: Timestamp) -> Result<()> {
        let leaves = self.merkle(family)?.get_nodes(MerkleLevel::Now, &ts, &Timestamp::MAX)?;
        let op = OpType::Oplog(family, SyncOp::SyncAck);
        if leaves.is_empty() {
            let ack = SyncAckPayload {
                nodes: vec![],
                start_ts: ts,
                end_ts: Timestamp::MAX,
            };
            return self.send_to_peer(node, op, &ack).await;
        }
        let chunks: Vec<_> = leaves.chunks(MAX_SYNC_OPLOG_ACK).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let start_ts = if i == 0 { ts } else { chunk[0].update_ts };
            let end_ts = chunks.get(i + 1).map_or(Timestamp::MAX, |next| next[0].update_ts);
            let ack = SyncAckPayload {
                nodes: chunk.to_vec(),
                start_ts,
                end_ts,
            };
            self.send_to_peer(node, op, &ack).await?;
        }
        Ok(())
    }

    async fn handle_sync_ack(&self, family: OplogFamily, data: &[u8], node: NodeID) -> Result<()> {
        let payload: SyncAckPayload = serde_json::from_slice(data)?;
        let merkle = self.merkle(family)?;
        let mine = merkle.get_nodes(MerkleLevel::Now, &payload.start_ts, &payload.end_ts)?;
        let (keys, their_new_keys) = merge_merkle_node_keys(&mine, &payload.nodes);
        let oplogs = self.oplogs(family).get_by_keys(&their_new_keys)?;
        if payload.end_ts == Timestamp::MAX {
            merkle.save_sync_time(&Timestamp::now())?;
        }
        if oplogs.is_empty() && keys.is_empty() {
            return Ok(());
        }
        let req = SyncNewOplogsPayload { oplogs, keys };
        self.send_to_peer(node, OpType::Oplog(family, SyncOp::SyncNewOplogs), &req).await
    }

    async fn handle_sync_new_oplogs(&self, family: OplogFamily, data: &[u8], node: NodeID) -> Result<()> {
        let payload: SyncNewOplogsPayload = serde_json::from_slice(data)?;
        let result = self.handle_oplogs(family, payload.oplogs, Some(node)).await;
        if !payload.keys.is_empty() {
            let oplogs = self.oplogs(family).get_by_keys(&payload.keys)?;
            if !oplogs.is_empty() {
                let reply = OplogsPayload { oplogs };
                self.send_to_peer(node, OpType::Oplog(family, SyncOp::SyncNewOplogsAck), &reply).await?;
            }
        }
        result.map(|_| ())
    }

    async fn handle_sync_pending(&self, family: OplogFamily, data: &[u8], node: NodeID) -> Result<()> {
        let payload: OplogsPayload = serde_json::from_slice(data)?;
        let result = self.handle_oplogs(family, payload.oplogs, Some(node)).await;
        self.expire_pending_oplogs(family).await?;
        let mine = self.oplogs(family).pending_list()?;
        if !mine.is_empty() {
            let reply = OplogsPayload { oplogs: mine };
            self.send_to_peer(node, OpType::Oplog(family, SyncOp::SyncPendingAck), &reply).await?;
        }
        result.map(|_| ())
    }

    // ========================================================================
    // DIVERGENCE
    // ========================================================================

    async fn handle_invalid_sync(&self, family: OplogFamily, data: &[u8], node: NodeID) -> Result<()> {
        let range: SyncRange = serde_json::from_slice(data)?;
        let peer_user = self.ptt()?.peer_user(&node);
        let peer_is_master = peer_user.map_or(false, |u| self.is_master(&u));
        let op = OpType::Oplog(family, SyncOp::ForceSync);

        if self.peer_type(&node) == Some(PeerType::Me) || peer_is_master {
            return self.send_to_peer(node, op, &range).await;
        }
        if self.is_master(&self.my_info.user_id) {
            return Err(PttError::InvalidOp);
        }
        match self.random_peer_of_type(PeerType::Important) {
            Some(master) => self.send_to_peer(master, op, &range).await,
            None => {
                self.connect_master();
                Ok(())
            }
        }
    }

    async fn handle_force_sync(&self, family: OplogFamily, data: &[u8], node: NodeID) -> Result<()> {
        let range: SyncRange = serde_json::from_slice(data)?;
        let oplogs = self.oplogs(family).alive_range(&range.from_ts, &range.to_ts)?;
        let reply = ForceSyncAckPayload { range, oplogs };
        self.send_to_peer(node, OpType::Oplog(family, SyncOp::ForceSyncAck), &reply).await
    }

    /// Takes the peer's window and pushes back what it lacks.
    async fn handle_force_sync_ack(&self, family: OplogFamily, data: &[u8], node: NodeID) -> Result<()> {
        let payload: ForceSyncAckPayload = serde_json::from_slice(data)?;
        let range = payload.range;
        let theirs: HashSet<PttID> = payload.oplogs.iter().map(|l| l.id).collect();
        let result = self.handle_oplogs(family, payload.oplogs, Some(node)).await;

        let missing: Vec<BaseOplog> = self
            .oplogs(family)
            .alive_range(&range.from_ts, &range.to_ts)?
            .into_iter()
            .filter(|l| !theirs.contains(&l.id))
            .collect();
        if !missing.is_empty() {
            let reply = OplogsPayload { oplogs: missing };
            self.send_to_peer(node, OpType::Oplog(family, SyncOp::SyncNewOplogsAck), &reply).await?;
        }
        if let Some(merkle) = self.oplogs(family).merkle() {
            merkle.save_sync_time(&Timestamp::now())?;
        }
        result.map(|_| ())
    }

    async fn handle_force_sync_by_merkle(&self, family: OplogFamily, data: &[u8], node: NodeID) -> Result<()> {
        let payload: MerkleNodesPayload = serde_json::from_slice(data)?;
        let merkle = self.merkle(family)?;
        let mut children = Vec::with_capacity(payload.nodes.len());
        for parent in payload.nodes {
            let (level, ts) = merkle.parse_node_key(&parent.key)?;
            if level == MerkleLevel::Now {
                return Err(PttError::InvalidData);
            }
            let parent = merkle.get_node(level, &ts)?.unwrap_or(parent);
            children.push(MerkleChildren {
                children: merkle.get_child_nodes(level, &ts)?,
                parent,
            });
        }
        let reply = ForceSyncByMerkleAckPayload { children };
        self.send_to_peer(node, OpType::Oplog(family, SyncOp::ForceSyncByMerkleAck), &reply).await
    }

    /// Descends into differing buckets; at the leaves trades logs.
    async fn handle_force_sync_by_merkle_ack(&self, family: OplogFamily, data: &[u8], node: NodeID) -> Result<()> {
        let payload: ForceSyncByMerkleAckPayload = serde_json::from_slice(data)?;
        let merkle = self.merkle(family)?;
        let store = self.oplogs(family);

        let mut descend = Vec::new();
        let mut oplogs = Vec::new();
        let mut keys = Vec::new();
        for MerkleChildren { parent, children } in payload.children {
            let (level, ts) = merkle.parse_node_key(&parent.key)?;
            let mine = merkle.get_child_nodes(level, &ts)?;
            match level.child() {
                Some(MerkleLevel::Now) => {
                    let (my_new_keys, their_new_keys) = merge_merkle_node_keys(&mine, &children);
                    keys.extend(my_new_keys);
                    oplogs.extend(store.get_by_keys(&their_new_keys)?);
                }
                Some(_) => {
                    let (my_new, their_new) = diff_merkle_nodes(&mine, &children);
                    let their_keys: HashSet<&Vec<u8>> = children.iter().map(|n| &n.key).collect();
                    for only_mine in their_new.iter().filter(|n| !their_keys.contains(&n.key)) {
                        let (child_level, child_ts) = merkle.parse_node_key(&only_mine.key)?;
                        let (start, next) = child_level.bucket(&child_ts);
                        oplogs.extend(store.alive_range(&start, &next)?);
                    }
                    descend.extend(my_new);
                }
                None => return Err(PttError::InvalidData),
            }
        }

        if !descend.is_empty() {
            let req = MerkleNodesPayload { nodes: descend };
            self.send_to_peer(node, OpType::Oplog(family, SyncOp::ForceSyncByMerkle), &req).await?;
        }
        if !oplogs.is_empty() || !keys.is_empty() {
            let req = SyncNewOplogsPayload { oplogs, keys };
            self.send_to_peer(node, OpType::Oplog(family, SyncOp::SyncNewOplogs), &req).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_member_pulls_from_master() {
        let ts = Timestamp::now();
        assert!(is_to_sync_peer(false, false, true, &ts, &ts, b"b", b"a"));
        // a master never pulls from a plain member
        assert!(!is_to_sync_peer(false, true, false, &ts, &ts, b"a", b"b"));
    }

    #[test]
    fn test_older_sync_pulls() {
        let old = Timestamp::new(100, 0);
        let new = Timestamp::new(200, 0);
        assert!(is_to_sync_peer(false, true, true, &old, &new, b"z", b"a"));
        assert!(!is_to_sync_peer(false, true, true, &new, &old, b"a", b"z"));
    }

    proptest! {
        #[test]
        fn prop_exactly_one_side_pulls(
            my_master in any::<bool>(),
            peer_master in any::<bool>(),
            my_ts in 0i64..4,
            their_ts in 0i64..4,
            my_key in prop::collection::vec(any::<u8>(), 1..8),
            peer_key in prop::collection::vec(any::<u8>(), 1..8),
        ) {
            prop_assume!(my_key != peer_key);
            let mine = Timestamp::new(my_ts, 0);
            let theirs = Timestamp::new(their_ts, 0);
            let a = is_to_sync_peer(false, my_master, peer_master, &mine, &theirs, &my_key, &peer_key);
            let b = is_to_sync_peer(false, peer_master, my_master, &theirs, &mine, &peer_key, &my_key);
            if my_master && peer_master {
                prop_assert!(a != b);
            }
            if !peer_master {
                prop_assert!(!a);
            }
        }

        #[test]
        fn prop_my_device_with_smaller_node_pushes(
            my_master in any::<bool>(),
            ts in 0i64..4,
            my_node in prop::collection::vec(any::<u8>(), 32),
            peer_node in prop::collection::vec(any::<u8>(), 32),
        ) {
            prop_assume!(peer_node < my_node);
            let ts = Timestamp::new(ts, 0);
            prop_assert!(!is_to_sync_peer(true, my_master, my_master, &ts, &ts, &my_node, &peer_node));
            prop_assert!(is_to_sync_peer(true, my_master, my_master, &ts, &ts, &peer_node, &my_node));
        }
    }
}
