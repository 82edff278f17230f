// Merkle index: time-bucketed digest tree over alive oplogs
//
// One index per (entity, oplog family). Leaves live at level `Now` and are
// written together with the oplog they point to; `Hr`, `Day`, `Month` and
// `Year` nodes are regenerated for every hour that received a leaf. Such
// hours are marked in the store in the same batch as the leaf, so a mark
// survives a restart until the generator has rebuilt its hour. The node
// address is the keccak address of the concatenated child addresses.
//
// The index only short-circuits oplog comparison during sync. The oplog
// store stays authoritative.

pub mod node;

pub use node::{MerkleLevel, MerkleNode};

use crate::crypto::{hash_to_address, keccak256};
use crate::oplog::BaseOplog;
use crate::store::{db_key, prefix, BatchOp, Db};
use crate::types::{PttID, Timestamp, SIZE_TIMESTAMP};
use crate::{PttError, Result};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub struct Merkle {
    db: Db,
    name: &'static str,
    prefix: &'static [u8],
    entity_id: PttID,
    expire_generate_seconds: i64,
    busy_generate_ts: Mutex<Timestamp>,
}

impl Merkle {
    pub fn new(
        db: Db,
        name: &'static str,
        prefix: &'static [u8],
        entity_id: PttID,
        expire_generate_seconds: i64,
    ) -> Self {
        Self {
            db,
            name,
            prefix,
            entity_id,
            expire_generate_seconds,
            busy_generate_ts: Mutex::new(Timestamp::ZERO),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn level_prefix(&self, level: MerkleLevel) -> Vec<u8> {
        db_key(&[self.prefix, self.entity_id.as_bytes(), &[level.into()]])
    }

    pub fn node_key(&self, level: MerkleLevel, ts: &Timestamp) -> Vec<u8> {
        db_key(&[&self.level_prefix(level), &ts.marshal()])
    }

    pub fn leaf_key(&self, ts: &Timestamp, log_id: &PttID) -> Vec<u8> {
        db_key(&[&self.level_prefix(MerkleLevel::Now), &ts.marshal(), log_id.as_bytes()])
    }

    /// Level and bucket ts encoded in a node key of this index.
    pub fn parse_node_key(&self, key: &[u8]) -> Result<(MerkleLevel, Timestamp)> {
        let head = db_key(&[self.prefix, self.entity_id.as_bytes()]);
        if !key.starts_with(&head) || key.len() < head.len() + 1 + SIZE_TIMESTAMP {
            return Err(PttError::InvalidData);
        }
        let level = MerkleLevel::try_from(key[head.len()]).map_err(|_| PttError::InvalidData)?;
        let ts = Timestamp::unmarshal(&key[head.len() + 1..])?;
        Ok((level, ts))
    }

    /// Leaf for an alive oplog stored under `oplog_key`.
    pub fn leaf(&self, oplog: &BaseOplog, oplog_key: &[u8]) -> (Vec<u8>, MerkleNode) {
        let node = MerkleNode {
            level: MerkleLevel::Now,
            addr: hash_to_address(&oplog.hash),
            update_ts: oplog.update_ts,
            n_children: 0,
            key: oplog_key.to_vec(),
        };
        (self.leaf_key(&oplog.update_ts, &oplog.id), node)
    }

    fn to_update_prefix(&self) -> Vec<u8> {
        db_key(&[prefix::MERKLE_TO_UPDATE, self.prefix, self.entity_id.as_bytes()])
    }

    /// Marks the hour of a leaf at `ts` for regeneration. Goes into the
    /// batch that writes or removes the leaf.
    pub fn to_update_op(&self, ts: &Timestamp, log_id: &PttID) -> BatchOp {
        let (hr, _) = ts.to_hr_timestamp();
        BatchOp::Put(db_key(&[&self.to_update_prefix(), &hr.marshal(), log_id.as_bytes()]), Vec::new())
    }

    pub fn mark_to_update(&self, ts: &Timestamp, log_id: &PttID) -> Result<()> {
        self.db.apply_batch(vec![self.to_update_op(ts, log_id)])
    }

    /// Marked hours with the marks that name them.
    fn to_update_hours(&self) -> Result<(BTreeSet<i64>, Vec<Vec<u8>>)> {
        let head = self.to_update_prefix();
        let mut hours = BTreeSet::new();
        let mut marks = Vec::new();
        for (k, _) in self.db.scan_prefix(&head)? {
            match k.get(head.len()..head.len() + SIZE_TIMESTAMP).map(Timestamp::unmarshal) {
                Some(Ok(ts)) => {
                    hours.insert(ts.ts);
                }
                _ => warn!("merkle {}: skip corrupt update mark", self.name),
            }
            marks.push(k);
        }
        Ok((hours, marks))
    }

    pub fn get_nodes(
        &self,
        level: MerkleLevel,
        start: &Timestamp,
        end: &Timestamp,
    ) -> Result<Vec<MerkleNode>> {
        let start_key = self.node_key(level, start);
        let end_key = self.node_key(level, end);
        let mut nodes = Vec::new();
        for (_, v) in self.db.scan_range(&start_key, &end_key)? {
            match MerkleNode::unmarshal(&v) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!("merkle {}: skip corrupt node: {}", self.name, e),
            }
        }
        Ok(nodes)
    }

    pub fn get_node(&self, level: MerkleLevel, ts: &Timestamp) -> Result<Option<MerkleNode>> {
        match self.db.get(&self.node_key(level, ts))? {
            Some(v) => Ok(Some(MerkleNode::unmarshal(&v)?)),
            None => Ok(None),
        }
    }

    /// Children of the node `(level, ts)`.
    pub fn get_child_nodes(&self, level: MerkleLevel, ts: &Timestamp) -> Result<Vec<MerkleNode>> {
        let Some(child) = level.child() else {
            return Ok(Vec::new());
        };
        let (start, next) = level.bucket(ts);
        self.get_nodes(child, &start, &next)
    }

    /// Rebuilds the hour containing `ts` and its day, month and year.
    pub fn save_merkle_tree(&self, ts: &Timestamp) -> Result<()> {
        let saved = self.save_merkle_tree_core(MerkleLevel::Hr, ts)?;
        if !saved {
            return Ok(());
        }
        for level in [MerkleLevel::Day, MerkleLevel::Month, MerkleLevel::Year] {
            self.save_merkle_tree_core(level, ts)?;
        }
        Ok(())
    }

    fn save_merkle_tree_core(&self, level: MerkleLevel, ts: &Timestamp) -> Result<bool> {
        let (start, _) = level.bucket(ts);
        let children = self.get_child_nodes(level, ts)?;
        let key = self.node_key(level, &start);
        if children.is_empty() {
            self.db.remove(&key)?;
            return Ok(false);
        }

        let node = aggregate_node(level, key.clone(), &children);
        self.db.put(&key, &node.marshal())?;
        Ok(true)
    }

    fn is_busy(&self, now: &Timestamp) -> bool {
        let mut busy = self.busy_generate_ts.lock();
        if busy.is_zero() {
            return false;
        }
        if *busy < now.add_secs(-self.expire_generate_seconds) {
            warn!("merkle {}: generate busy flag expired", self.name);
            *busy = Timestamp::ZERO;
            return false;
        }
        true
    }

    /// Regenerates every marked hour, then clears the marks it read. Marks
    /// written meanwhile stay for the next run.
    pub fn generate(&self, now: &Timestamp) -> Result<()> {
        if self.is_busy(now) {
            return Err(PttError::Busy);
        }
        *self.busy_generate_ts.lock() = *now;

        let result = self.generate_core(now);
        *self.busy_generate_ts.lock() = Timestamp::ZERO;
        result
    }

    fn generate_core(&self, now: &Timestamp) -> Result<()> {
        let (hours, marks) = self.to_update_hours()?;
        debug!("merkle {}: generate {} hours", self.name, hours.len());

        for hr in &hours {
            self.save_merkle_tree(&Timestamp::new(*hr, 0))?;
        }
        self.db.apply_batch(marks.into_iter().map(BatchOp::Remove).collect())?;
        self.save_generate_time(now)
    }

    /// Complete buckets before the hour of `ts` (largest first possible
    /// level), plus the leaves of the current hour up to `ts`.
    pub fn get_merkle_tree_list(&self, ts: &Timestamp) -> Result<(Vec<MerkleNode>, Vec<MerkleNode>)> {
        let (year_start, _) = ts.to_year_timestamp();
        let (month_start, _) = ts.to_month_timestamp();
        let (day_start, _) = ts.to_day_timestamp();
        let (hour_start, _) = ts.to_hr_timestamp();

        let mut nodes = self.get_nodes(MerkleLevel::Year, &Timestamp::ZERO, &year_start)?;
        nodes.extend(self.get_nodes(MerkleLevel::Month, &year_start, &month_start)?);
        nodes.extend(self.get_nodes(MerkleLevel::Day, &month_start, &day_start)?);
        nodes.extend(self.get_nodes(MerkleLevel::Hr, &day_start, &hour_start)?);

        let now_nodes = self.get_nodes(MerkleLevel::Now, &hour_start, ts)?;
        Ok((nodes, now_nodes))
    }

    fn meta_key(&self, meta: &[u8]) -> Vec<u8> {
        db_key(&[meta, self.prefix, self.entity_id.as_bytes()])
    }

    fn get_meta(&self, meta: &[u8]) -> Result<Timestamp> {
        Ok(self
            .db
            .get_json::<Timestamp>(&self.meta_key(meta))?
            .unwrap_or_default())
    }

    pub fn generate_time(&self) -> Result<Timestamp> {
        self.get_meta(prefix::MERKLE_GENERATE_TIME)
    }

    pub fn save_generate_time(&self, ts: &Timestamp) -> Result<()> {
        self.db.put_json(&self.meta_key(prefix::MERKLE_GENERATE_TIME), ts)
    }

    pub fn sync_time(&self) -> Result<Timestamp> {
        self.get_meta(prefix::MERKLE_SYNC_TIME)
    }

    pub fn save_sync_time(&self, ts: &Timestamp) -> Result<()> {
        self.db.put_json(&self.meta_key(prefix::MERKLE_SYNC_TIME), ts)
    }

    pub fn fail_sync_time(&self) -> Result<Timestamp> {
        self.get_meta(prefix::MERKLE_FAIL_SYNC_TIME)
    }

    pub fn save_fail_sync_time(&self, ts: &Timestamp) -> Result<()> {
        self.db.put_json(&self.meta_key(prefix::MERKLE_FAIL_SYNC_TIME), ts)
    }

    /// Start of the hour of the last generation.
    pub fn to_sync_time(&self) -> Result<Timestamp> {
        Ok(self.generate_time()?.to_hr_timestamp().0)
    }
}

fn aggregate_node(level: MerkleLevel, key: Vec<u8>, children: &[MerkleNode]) -> MerkleNode {
    let mut addrs = Vec::with_capacity(children.len() * 20);
    let mut update_ts = Timestamp::ZERO;
    for child in children {
        addrs.extend_from_slice(&child.addr.0);
        update_ts = update_ts.max(child.update_ts);
    }
    MerkleNode {
        level,
        addr: hash_to_address(&keccak256(&addrs)),
        update_ts,
        n_children: children.len() as u32,
        key,
    }
}

fn trim_nodes(nodes: &[MerkleNode], ts: &Timestamp) -> Vec<MerkleNode> {
    nodes
        .iter()
        .filter(|n| n.update_ts < *ts)
        .cloned()
        .collect()
}

/// Both sides must list the same addresses for everything before `ts`.
pub fn validate_merkle_tree(mine: &[MerkleNode], theirs: &[MerkleNode], ts: &Timestamp) -> bool {
    let mine = trim_nodes(mine, ts);
    let theirs = trim_nodes(theirs, ts);
    if mine.len() != theirs.len() {
        debug!(
            "validate_merkle_tree: len mismatch: mine {} theirs {}",
            mine.len(),
            theirs.len()
        );
        return false;
    }
    mine.iter().zip(theirs.iter()).all(|(a, b)| a.key == b.key && a.addr == b.addr)
}

/// Nodes needing a pull from the peer (`my_new`) and nodes the peer needs
/// from me (`their_new`). Nodes with the same key but a different address
/// appear in both.
pub fn diff_merkle_nodes(
    mine: &[MerkleNode],
    theirs: &[MerkleNode],
) -> (Vec<MerkleNode>, Vec<MerkleNode>) {
    let mut my_new = Vec::new();
    let mut their_new = Vec::new();
    let mut mine = sorted_by_key(mine).into_iter().peekable();
    let mut theirs = sorted_by_key(theirs).into_iter().peekable();

    loop {
        match (mine.peek(), theirs.peek()) {
            (None, None) => break,
            (Some(_), None) => their_new.extend(mine.by_ref()),
            (None, Some(_)) => my_new.extend(theirs.by_ref()),
            (Some(m), Some(t)) => match m.key.cmp(&t.key) {
                Ordering::Less => their_new.extend(mine.next()),
                Ordering::Greater => my_new.extend(theirs.next()),
                Ordering::Equal => {
                    if let (Some(m), Some(t)) = (mine.next(), theirs.next()) {
                        if m.addr != t.addr {
                            my_new.push(t);
                            their_new.push(m);
                        }
                    }
                }
            },
        }
    }
    (my_new, their_new)
}

fn sorted_by_key(nodes: &[MerkleNode]) -> Vec<MerkleNode> {
    let mut nodes = nodes.to_vec();
    nodes.sort_by(|a, b| a.key.cmp(&b.key));
    nodes
}

/// Earliest differing bucket between two node lists.
pub fn diff_merkle_tree(mine: &[MerkleNode], theirs: &[MerkleNode]) -> Option<Timestamp> {
    let (my_new, their_new) = diff_merkle_nodes(mine, theirs);
    my_new.iter().chain(their_new.iter()).map(bucket_start_of).min()
}

fn bucket_start_of(node: &MerkleNode) -> Timestamp {
    let len = node.key.len();
    if node.level != MerkleLevel::Now && len >= SIZE_TIMESTAMP {
        if let Ok(ts) = Timestamp::unmarshal(&node.key[len - SIZE_TIMESTAMP..]) {
            return ts;
        }
    }
    node.update_ts
}

/// Sorted-merge key diff: `(keys only they have, keys only I have)`.
pub fn merge_merkle_node_keys(
    mine: &[MerkleNode],
    theirs: &[MerkleNode],
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let my_keys: Vec<Vec<u8>> = mine.iter().map(|n| n.key.clone()).collect();
    let their_keys: Vec<Vec<u8>> = theirs.iter().map(|n| n.key.clone()).collect();
    diff_merkle_keys(&my_keys, &their_keys)
}

pub fn diff_merkle_keys(mine: &[Vec<u8>], theirs: &[Vec<u8>]) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mine: BTreeSet<&Vec<u8>> = mine.iter().collect();
    let theirs: BTreeSet<&Vec<u8>> = theirs.iter().collect();
    let my_new = theirs.difference(&mine).map(|k| (*k).clone()).collect();
    let their_new = mine.difference(&theirs).map(|k| (*k).clone()).collect();
    (my_new, their_new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, SIZE_PTT_ID};

    fn leaf(merkle: &Merkle, db: &Db, ts: i64, tag: u8) -> MerkleNode {
        let ts = Timestamp::new(ts, 0);
        let id = PttID([tag; SIZE_PTT_ID]);
        let node = MerkleNode {
            level: MerkleLevel::Now,
            addr: Address([tag; 20]),
            update_ts: ts,
            n_children: 0,
            key: db_key(&[prefix::MASTER_OPLOG, merkle.entity_id.as_bytes(), &ts.marshal(), id.as_bytes()]),
        };
        db.put(&merkle.leaf_key(&ts, &id), &node.marshal()).unwrap();
        merkle.mark_to_update(&ts, &id).unwrap();
        node
    }

    fn new_merkle(db: &Db, entity: PttID) -> Merkle {
        Merkle::new(db.clone(), "master", prefix::MASTER_MERKLE, entity, 450)
    }

    #[test]
    fn test_save_merkle_tree_aggregates_levels() {
        let db = Db::memory();
        let merkle = new_merkle(&db, PttID::random());
        let base = 1_700_000_000 - 1_700_000_000 % 3600;
        leaf(&merkle, &db, base + 10, 1);
        leaf(&merkle, &db, base + 20, 2);
        leaf(&merkle, &db, base + 3600 + 5, 3);

        assert_eq!(merkle.to_update_hours().unwrap().0.len(), 2);
        merkle.generate(&Timestamp::new(base + 7200 + 1, 0)).unwrap();
        assert!(merkle.to_update_hours().unwrap().1.is_empty());

        let hr = merkle.get_node(MerkleLevel::Hr, &Timestamp::new(base, 0)).unwrap().unwrap();
        assert_eq!(hr.n_children, 2);
        let (day_start, _) = Timestamp::new(base, 0).to_day_timestamp();
        let day = merkle.get_node(MerkleLevel::Day, &day_start).unwrap().unwrap();
        assert_eq!(day.n_children, 2);
        assert_eq!(merkle.to_sync_time().unwrap(), Timestamp::new(base + 7200, 0));
    }

    #[test]
    fn test_same_leaves_same_roots() {
        let entity = PttID::random();
        let (db_a, db_b) = (Db::memory(), Db::memory());
        let (a, b) = (new_merkle(&db_a, entity), new_merkle(&db_b, entity));
        let base = 1_600_000_000;
        // insertion order must not matter
        leaf(&a, &db_a, base + 1, 7);
        leaf(&a, &db_a, base + 90_000, 8);
        leaf(&b, &db_b, base + 90_000, 8);
        leaf(&b, &db_b, base + 1, 7);

        let now = Timestamp::new(base + 400_000, 0);
        a.generate(&now).unwrap();
        b.generate(&now).unwrap();

        let (nodes_a, _) = a.get_merkle_tree_list(&now).unwrap();
        let (nodes_b, _) = b.get_merkle_tree_list(&now).unwrap();
        assert!(!nodes_a.is_empty());
        assert!(validate_merkle_tree(&nodes_a, &nodes_b, &now));
    }

    #[test]
    fn test_divergence_is_detected() {
        let entity = PttID::random();
        let (db_a, db_b) = (Db::memory(), Db::memory());
        let (a, b) = (new_merkle(&db_a, entity), new_merkle(&db_b, entity));
        let base = 1_600_000_000;
        leaf(&a, &db_a, base + 1, 7);
        leaf(&b, &db_b, base + 2, 9);

        let now = Timestamp::new(base + 400_000, 0);
        a.generate(&now).unwrap();
        b.generate(&now).unwrap();

        let (nodes_a, _) = a.get_merkle_tree_list(&now).unwrap();
        let (nodes_b, _) = b.get_merkle_tree_list(&now).unwrap();
        assert!(!validate_merkle_tree(&nodes_a, &nodes_b, &now));

        let (my_new, their_new) = diff_merkle_nodes(&nodes_a, &nodes_b);
        assert_eq!(my_new.len(), their_new.len());
        let from = diff_merkle_tree(&nodes_a, &nodes_b).unwrap();
        assert!(from <= Timestamp::new(base, 0));
    }

    #[test]
    fn test_busy_generate_is_rejected_then_expires() {
        let db = Db::memory();
        let merkle = new_merkle(&db, PttID::random());
        let now = Timestamp::new(1_700_000_000, 0);
        *merkle.busy_generate_ts.lock() = now;
        assert_eq!(merkle.generate(&now), Err(PttError::Busy));
        assert!(merkle.generate(&now.add_secs(451)).is_ok());
    }

    #[test]
    fn test_sync_times_are_kept_apart() {
        let db = Db::memory();
        let merkle = new_merkle(&db, PttID::random());
        assert!(merkle.fail_sync_time().unwrap().is_zero());

        let ok = Timestamp::new(1_700_000_000, 0);
        let failed = ok.add_secs(60);
        merkle.save_sync_time(&ok).unwrap();
        merkle.save_fail_sync_time(&failed).unwrap();
        assert_eq!(merkle.sync_time().unwrap(), ok);
        assert_eq!(merkle.fail_sync_time().unwrap(), failed);

        // other entities keep their own bookkeeping
        let other = new_merkle(&db, PttID::random());
        assert!(other.sync_time().unwrap().is_zero());
    }

    #[test]
    fn test_merge_keys() {
        let mk = |k: &[u8]| MerkleNode {
            level: MerkleLevel::Now,
            addr: Address::default(),
            update_ts: Timestamp::ZERO,
            n_children: 0,
            key: k.to_vec(),
        };
        let mine = vec![mk(b"a"), mk(b"b"), mk(b"d")];
        let theirs = vec![mk(b"b"), mk(b"c")];
        let (my_new, their_new) = merge_merkle_node_keys(&mine, &theirs);
        assert_eq!(my_new, vec![b"c".to_vec()]);
        assert_eq!(their_new, vec![b"a".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_parse_node_key() {
        let db = Db::memory();
        let merkle = new_merkle(&db, PttID::random());
        let ts = Timestamp::new(1_700_000_000, 0);
        let key = merkle.node_key(MerkleLevel::Month, &ts);
        assert_eq!(merkle.parse_node_key(&key).unwrap(), (MerkleLevel::Month, ts));
        assert!(merkle.parse_node_key(b".xxxx").is_err());
    }
}
