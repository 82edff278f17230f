// Entity-level op codes and their payloads
//
// Every op travels inside an envelope encrypted under an op-key or a
// join-key. Family ops are numbered `1000 * family + msg`; content ops of
// the hosting service start at `OpType::ENTITY_BASE`.

use crate::crypto::KeyInfo;
use crate::entity::EntityInfo;
use crate::merkle::MerkleNode;
use crate::oplog::{BaseOplog, OplogFamily};
use crate::ptt::identify::IdentifyAck;
use crate::types::{hexbytes, hexlist, PttID, Timestamp};
use crate::{PttError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOp {
    Sync = 1,
    SyncAck = 2,
    SyncNewOplogs = 3,
    SyncNewOplogsAck = 4,
    SyncPending = 5,
    SyncPendingAck = 6,
    ForceSync = 7,
    ForceSyncAck = 8,
    ForceSyncByMerkle = 9,
    ForceSyncByMerkleAck = 10,
    InvalidSync = 11,
    Adds = 12,
    AddPendings = 13,
    SyncCreateOpKey = 14,
    SyncCreateOpKeyAck = 15,
}

impl SyncOp {
    const ALL: [SyncOp; 15] = [
        SyncOp::Sync,
        SyncOp::SyncAck,
        SyncOp::SyncNewOplogs,
        SyncOp::SyncNewOplogsAck,
        SyncOp::SyncPending,
        SyncOp::SyncPendingAck,
        SyncOp::ForceSync,
        SyncOp::ForceSyncAck,
        SyncOp::ForceSyncByMerkle,
        SyncOp::ForceSyncByMerkleAck,
        SyncOp::InvalidSync,
        SyncOp::Adds,
        SyncOp::AddPendings,
        SyncOp::SyncCreateOpKey,
        SyncOp::SyncCreateOpKeyAck,
    ];
}

impl TryFrom<u32> for SyncOp {
    type Error = PttError;

    fn try_from(v: u32) -> Result<Self> {
        SyncOp::ALL
            .iter()
            .find(|op| **op as u32 == v)
            .copied()
            .ok_or(PttError::InvalidOp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Join,
    JoinAckChallenge,
    JoinEntity,
    ApproveJoin,
    IdentifyPeer,
    IdentifyPeerAck,
    Oplog(OplogFamily, SyncOp),
    Entity(u32),
}

const FAMILY_BASE: u32 = 1_000;

impl OpType {
    pub const ENTITY_BASE: u32 = 10_000;
}

impl From<OpType> for u32 {
    fn from(op: OpType) -> u32 {
        match op {
            OpType::Join => 1,
            OpType::JoinAckChallenge => 2,
            OpType::JoinEntity => 3,
            OpType::ApproveJoin => 4,
            OpType::IdentifyPeer => 5,
            OpType::IdentifyPeerAck => 6,
            OpType::Oplog(family, msg) => FAMILY_BASE * family.code() + msg as u32,
            OpType::Entity(n) => n,
        }
    }
}

impl TryFrom<u32> for OpType {
    type Error = PttError;

    fn try_from(v: u32) -> Result<Self> {
        Ok(match v {
            1 => OpType::Join,
            2 => OpType::JoinAckChallenge,
            3 => OpType::JoinEntity,
            4 => OpType::ApproveJoin,
            5 => OpType::IdentifyPeer,
            6 => OpType::IdentifyPeerAck,
            n if n >= OpType::ENTITY_BASE => OpType::Entity(n),
            n if n >= FAMILY_BASE => {
                let family = OplogFamily::from_code(n / FAMILY_BASE).ok_or(PttError::InvalidOp)?;
                OpType::Oplog(family, SyncOp::try_from(n % FAMILY_BASE)?)
            }
            _ => return Err(PttError::InvalidOp),
        })
    }
}

// ---------------------------------------------------------------------------
// Oplog sync payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogsPayload {
    #[serde(rename = "O", default)]
    pub oplogs: Vec<BaseOplog>,
}

/// Merkle summary of everything before `to_sync_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(rename = "TS")]
    pub to_sync_time: Timestamp,
    #[serde(rename = "ST")]
    pub last_sync_time: Timestamp,
    #[serde(rename = "N", default)]
    pub nodes: Vec<MerkleNode>,
}

/// One batch of leaves in `[start_ts, end_ts)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAckPayload {
    #[serde(rename = "N", default)]
    pub nodes: Vec<MerkleNode>,
    #[serde(rename = "STS")]
    pub start_ts: Timestamp,
    #[serde(rename = "ETS")]
    pub end_ts: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNewOplogsPayload {
    #[serde(rename = "O", default)]
    pub oplogs: Vec<BaseOplog>,
    #[serde(rename = "K", with = "hexlist", default)]
    pub keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRange {
    #[serde(rename = "f")]
    pub from_ts: Timestamp,
    #[serde(rename = "t")]
    pub to_ts: Timestamp,
}

/// Alive logs of the requested window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceSyncAckPayload {
    #[serde(rename = "R")]
    pub range: SyncRange,
    #[serde(rename = "O", default)]
    pub oplogs: Vec<BaseOplog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNodesPayload {
    #[serde(rename = "N", default)]
    pub nodes: Vec<MerkleNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleChildren {
    #[serde(rename = "P")]
    pub parent: MerkleNode,
    #[serde(rename = "N", default)]
    pub children: Vec<MerkleNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceSyncByMerkleAckPayload {
    #[serde(rename = "C", default)]
    pub children: Vec<MerkleChildren>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpKeyIdsPayload {
    #[serde(rename = "ID", default)]
    pub ids: Vec<PttID>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpKeysPayload {
    #[serde(rename = "K", default)]
    pub keys: Vec<KeyInfo>,
}

// ---------------------------------------------------------------------------
// Join and identify payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengePayload {
    #[serde(rename = "C", with = "hexbytes")]
    pub challenge: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAckChallengePayload {
    #[serde(rename = "C", with = "hexbytes")]
    pub challenge: Vec<u8>,
    #[serde(rename = "c", with = "hexbytes")]
    pub my_challenge: Vec<u8>,
    #[serde(rename = "ID")]
    pub entity_id: PttID,
    #[serde(rename = "N")]
    pub name: String,
    #[serde(rename = "M", with = "hexbytes")]
    pub master0_hash: Vec<u8>,
    #[serde(rename = "A")]
    pub ack: IdentifyAck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinEntityPayload {
    #[serde(rename = "ID")]
    pub user_id: PttID,
    #[serde(rename = "N")]
    pub name: String,
    #[serde(rename = "M", with = "hexbytes")]
    pub master0_hash: Vec<u8>,
    #[serde(rename = "A")]
    pub ack: IdentifyAck,
}

/// Everything a joiner needs to bootstrap the entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveJoinPayload {
    #[serde(rename = "ID")]
    pub entity_id: PttID,
    #[serde(rename = "E")]
    pub entity: EntityInfo,
    #[serde(rename = "O0")]
    pub master_log0: BaseOplog,
    #[serde(rename = "ML", default)]
    pub master_logs: Vec<BaseOplog>,
    #[serde(rename = "MeL", default)]
    pub member_logs: Vec<BaseOplog>,
    #[serde(rename = "K")]
    pub op_key: KeyInfo,
    #[serde(rename = "KL")]
    pub op_key_log: BaseOplog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyAckPayload {
    #[serde(rename = "A")]
    pub ack: IdentifyAck,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_type_codes() {
        let op = OpType::Oplog(OplogFamily::Member, SyncOp::ForceSyncAck);
        assert_eq!(u32::from(op), 2008);
        assert_eq!(OpType::try_from(2008).unwrap(), op);
        assert_eq!(OpType::try_from(4).unwrap(), OpType::ApproveJoin);
        assert_eq!(OpType::try_from(10_001).unwrap(), OpType::Entity(10_001));
    }

    #[test]
    fn test_unknown_op_codes() {
        assert_eq!(OpType::try_from(0), Err(PttError::InvalidOp));
        assert_eq!(OpType::try_from(7), Err(PttError::InvalidOp));
        assert_eq!(OpType::try_from(9_001), Err(PttError::InvalidOp));
        assert_eq!(OpType::try_from(1_099), Err(PttError::InvalidOp));
    }

    #[test]
    fn test_store_keys_as_hex() {
        let payload = SyncNewOplogsPayload {
            oplogs: vec![],
            keys: vec![vec![0xab, 0x01]],
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"ab01\""));
        let back: SyncNewOplogsPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
