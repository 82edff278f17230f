// Wire frames
//
// PttData (bincode) carries a salted JSON PttEventData plus its keccak
// checksum. For op, join and join-ack codes `enc_data` is the symmetric
// envelope under the key `hash` names; other codes carry plain JSON over
// the authenticated link.

use crate::config::PROTOCOL_MAX_MSG_SIZE;
use crate::crypto::{checksum_data, verify_checksum};
use crate::types::{hexbytes, NodeID};
use crate::{PttError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CodeType {
    Status = 0,
    Join = 1,
    JoinAck = 2,
    Op = 3,
    OpFail = 4,
    RequestOpKey = 5,
    RequestOpKeyAck = 6,
    RequestOpKeyFail = 7,
    EntityDeleted = 8,
    OpCheckMember = 9,
    OpCheckMemberAck = 10,
    IdentifyPeer = 11,
    IdentifyPeerFail = 12,
    IdentifyPeerWithMyID = 13,
    IdentifyPeerWithMyIDChallenge = 14,
    IdentifyPeerWithMyIDChallengeAck = 15,
    IdentifyPeerWithMyIDAck = 16,
}

impl CodeType {
    /// Codes whose payload is encrypted under the key `hash` names.
    pub fn is_encrypted(self) -> bool {
        matches!(self, CodeType::Join | CodeType::JoinAck | CodeType::Op)
    }
}

impl From<CodeType> for u8 {
    fn from(code: CodeType) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for CodeType {
    type Error = PttError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => CodeType::Status,
            1 => CodeType::Join,
            2 => CodeType::JoinAck,
            3 => CodeType::Op,
            4 => CodeType::OpFail,
            5 => CodeType::RequestOpKey,
            6 => CodeType::RequestOpKeyAck,
            7 => CodeType::RequestOpKeyFail,
            8 => CodeType::EntityDeleted,
            9 => CodeType::OpCheckMember,
            10 => CodeType::OpCheckMemberAck,
            11 => CodeType::IdentifyPeer,
            12 => CodeType::IdentifyPeerFail,
            13 => CodeType::IdentifyPeerWithMyID,
            14 => CodeType::IdentifyPeerWithMyIDChallenge,
            15 => CodeType::IdentifyPeerWithMyIDChallengeAck,
            16 => CodeType::IdentifyPeerWithMyIDAck,
            _ => return Err(PttError::InvalidOp),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PttData {
    pub node: NodeID,
    pub code: u8,
    pub hash: Vec<u8>,
    pub ev_with_salt: Vec<u8>,
    pub checksum: Vec<u8>,
    pub relay: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PttEventData {
    #[serde(rename = "C")]
    pub code: CodeType,
    #[serde(rename = "H", with = "hexbytes", default)]
    pub hash: Vec<u8>,
    #[serde(rename = "D", with = "hexbytes", default)]
    pub enc_data: Vec<u8>,
}

impl PttEventData {
    pub fn decode_plain<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.enc_data)?)
    }
}

/// p2p-level handshake payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PttStatus {
    #[serde(rename = "V")]
    pub version: u32,
    #[serde(rename = "N")]
    pub network_id: u32,
}

/// Builds a frame for `node`. A zero node id addresses any receiver.
pub fn marshal_frame(node: NodeID, code: CodeType, hash: &[u8], enc_data: Vec<u8>) -> Result<Vec<u8>> {
    let ev = PttEventData {
        code,
        hash: hash.to_vec(),
        enc_data,
    };
    let (ev_with_salt, checksum) = checksum_data(&serde_json::to_vec(&ev)?);
    let data = PttData {
        node,
        code: code.into(),
        hash: hash.to_vec(),
        ev_with_salt,
        checksum: checksum.to_vec(),
        relay: 0,
    };
    let bytes = bincode::serialize(&data)?;
    if bytes.len() > PROTOCOL_MAX_MSG_SIZE {
        return Err(PttError::InvalidData);
    }
    Ok(bytes)
}

pub fn marshal_plain<T: Serialize>(node: NodeID, code: CodeType, payload: &T) -> Result<Vec<u8>> {
    marshal_frame(node, code, &[], serde_json::to_vec(payload)?)
}

/// Verifies size, checksum and destination, then decodes the event.
pub fn unmarshal_frame(bytes: &[u8], my_node: &NodeID) -> Result<PttEventData> {
    if bytes.len() > PROTOCOL_MAX_MSG_SIZE {
        return Err(PttError::InvalidData);
    }
    let data: PttData = bincode::deserialize(bytes)?;
    let ev_bytes = verify_checksum(&data.ev_with_salt, &data.checksum)?;
    if !data.node.is_zero() && data.node != *my_node {
        return Err(PttError::InvalidNode);
    }
    let ev: PttEventData = serde_json::from_slice(ev_bytes)?;
    if u8::from(ev.code) != data.code || ev.hash != data.hash {
        return Err(PttError::InvalidData);
    }
    Ok(ev)
}
