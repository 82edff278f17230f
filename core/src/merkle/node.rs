// Merkle node encoding

use crate::types::{hexbytes, Address, Timestamp, SIZE_ADDRESS, SIZE_TIMESTAMP};
use crate::{PttError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MerkleLevel {
    Now = 1,
    Hr = 2,
    Day = 3,
    Month = 4,
    Year = 5,
}

impl MerkleLevel {
    pub fn child(self) -> Option<MerkleLevel> {
        match self {
            MerkleLevel::Now => None,
            MerkleLevel::Hr => Some(MerkleLevel::Now),
            MerkleLevel::Day => Some(MerkleLevel::Hr),
            MerkleLevel::Month => Some(MerkleLevel::Day),
            MerkleLevel::Year => Some(MerkleLevel::Month),
        }
    }

    /// Bucket `[start, next)` of this level containing `ts`.
    pub fn bucket(self, ts: &Timestamp) -> (Timestamp, Timestamp) {
        match self {
            MerkleLevel::Now => (*ts, *ts),
            MerkleLevel::Hr => ts.to_hr_timestamp(),
            MerkleLevel::Day => ts.to_day_timestamp(),
            MerkleLevel::Month => ts.to_month_timestamp(),
            MerkleLevel::Year => ts.to_year_timestamp(),
        }
    }
}

impl From<MerkleLevel> for u8 {
    fn from(level: MerkleLevel) -> u8 {
        level as u8
    }
}

impl TryFrom<u8> for MerkleLevel {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            1 => Ok(MerkleLevel::Now),
            2 => Ok(MerkleLevel::Hr),
            3 => Ok(MerkleLevel::Day),
            4 => Ok(MerkleLevel::Month),
            5 => Ok(MerkleLevel::Year),
            _ => Err(format!("invalid merkle level: {}", v)),
        }
    }
}

/// A leaf (`Now`) points at an alive oplog through `key`; upper nodes
/// carry their own store key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    #[serde(rename = "L")]
    pub level: MerkleLevel,
    #[serde(rename = "A")]
    pub addr: Address,
    #[serde(rename = "UT")]
    pub update_ts: Timestamp,
    #[serde(rename = "N")]
    pub n_children: u32,
    #[serde(rename = "K", with = "hexbytes")]
    pub key: Vec<u8>,
}

const OFFSET_ADDR: usize = 1;
const OFFSET_TS: usize = OFFSET_ADDR + SIZE_ADDRESS;
const OFFSET_N_CHILDREN: usize = OFFSET_TS + SIZE_TIMESTAMP;
const OFFSET_KEY: usize = OFFSET_N_CHILDREN + 4;

impl MerkleNode {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OFFSET_KEY + self.key.len());
        buf.push(self.level.into());
        buf.extend_from_slice(&self.addr.0);
        buf.extend_from_slice(&self.update_ts.marshal());
        buf.extend_from_slice(&self.n_children.to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < OFFSET_KEY {
            return Err(PttError::InvalidData);
        }
        let level = MerkleLevel::try_from(bytes[0]).map_err(|_| PttError::InvalidData)?;
        let addr = Address::from_bytes(&bytes[OFFSET_ADDR..OFFSET_TS])?;
        let update_ts = Timestamp::unmarshal(&bytes[OFFSET_TS..OFFSET_N_CHILDREN])?;
        let mut n = [0u8; 4];
        n.copy_from_slice(&bytes[OFFSET_N_CHILDREN..OFFSET_KEY]);
        Ok(Self {
            level,
            addr,
            update_ts,
            n_children: u32::from_be_bytes(n),
            key: bytes[OFFSET_KEY..].to_vec(),
        })
    }
}
