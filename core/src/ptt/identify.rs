// Identify-peer proofs
//
// A peer proves which user owns its node by signing a challenge with the
// node key; `extra` attests the node key to the user key.

use super::my_info::MyInfo;
use crate::crypto::{sign_data, verify_data, KeyExtraInfo};
use crate::types::{hexbytes, NodeID, PttID};
use crate::{PttError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyAck {
    #[serde(rename = "AC", with = "hexbytes")]
    pub ack_challenge: Vec<u8>,
    #[serde(rename = "H", with = "hexbytes")]
    pub hash: Vec<u8>,
    #[serde(rename = "S", with = "hexbytes")]
    pub sig: Vec<u8>,
    #[serde(rename = "K", with = "hexbytes")]
    pub pubkey: Vec<u8>,
    #[serde(rename = "ID")]
    pub my_id: PttID,
    #[serde(rename = "e")]
    pub extra: KeyExtraInfo,
}

impl IdentifyAck {
    pub fn new(challenge: &[u8], my_info: &MyInfo) -> Self {
        let signed = sign_data(challenge, &my_info.node_key);
        Self {
            ack_challenge: signed.bytes_with_salt,
            hash: signed.hash,
            sig: signed.sig,
            pubkey: signed.pubkey,
            my_id: my_info.user_id,
            extra: my_info.node_extra.clone(),
        }
    }

    /// Checks the proof answers `challenge` and was signed by `node`.
    /// Returns the proven user id.
    pub fn verify(&self, challenge: &[u8], node: &NodeID) -> Result<PttID> {
        if challenge.is_empty() || !self.ack_challenge.starts_with(challenge) {
            return Err(PttError::InvalidData);
        }
        if self.pubkey != node.as_bytes() {
            return Err(PttError::InvalidNode);
        }
        verify_data(
            &self.ack_challenge,
            &self.hash,
            &self.sig,
            &self.pubkey,
            &self.my_id,
            Some(&self.extra),
        )?;
        Ok(self.my_id)
    }
}
