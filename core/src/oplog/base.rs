// Base oplog: the signed record every family shares
//
// Creator signature covers the canonical JSON of the immutable fields.
// Internal (per-device) and master signatures cover the creator hash, so a
// signature set can grow without touching what the creator signed. `hash`
// is a digest over the whole signature set and changes with it.

use super::family::OplogFamily;
use crate::crypto::{keccak256_concat, sign_data, verify_data, KeyExtraInfo};
use crate::types::{hexbytes, PttID, Status, Timestamp};
use crate::{PttError, Result};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

pub const OPLOG_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInfo {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "CT")]
    pub create_ts: Timestamp,
    #[serde(rename = "H", with = "hexbytes")]
    pub hash: Vec<u8>,
    #[serde(rename = "s", with = "hexbytes")]
    pub salt: Vec<u8>,
    #[serde(rename = "S", with = "hexbytes")]
    pub sig: Vec<u8>,
    #[serde(rename = "K", with = "hexbytes")]
    pub pubkey: Vec<u8>,
    #[serde(rename = "k", default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<KeyExtraInfo>,
}

impl SignInfo {
    fn new(id: PttID, bytes: &[u8], key: &SigningKey, extra: Option<KeyExtraInfo>, now: Timestamp) -> Self {
        let signed = sign_data(bytes, key);
        Self {
            id,
            create_ts: now,
            salt: signed.salt(bytes.len()).to_vec(),
            hash: signed.hash,
            sig: signed.sig,
            pubkey: signed.pubkey,
            extra,
        }
    }

    fn verify(&self, bytes: &[u8]) -> Result<()> {
        let mut with_salt = bytes.to_vec();
        with_salt.extend_from_slice(&self.salt);
        verify_data(&with_salt, &self.hash, &self.sig, &self.pubkey, &self.id, self.extra.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseOplog {
    #[serde(rename = "V")]
    pub version: u32,
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "f")]
    pub family: OplogFamily,
    #[serde(rename = "CID")]
    pub doer_id: PttID,
    #[serde(rename = "CT")]
    pub create_ts: Timestamp,
    #[serde(rename = "OID")]
    pub obj_id: PttID,
    #[serde(rename = "O")]
    pub op: u32,
    #[serde(rename = "D", with = "hexbytes", default)]
    pub data: Vec<u8>,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub pre_log_id: Option<PttID>,

    #[serde(rename = "cH", with = "hexbytes", default)]
    pub creator_hash: Vec<u8>,
    #[serde(rename = "s", with = "hexbytes", default)]
    pub salt: Vec<u8>,
    #[serde(rename = "S", with = "hexbytes", default)]
    pub sig: Vec<u8>,
    #[serde(rename = "K", with = "hexbytes", default)]
    pub pubkey: Vec<u8>,
    #[serde(rename = "k", default, skip_serializing_if = "Option::is_none")]
    pub key_extra: Option<KeyExtraInfo>,

    #[serde(rename = "UT")]
    pub update_ts: Timestamp,
    #[serde(rename = "H", with = "hexbytes", default)]
    pub hash: Vec<u8>,
    #[serde(rename = "mID", default, skip_serializing_if = "Option::is_none")]
    pub master_log_id: Option<PttID>,
    #[serde(rename = "w", default)]
    pub weight: u32,
    #[serde(rename = "m", default, skip_serializing_if = "Vec::is_empty")]
    pub master_signs: Vec<SignInfo>,
    #[serde(rename = "i", default, skip_serializing_if = "Vec::is_empty")]
    pub internal_signs: Vec<SignInfo>,
    #[serde(rename = "y", default)]
    pub is_sync: bool,
    #[serde(rename = "e", with = "hexbytes", default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<u8>,
}

#[derive(Serialize)]
struct SignInput<'a> {
    #[serde(rename = "V")]
    version: u32,
    #[serde(rename = "ID")]
    id: &'a PttID,
    #[serde(rename = "f")]
    family: OplogFamily,
    #[serde(rename = "CID")]
    doer_id: &'a PttID,
    #[serde(rename = "CT")]
    create_ts: &'a Timestamp,
    #[serde(rename = "OID")]
    obj_id: &'a PttID,
    #[serde(rename = "O")]
    op: u32,
    #[serde(rename = "D", with = "hexbytes")]
    data: &'a Vec<u8>,
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pre_log_id: &'a Option<PttID>,
}

impl BaseOplog {
    pub fn new(
        family: OplogFamily,
        doer_id: PttID,
        obj_id: PttID,
        op: u32,
        data: Vec<u8>,
        pre_log_id: Option<PttID>,
        ts: Timestamp,
    ) -> Self {
        Self {
            version: OPLOG_VERSION,
            id: PttID::new_with_ref_id(&obj_id),
            family,
            doer_id,
            create_ts: ts,
            obj_id,
            op,
            data,
            pre_log_id,
            creator_hash: Vec::new(),
            salt: Vec::new(),
            sig: Vec::new(),
            pubkey: Vec::new(),
            key_extra: None,
            update_ts: ts,
            hash: Vec::new(),
            master_log_id: None,
            weight: 0,
            master_signs: Vec::new(),
            internal_signs: Vec::new(),
            is_sync: false,
            extra: Vec::new(),
        }
    }

    pub fn sign_input(&self) -> Result<Vec<u8>> {
        let input = SignInput {
            version: self.version,
            id: &self.id,
            family: self.family,
            doer_id: &self.doer_id,
            create_ts: &self.create_ts,
            obj_id: &self.obj_id,
            op: self.op,
            data: &self.data,
            pre_log_id: &self.pre_log_id,
        };
        Ok(serde_json::to_vec(&input)?)
    }

    /// Creator signature. `key` is owned by `doer_id` directly or through
    /// `extra`.
    pub fn sign(&mut self, key: &SigningKey, extra: Option<KeyExtraInfo>) -> Result<()> {
        let bytes = self.sign_input()?;
        let signed = sign_data(&bytes, key);
        self.salt = signed.salt(bytes.len()).to_vec();
        self.creator_hash = signed.hash;
        self.sig = signed.sig;
        self.pubkey = signed.pubkey;
        self.key_extra = extra;
        self.update_ts = self.create_ts;
        self.hash = self.signs_hash();
        Ok(())
    }

    pub fn is_expired(&self, now: &Timestamp, expire_seconds: i64) -> bool {
        self.create_ts < now.add_secs(-expire_seconds)
    }

    pub fn internal_sign(
        &mut self,
        sign_id: PttID,
        key: &SigningKey,
        extra: Option<KeyExtraInfo>,
        now: Timestamp,
        expire_seconds: i64,
    ) -> Result<bool> {
        if self.is_expired(&now, expire_seconds) {
            return Err(PttError::InvalidStatus);
        }
        if self.master_log_id.is_some() || !self.master_signs.is_empty() || has_sign(&self.internal_signs, &sign_id) {
            return Ok(false);
        }
        let info = SignInfo::new(sign_id, &self.creator_hash, key, extra, now);
        insert_sign(&mut self.internal_signs, info);
        self.update_ts = now;
        self.hash = self.signs_hash();
        Ok(true)
    }

    /// Internal signatures only precede master signing and are dropped by it.
    pub fn master_sign(
        &mut self,
        sign_id: PttID,
        key: &SigningKey,
        extra: Option<KeyExtraInfo>,
        now: Timestamp,
        expire_seconds: i64,
    ) -> Result<bool> {
        if self.is_expired(&now, expire_seconds) {
            return Err(PttError::InvalidStatus);
        }
        if has_sign(&self.master_signs, &sign_id) {
            return Ok(false);
        }
        let info = SignInfo::new(sign_id, &self.creator_hash, key, extra, now);
        insert_sign(&mut self.master_signs, info);
        self.internal_signs.clear();
        self.update_ts = now;
        self.hash = self.signs_hash();
        Ok(true)
    }

    /// Seals the log under the authorising master-log.
    pub fn set_master_log_id(&mut self, master_log_id: PttID, weight: u32) {
        self.master_log_id = Some(master_log_id);
        self.weight = weight;
        self.internal_signs.clear();
        self.hash = self.signs_hash();
    }

    /// Drops a seal that failed validation. Signatures are kept.
    pub fn unseal(&mut self) {
        self.master_log_id = None;
        self.weight = 0;
        self.hash = self.signs_hash();
    }

    pub fn status(&self) -> Status {
        if self.master_log_id.is_some() {
            Status::Alive
        } else if !self.master_signs.is_empty() {
            Status::Pending
        } else {
            Status::InternalPending
        }
    }

    pub fn has_master_sign(&self, id: &PttID) -> bool {
        has_sign(&self.master_signs, id)
    }

    fn signs_hash(&self) -> Vec<u8> {
        let mut parts: Vec<&[u8]> = vec![&self.creator_hash];
        if let Some(id) = &self.master_log_id {
            parts.push(id.as_bytes());
        }
        parts.extend(self.master_signs.iter().map(|s| s.hash.as_slice()));
        parts.extend(self.internal_signs.iter().map(|s| s.hash.as_slice()));
        keccak256_concat(&parts).to_vec()
    }

    /// Verifies the creator signature, every collected signature and the
    /// signature-set digest.
    pub fn verify(&self) -> Result<()> {
        let mut bytes = self.sign_input()?;
        bytes.extend_from_slice(&self.salt);
        verify_data(
            &bytes,
            &self.creator_hash,
            &self.sig,
            &self.pubkey,
            &self.doer_id,
            self.key_extra.as_ref(),
        )?;

        for info in self.master_signs.iter().chain(self.internal_signs.iter()) {
            info.verify(&self.creator_hash)?;
        }
        if self.hash != self.signs_hash() {
            return Err(PttError::InvalidSign);
        }
        Ok(())
    }

    /// Folds another copy of the same log into this one. Returns true when
    /// anything changed.
    pub fn merge(&mut self, other: &BaseOplog) -> Result<bool> {
        if self.id != other.id || self.creator_hash != other.creator_hash {
            return Err(PttError::InvalidData);
        }
        let before = self.clone();

        for info in &other.master_signs {
            insert_sign(&mut self.master_signs, info.clone());
        }
        for info in &other.internal_signs {
            insert_sign(&mut self.internal_signs, info.clone());
        }
        self.update_ts = self.update_ts.max(other.update_ts);
        self.is_sync |= other.is_sync;

        match (self.master_log_id, other.master_log_id) {
            (None, Some(id)) => {
                self.master_log_id = Some(id);
                self.weight = other.weight;
            }
            (Some(mine), Some(theirs)) if theirs < mine => {
                self.master_log_id = Some(theirs);
                self.weight = other.weight;
            }
            (Some(mine), Some(theirs)) if theirs == mine => {
                self.weight = self.weight.max(other.weight);
            }
            _ => {}
        }
        if self.master_log_id.is_some() || !self.master_signs.is_empty() {
            self.internal_signs.clear();
        }
        self.hash = self.signs_hash();

        Ok(*self != before)
    }
}

fn has_sign(signs: &[SignInfo], id: &PttID) -> bool {
    signs.binary_search_by(|s| s.id.cmp(id)).is_ok()
}

/// Keeps `signs` sorted and unique by signer id. On a clash the smaller hash
/// wins so merging commutes.
fn insert_sign(signs: &mut Vec<SignInfo>, info: SignInfo) {
    match signs.binary_search_by(|s| s.id.cmp(&info.id)) {
        Ok(idx) => {
            if info.hash < signs[idx].hash {
                signs[idx] = info;
            }
        }
        Err(idx) => signs.insert(idx, info),
    }
}
