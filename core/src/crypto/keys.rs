// Key material: op-keys, join-keys and child-key derivation

use super::{keccak256_concat, pubkey_to_address, random_bytes, sign_data, signing_key_from_bytes, SignedData};
use crate::config::{MAX_ITER_DERIVE_KEY_BIP32, SIZE_SALT};
use crate::types::{hexbytes, Address, PttID, Status, Timestamp};
use crate::{PttError, Result};
use ed25519_dalek::{Signer, SigningKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::fmt;
use zeroize::Zeroize;

type HmacSha512 = Hmac<Sha512>;

/// Proof that a child key was issued by a parent key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExtraInfo {
    #[serde(rename = "P", with = "hexbytes")]
    pub parent_pubkey: Vec<u8>,
    #[serde(rename = "s", with = "hexbytes")]
    pub salt: Vec<u8>,
    #[serde(rename = "i")]
    pub index: u32,
    #[serde(rename = "S", with = "hexbytes")]
    pub sig: Vec<u8>,
}

impl KeyExtraInfo {
    fn attest_input(child_pubkey: &[u8], salt: &[u8], index: u32) -> [u8; 32] {
        keccak256_concat(&[child_pubkey, salt, &index.to_be_bytes()])
    }

    /// Parent signs a child key it did not derive, e.g. a node key.
    pub fn attest(parent: &SigningKey, child_pubkey: &[u8]) -> Self {
        let salt = random_bytes(SIZE_SALT);
        let sig = parent.sign(&Self::attest_input(child_pubkey, &salt, 0));
        Self {
            parent_pubkey: parent.verifying_key().to_bytes().to_vec(),
            salt,
            index: 0,
            sig: sig.to_bytes().to_vec(),
        }
    }

    pub fn verify_child(&self, child_pubkey: &[u8]) -> Result<()> {
        let input = Self::attest_input(child_pubkey, &self.salt, self.index);
        super::verify_signature(&self.parent_pubkey, &input, &self.sig)
    }
}

/// BIP32-style hardened derivation: HMAC-SHA512 keyed by a fresh salt over
/// `0x00 || parent_secret || index`, left half becomes the child secret.
pub fn derive_child_key(parent: &SigningKey) -> Result<(SigningKey, KeyExtraInfo)> {
    for _ in 0..MAX_ITER_DERIVE_KEY_BIP32 {
        let salt = random_bytes(SIZE_SALT);
        let index = u32::from_be_bytes([salt[0] & 0x7f, salt[1], salt[2], salt[3]]) | 0x8000_0000;

        let mut mac = HmacSha512::new_from_slice(&salt)
            .map_err(|e| PttError::Crypto(e.to_string()))?;
        mac.update(&[0u8]);
        mac.update(parent.as_bytes());
        mac.update(&index.to_be_bytes());
        let mut out = mac.finalize().into_bytes();

        let mut secret = [0u8; 32];
        secret.copy_from_slice(&out[..32]);
        out.as_mut_slice().zeroize();
        if secret.iter().all(|b| *b == 0) {
            continue;
        }

        let child = SigningKey::from_bytes(&secret);
        secret.zeroize();

        let child_pubkey = child.verifying_key().to_bytes();
        let sig = parent.sign(&KeyExtraInfo::attest_input(&child_pubkey, &salt, index));
        let extra = KeyExtraInfo {
            parent_pubkey: parent.verifying_key().to_bytes().to_vec(),
            salt,
            index,
            sig: sig.to_bytes().to_vec(),
        };
        return Ok((child, extra));
    }
    Err(PttError::Crypto("unable to derive child key".to_string()))
}

/// Symmetric key shared by an entity (op-key) or an invitation (join-key).
/// Its `hash` is the routing fingerprint.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    #[serde(rename = "ID")]
    pub id: PttID,
    #[serde(rename = "H")]
    pub hash: Address,
    #[serde(rename = "K", with = "hexbytes")]
    key: Vec<u8>,
    #[serde(rename = "P", with = "hexbytes")]
    pub pubkey: Vec<u8>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<KeyExtraInfo>,
    #[serde(rename = "CID")]
    pub creator_id: PttID,
    #[serde(rename = "CT")]
    pub create_ts: Timestamp,
    #[serde(rename = "UT")]
    pub update_ts: Timestamp,
    #[serde(rename = "DID")]
    pub entity_id: PttID,
    #[serde(rename = "l", default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<PttID>,
    #[serde(rename = "S")]
    pub status: Status,
}

impl KeyInfo {
    pub fn from_signing_key(
        key: &SigningKey,
        extra: Option<KeyExtraInfo>,
        entity_id: &PttID,
        creator_id: &PttID,
    ) -> Self {
        let pubkey = key.verifying_key().to_bytes().to_vec();
        let hash = pubkey_to_address(&pubkey);
        let now = Timestamp::now();
        Self {
            id: PttID::from_address_and_ref(&hash, entity_id),
            hash,
            key: key.to_bytes().to_vec(),
            pubkey,
            extra,
            creator_id: *creator_id,
            create_ts: now,
            update_ts: now,
            entity_id: *entity_id,
            log_id: None,
            status: Status::InternalPending,
        }
    }

    /// Derives a fresh key from `parent`, which is the user's master key.
    pub fn derive(parent: &SigningKey, entity_id: &PttID, creator_id: &PttID) -> Result<Self> {
        let (child, extra) = derive_child_key(parent)?;
        Ok(Self::from_signing_key(&child, Some(extra), entity_id, creator_id))
    }

    pub fn signing_key(&self) -> Result<SigningKey> {
        signing_key_from_bytes(&self.key)
    }

    pub fn sign(&self, bytes: &[u8]) -> Result<SignedData> {
        Ok(sign_data(bytes, &self.signing_key()?))
    }

    /// Symmetric cipher key.
    pub fn cipher_key(&self) -> &[u8] {
        &self.key
    }

    pub fn is_valid(&self) -> bool {
        self.key.len() == 32 && pubkey_to_address(&self.pubkey) == self.hash
    }
}

impl Drop for KeyInfo {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyInfo")
            .field("id", &self.id)
            .field("hash", &self.hash)
            .field("update_ts", &self.update_ts)
            .field("status", &self.status)
            .finish()
    }
}

impl PartialEq for KeyInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.hash == other.hash && self.update_ts == other.update_ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;

    #[test]
    fn test_derived_keys_differ_and_attest() {
        let parent = generate_signing_key();
        let (a, extra_a) = derive_child_key(&parent).unwrap();
        let (b, _) = derive_child_key(&parent).unwrap();
        assert_ne!(a.to_bytes(), b.to_bytes());
        extra_a
            .verify_child(a.verifying_key().as_bytes())
            .unwrap();
        assert!(extra_a.verify_child(b.verifying_key().as_bytes()).is_err());
    }

    #[test]
    fn test_key_info_fingerprint() {
        let parent = generate_signing_key();
        let entity = PttID::random();
        let me = PttID::random();
        let key = KeyInfo::derive(&parent, &entity, &me).unwrap();
        assert!(key.is_valid());
        assert_eq!(key.id.address(), key.hash);
        assert_eq!(key.id.ref_part(), &entity.0[..20]);
        assert_eq!(key.cipher_key().len(), 32);
    }

    #[test]
    fn test_key_info_json_keeps_secret() {
        let key = KeyInfo::from_signing_key(&generate_signing_key(), None, &PttID::random(), &PttID::random());
        let json = serde_json::to_vec(&key).unwrap();
        let back: KeyInfo = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.cipher_key(), key.cipher_key());
        assert!(!format!("{:?}", key).contains(&hex::encode(key.cipher_key())));
    }
}
