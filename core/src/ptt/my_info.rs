// Local identity: the user key shared by all my devices and this node's key

use crate::crypto::{generate_signing_key, pubkey_to_address, signing_key_from_bytes, KeyExtraInfo};
use crate::store::{prefix, Db};
use crate::types::{NodeID, PttID};
use crate::{PttError, Result};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// The node key signs oplogs on behalf of the user through `node_extra`,
/// and doubles as the transport identity.
pub struct MyInfo {
    pub user_id: PttID,
    pub user_key: SigningKey,
    pub node_key: SigningKey,
    pub node_id: NodeID,
    pub node_extra: KeyExtraInfo,
    pub node_sign_id: PttID,
    pub name: String,
}

#[derive(Serialize, Deserialize)]
struct StoredMyInfo {
    #[serde(rename = "ID")]
    user_id: PttID,
    #[serde(rename = "U")]
    user_key: String,
    #[serde(rename = "K")]
    node_key: String,
    #[serde(rename = "N")]
    name: String,
}

impl MyInfo {
    pub fn generate(name: &str) -> Self {
        let user_key = generate_signing_key();
        let user_id = PttID::from_pubkey_address(&pubkey_to_address(user_key.verifying_key().as_bytes()));
        Self::with_keys(user_id, user_key, generate_signing_key(), name)
    }

    /// Another device of an existing user.
    pub fn new_device(user_id: PttID, user_key: SigningKey, name: &str) -> Self {
        Self::with_keys(user_id, user_key, generate_signing_key(), name)
    }

    fn with_keys(user_id: PttID, user_key: SigningKey, node_key: SigningKey, name: &str) -> Self {
        let node_pubkey = node_key.verifying_key().to_bytes();
        let node_extra = KeyExtraInfo::attest(&user_key, &node_pubkey);
        let node_sign_id = PttID::from_address_and_ref(&pubkey_to_address(&node_pubkey), &user_id);
        Self {
            user_id,
            user_key,
            node_id: NodeID(node_pubkey),
            node_key,
            node_extra,
            node_sign_id,
            name: name.to_string(),
        }
    }

    pub fn load(db: &Db) -> Result<Option<Self>> {
        let Some(stored) = db.get_json::<StoredMyInfo>(prefix::MY_INFO)? else {
            return Ok(None);
        };
        let user_key = decode_key(&stored.user_key)?;
        let node_key = decode_key(&stored.node_key)?;
        if pubkey_to_address(user_key.verifying_key().as_bytes()) != stored.user_id.address() {
            return Err(PttError::InvalidKey);
        }
        Ok(Some(Self::with_keys(stored.user_id, user_key, node_key, &stored.name)))
    }

    pub fn save(&self, db: &Db) -> Result<()> {
        let stored = StoredMyInfo {
            user_id: self.user_id,
            user_key: hex::encode(self.user_key.to_bytes()),
            node_key: hex::encode(self.node_key.to_bytes()),
            name: self.name.clone(),
        };
        db.put_json(prefix::MY_INFO, &stored)?;
        db.flush()
    }

    pub fn load_or_create(db: &Db, name: &str) -> Result<Self> {
        if let Some(info) = Self::load(db)? {
            tracing::info!("Loaded identity {}", info.user_id);
            return Ok(info);
        }
        let info = Self::generate(name);
        info.save(db)?;
        tracing::info!("Generated identity {}", info.user_id);
        Ok(info)
    }
}

fn decode_key(hex_key: &str) -> Result<SigningKey> {
    let bytes = Zeroizing::new(hex::decode(hex_key).map_err(|e| PttError::Serialization(e.to_string()))?);
    signing_key_from_bytes(&bytes)
}
