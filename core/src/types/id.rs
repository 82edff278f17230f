// Identifiers: 40-byte entity/user ids, 20-byte addresses, 32-byte node ids

use crate::{PttError, Result};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const SIZE_PTT_ID: usize = 40;
pub const SIZE_ADDRESS: usize = 20;
pub const SIZE_NODE_ID: usize = 32;

/// Entity id, user id, oplog id and key id share this layout:
/// the first 20 bytes identify the id itself, the last 20 bytes
/// carry the address-part of the id it was derived from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PttID(pub [u8; SIZE_PTT_ID]);

impl PttID {
    pub fn random() -> Self {
        let mut id = [0u8; SIZE_PTT_ID];
        rand::rngs::OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// User id: the key address followed by 20 random bytes.
    pub fn from_pubkey_address(addr: &Address) -> Self {
        let mut id = [0u8; SIZE_PTT_ID];
        id[..SIZE_ADDRESS].copy_from_slice(&addr.0);
        rand::rngs::OsRng.fill_bytes(&mut id[SIZE_ADDRESS..]);
        Self(id)
    }

    /// Random head, tail taken from `ref_id`.
    pub fn new_with_ref_id(ref_id: &PttID) -> Self {
        let mut id = [0u8; SIZE_PTT_ID];
        rand::rngs::OsRng.fill_bytes(&mut id[..SIZE_ADDRESS]);
        id[SIZE_ADDRESS..].copy_from_slice(&ref_id.0[..SIZE_ADDRESS]);
        Self(id)
    }

    /// Key ids and node-sign ids: key address followed by the owner's head.
    pub fn from_address_and_ref(addr: &Address, ref_id: &PttID) -> Self {
        let mut id = [0u8; SIZE_PTT_ID];
        id[..SIZE_ADDRESS].copy_from_slice(&addr.0);
        id[SIZE_ADDRESS..].copy_from_slice(&ref_id.0[..SIZE_ADDRESS]);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let id: [u8; SIZE_PTT_ID] = bytes.try_into().map_err(|_| PttError::InvalidData)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Head of the id, which for user ids is the address of the user key.
    pub fn address(&self) -> Address {
        let mut addr = [0u8; SIZE_ADDRESS];
        addr.copy_from_slice(&self.0[..SIZE_ADDRESS]);
        Address(addr)
    }

    pub fn ref_part(&self) -> &[u8] {
        &self.0[SIZE_ADDRESS..]
    }

    pub fn is_same_key(&self, other: &PttID) -> bool {
        self.0[..SIZE_ADDRESS] == other.0[..SIZE_ADDRESS]
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }
}

impl Default for PttID {
    fn default() -> Self {
        Self([0u8; SIZE_PTT_ID])
    }
}

impl fmt::Display for PttID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for PttID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PttID({})", self.to_base58())
    }
}

impl FromStr for PttID {
    type Err = PttError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| PttError::InvalidData)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for PttID {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for PttID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! hex_id {
    ($name:ident, $size:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $size]);

        impl $name {
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                let inner: [u8; $size] = bytes.try_into().map_err(|_| PttError::InvalidData)?;
                Ok(Self(inner))
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0[..8]))
            }
        }

        impl FromStr for $name {
            type Err = PttError;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s).map_err(|_| PttError::InvalidData)?;
                Self::from_bytes(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(Address, SIZE_ADDRESS);
hex_id!(NodeID, SIZE_NODE_ID);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_with_ref_id_keeps_ref_head() {
        let creator = PttID::random();
        let entity = PttID::new_with_ref_id(&creator);
        assert_eq!(entity.ref_part(), &creator.0[..SIZE_ADDRESS]);
        assert_ne!(entity, creator);
    }

    #[test]
    fn test_same_key_compares_head_only() {
        let addr = Address([7u8; SIZE_ADDRESS]);
        let a = PttID::from_pubkey_address(&addr);
        let b = PttID::from_pubkey_address(&addr);
        assert_ne!(a, b);
        assert!(a.is_same_key(&b));
        assert_eq!(a.address(), addr);
    }

    #[test]
    fn test_ptt_id_base58_serde() {
        let id = PttID::random();
        let json = serde_json::to_string(&id).unwrap();
        let back: PttID = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        assert!(PttID::from_str("not-base58-0OIl").is_err());
    }

    #[test]
    fn test_node_id_hex() {
        let node = NodeID([0xab; SIZE_NODE_ID]);
        assert_eq!(node.to_string().len(), SIZE_NODE_ID * 2);
        assert_eq!(NodeID::from_str(&node.to_string()).unwrap(), node);
        assert!(NodeID::default().is_zero());
        assert!(NodeID::from_bytes(&[1, 2, 3]).is_err());
    }
}
