// Shared value types

pub mod id;
pub mod lock_map;
pub mod status;
pub mod timestamp;

pub use id::{Address, NodeID, PttID, SIZE_ADDRESS, SIZE_NODE_ID, SIZE_PTT_ID};
pub use lock_map::{LockGuard, LockMap};
pub use status::Status;
pub use timestamp::{Timestamp, SIZE_TIMESTAMP};

/// Hex encoding for byte fields in JSON payloads.
pub mod hexbytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Hex encoding for lists of byte strings, such as store keys.
pub mod hexlist {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(list: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = list.iter().map(hex::encode).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
