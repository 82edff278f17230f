// Node-wide and per-entity configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_NETWORK_ID: u32 = 1;

/// Upper bound of a single framed message, enforced on send and receive.
pub const PROTOCOL_MAX_MSG_SIZE: usize = 10 * 1024 * 1024;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
pub const IDENTIFY_PEER_TIMEOUT: Duration = Duration::from_secs(10);

pub const SIZE_CHALLENGE: usize = 16;
pub const SIZE_SALT: usize = 32;
pub const MAX_ITER_DERIVE_KEY_BIP32: usize = 10;

pub const MAX_SYNC_OPLOG_ACK: usize = 200;
pub const MAX_JOIN_KEYS: usize = 3;
pub const RENEW_JOIN_KEY_SECONDS: i64 = 86400;

/// Repeated protocol violations before a peer is dropped.
pub const MAX_PEER_VIOLATIONS: u32 = 3;

/// Retry interval while an entity is not alive yet.
pub const ENTITY_NOT_ALIVE_SLEEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PttConfig {
    pub version: u32,
    pub network_id: u32,
    pub max_peers: usize,
    pub max_hub_peers: usize,
    pub max_important_peers: usize,
    pub max_member_peers: usize,
    pub max_pending_peers: usize,
    pub max_random_peers: usize,
}

impl Default for PttConfig {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            network_id: DEFAULT_NETWORK_ID,
            max_peers: 350,
            max_hub_peers: 5,
            max_important_peers: 100,
            max_member_peers: 200,
            max_pending_peers: 50,
            max_random_peers: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PmConfig {
    pub renew_op_key_seconds: i64,
    pub expire_op_key_seconds: i64,
    pub min_sync_random_seconds: u64,
    pub max_sync_random_seconds: u64,
    pub generate_merkle_seconds: u64,
    pub expire_generate_merkle_seconds: i64,
    pub expire_oplog_seconds: i64,
    pub max_masters: usize,
    pub sleep_time_lock_ms: u64,
    pub n_iter_lock: u32,
}

impl Default for PmConfig {
    fn default() -> Self {
        Self {
            renew_op_key_seconds: 86400,
            expire_op_key_seconds: 2 * 86400,
            min_sync_random_seconds: 30,
            max_sync_random_seconds: 60,
            generate_merkle_seconds: 900,
            expire_generate_merkle_seconds: 450,
            expire_oplog_seconds: 300,
            max_masters: 10,
            sleep_time_lock_ms: 10,
            n_iter_lock: 100,
        }
    }
}

impl PmConfig {
    pub fn sleep_time_lock(&self) -> Duration {
        Duration::from_millis(self.sleep_time_lock_ms)
    }
}
