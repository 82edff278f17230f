// Ptt Core: replicated entities over signed, Merkle-indexed oplogs
//
// One process hosts one Ptt, many services, many entities. Every entity owns
// a protocol manager which keeps its masters, members and op-keys in sync
// with the peers that share it.

pub mod config;
pub mod crypto;
pub mod entity;
pub mod merkle;
pub mod object;
pub mod oplog;
pub mod peer;
pub mod pm;
pub mod ptt;
pub mod spm;
pub mod store;
pub mod transport;
pub mod types;

use thiserror::Error;

pub use config::{PmConfig, PttConfig};
pub use entity::{EntityHooks, EntityInfo, JoinType};
pub use oplog::{BaseOplog, OplogFamily, SignInfo};
pub use peer::PeerType;
pub use pm::ProtocolManager;
pub use ptt::{MyInfo, Ptt};
pub use spm::{DefaultService, Service, ServiceProtocolManager};
pub use types::{Address, NodeID, PttID, Status, Timestamp};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PttError {
    // protocol violations
    #[error("Invalid data")]
    InvalidData,
    #[error("Invalid checksum")]
    InvalidChecksum,
    #[error("Invalid op")]
    InvalidOp,
    #[error("Invalid signature")]
    InvalidSign,
    #[error("Invalid node")]
    InvalidNode,

    // capacity
    #[error("Too many peers")]
    TooManyPeers,

    // stale / not found
    #[error("Not found")]
    NotFound,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Invalid entity")]
    InvalidEntity,
    #[error("Peer shutdown")]
    PeerShutdown,

    #[error("Busy")]
    Busy,

    // invariants
    #[error("Invalid master-log-0")]
    InvalidMaster0,
    #[error("Invalid status")]
    InvalidStatus,
    #[error("Already exists")]
    AlreadyExists,
    #[error("Already deleted")]
    AlreadyDeleted,
    #[error("Already registered")]
    AlreadyRegistered,
    #[error("Already my node")]
    AlreadyMyNode,

    // lifecycle
    #[error("Already started")]
    AlreadyStarted,
    #[error("Already prestarted")]
    AlreadyPrestarted,
    #[error("Not implemented")]
    NotImplemented,

    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Cryptography error: {0}")]
    Crypto(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl PttError {
    /// Errors a remote peer can provoke by sending garbage.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PttError::InvalidData
                | PttError::InvalidChecksum
                | PttError::InvalidOp
                | PttError::InvalidSign
                | PttError::InvalidNode
        )
    }
}

impl From<serde_json::Error> for PttError {
    fn from(err: serde_json::Error) -> Self {
        PttError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for PttError {
    fn from(err: bincode::Error) -> Self {
        PttError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PttError>;
