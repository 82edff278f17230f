// Oplog model: one signed record type, four persisted families

pub mod base;
pub mod family;
pub mod store;

pub use base::{BaseOplog, SignInfo, OPLOG_VERSION};
pub use family::{FamilySpec, OpKeyOp, OplogFamily, PersonOp, PttOp};
pub use store::OplogStore;

use crate::types::Status;

/// Splits logs by broadcast bucket: sealed, own-device pending, and
/// pending on other masters.
pub fn partition_by_sign_state(logs: Vec<BaseOplog>) -> (Vec<BaseOplog>, Vec<BaseOplog>, Vec<BaseOplog>) {
    let mut alive = Vec::new();
    let mut internal = Vec::new();
    let mut pending = Vec::new();
    for log in logs {
        if log.master_log_id.is_some() {
            alive.push(log);
        } else if !log.internal_signs.is_empty() {
            internal.push(log);
        } else {
            pending.push(log);
        }
    }
    (alive, internal, pending)
}

/// Status an object takes while its delete-like oplog progresses.
pub fn to_delete_status(log: &BaseOplog, internal: Status, pending: Status, done: Status) -> Status {
    log.status().to_delete_status(internal, pending, done)
}
