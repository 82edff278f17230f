// Object / oplog status staircase

use serde::{Deserialize, Serialize};

/// Ordered: anything at or above `Deleted` is terminal for the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Status {
    #[default]
    Invalid,
    InternalPending,
    Pending,
    Alive,
    Failed,
    InternalDeleted,
    PendingDeleted,
    Deleted,
    InternalMigrate,
    PendingMigrate,
    Migrated,
    InternalTransfer,
    PendingTransfer,
    Transferred,
}

impl Status {
    const ALL: [Status; 14] = [
        Status::Invalid,
        Status::InternalPending,
        Status::Pending,
        Status::Alive,
        Status::Failed,
        Status::InternalDeleted,
        Status::PendingDeleted,
        Status::Deleted,
        Status::InternalMigrate,
        Status::PendingMigrate,
        Status::Migrated,
        Status::InternalTransfer,
        Status::PendingTransfer,
        Status::Transferred,
    ];

    pub fn is_deleted(&self) -> bool {
        *self >= Status::Deleted
    }

    /// Maps an oplog status onto the delete-like status family of the
    /// operation (delete, migrate, transfer).
    pub fn to_delete_status(self, internal: Status, pending: Status, done: Status) -> Status {
        match self {
            Status::InternalPending => internal,
            Status::Pending => pending,
            Status::Alive => done,
            other => other,
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        Status::ALL
            .get(v as usize)
            .copied()
            .ok_or_else(|| format!("invalid status: {}", v))
    }
}
