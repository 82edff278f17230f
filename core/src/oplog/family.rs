// Oplog families and their per-family capabilities

use crate::store::prefix;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OplogFamily {
    Master = 1,
    Member = 2,
    OpKey = 3,
    Ptt = 4,
}

/// Persistence layout of one family.
#[derive(Debug)]
pub struct FamilySpec {
    pub name: &'static str,
    pub prefix: &'static [u8],
    pub idx_prefix: &'static [u8],
    pub merkle_prefix: Option<&'static [u8]>,
}

static MASTER_SPEC: FamilySpec = FamilySpec {
    name: "master",
    prefix: prefix::MASTER_OPLOG,
    idx_prefix: prefix::MASTER_IDX,
    merkle_prefix: Some(prefix::MASTER_MERKLE),
};

static MEMBER_SPEC: FamilySpec = FamilySpec {
    name: "member",
    prefix: prefix::MEMBER_OPLOG,
    idx_prefix: prefix::MEMBER_IDX,
    merkle_prefix: Some(prefix::MEMBER_MERKLE),
};

static OP_KEY_SPEC: FamilySpec = FamilySpec {
    name: "op-key",
    prefix: prefix::OP_KEY_OPLOG,
    idx_prefix: prefix::OP_KEY_IDX,
    merkle_prefix: None,
};

static PTT_SPEC: FamilySpec = FamilySpec {
    name: "ptt",
    prefix: prefix::PTT_OPLOG,
    idx_prefix: prefix::PTT_IDX,
    merkle_prefix: None,
};

impl OplogFamily {
    pub const ALL: [OplogFamily; 4] = [
        OplogFamily::Master,
        OplogFamily::Member,
        OplogFamily::OpKey,
        OplogFamily::Ptt,
    ];

    pub fn spec(self) -> &'static FamilySpec {
        match self {
            OplogFamily::Master => &MASTER_SPEC,
            OplogFamily::Member => &MEMBER_SPEC,
            OplogFamily::OpKey => &OP_KEY_SPEC,
            OplogFamily::Ptt => &PTT_SPEC,
        }
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        u8::try_from(code).ok().and_then(|c| Self::try_from(c).ok())
    }

    pub fn has_merkle(self) -> bool {
        self.spec().merkle_prefix.is_some()
    }
}

impl From<OplogFamily> for u8 {
    fn from(f: OplogFamily) -> u8 {
        f as u8
    }
}

impl TryFrom<u8> for OplogFamily {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(OplogFamily::Master),
            2 => Ok(OplogFamily::Member),
            3 => Ok(OplogFamily::OpKey),
            4 => Ok(OplogFamily::Ptt),
            _ => Err(format!("invalid oplog family: {}", v)),
        }
    }
}

macro_rules! op_enum {
    ($name:ident { $($variant:ident = $val:expr),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $val),+
        }

        impl From<$name> for u32 {
            fn from(op: $name) -> u32 {
                op as u32
            }
        }

        impl TryFrom<u32> for $name {
            type Error = crate::PttError;

            fn try_from(v: u32) -> crate::Result<Self> {
                match v {
                    $($val => Ok($name::$variant),)+
                    _ => Err(crate::PttError::InvalidOp),
                }
            }
        }
    };
}

// Master and member oplogs share the person op set.
op_enum!(PersonOp {
    Add = 1,
    Transfer = 2,
    Migrate = 3,
    Delete = 4,
});

op_enum!(OpKeyOp {
    Create = 1,
    Revoke = 2,
});

op_enum!(PttOp {
    CreateEntity = 1,
    DeleteEntity = 2,
    JoinEntity = 3,
});
