//! Resource classes, operation codes and the entry slot overlay.
//!
//! This is the vocabulary shared with the backend. The integer codes are part
//! of the wire contract and must not be renumbered.
//!
//! # Slot overlay
//!
//! A [`ResourceEntry`] has four `i32` slots whose meaning depends on the
//! operation:
//!
//! | slot | default | overlay                                   |
//! |------|---------|-------------------------------------------|
//! | 0    | op      |                                           |
//! | 1    | id      | key for `MsgGet`/`SemGet`/`ShmGet`/`TskGet`|
//! | 2    | val1    | class for `Dump`/`Restore`/`Release`/`Probe`|
//! | 3    | val2    | index for `Cancel`                        |

use crate::config::ProtocolConfig;
use crate::error::{KlnkError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Kind of cluster resource a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ResourceClass {
    MessageQueue = 0,
    Semaphore = 1,
    SharedMemory = 2,
    Task = 3,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [
        ResourceClass::MessageQueue,
        ResourceClass::Semaphore,
        ResourceClass::SharedMemory,
        ResourceClass::Task,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|cls| cls.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::MessageQueue => "msg",
            ResourceClass::Semaphore => "sem",
            ResourceClass::SharedMemory => "shm",
            ResourceClass::Task => "tsk",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "msg" | "message_queue" => Some(ResourceClass::MessageQueue),
            "sem" | "semaphore" => Some(ResourceClass::Semaphore),
            "shm" | "shared_memory" => Some(ResourceClass::SharedMemory),
            "tsk" | "task" => Some(ResourceClass::Task),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operation code. Codes 0, 10, 25 and 31 are reserved and have no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Operation {
    MsgSnd = 1,
    MsgRcv = 2,
    MsgCtl = 3,
    SemOp = 4,
    SemCtl = 5,
    SemExit = 6,
    ShmFault = 7,
    ShmCtl = 8,
    TskCtl = 9,
    TskGet = 11,
    TskPut = 12,
    MsgGet = 13,
    MsgPut = 14,
    SemGet = 15,
    SemPut = 16,
    ShmGet = 17,
    ShmPut = 18,
    PgSave = 19,
    Migrate = 20,
    Dump = 21,
    Restore = 22,
    Release = 23,
    Probe = 24,
    Join = 26,
    Leave = 27,
    Sync = 28,
    Reply = 29,
    Cancel = 30,
}

/// Meaning of one [`ResourceEntry`] slot for a given operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Op,
    Id,
    Key,
    Val1,
    Class,
    Val2,
    Index,
}

impl Operation {
    /// Exclusive upper bound of operation codes.
    pub const NR_OPERATIONS: u32 = 32;

    pub const ALL: [Operation; 28] = [
        Operation::MsgSnd,
        Operation::MsgRcv,
        Operation::MsgCtl,
        Operation::SemOp,
        Operation::SemCtl,
        Operation::SemExit,
        Operation::ShmFault,
        Operation::ShmCtl,
        Operation::TskCtl,
        Operation::TskGet,
        Operation::TskPut,
        Operation::MsgGet,
        Operation::MsgPut,
        Operation::SemGet,
        Operation::SemPut,
        Operation::ShmGet,
        Operation::ShmPut,
        Operation::PgSave,
        Operation::Migrate,
        Operation::Dump,
        Operation::Restore,
        Operation::Release,
        Operation::Probe,
        Operation::Join,
        Operation::Leave,
        Operation::Sync,
        Operation::Reply,
        Operation::Cancel,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::MsgSnd => "msgsnd",
            Operation::MsgRcv => "msgrcv",
            Operation::MsgCtl => "msgctl",
            Operation::SemOp => "semop",
            Operation::SemCtl => "semctl",
            Operation::SemExit => "semexit",
            Operation::ShmFault => "shmfault",
            Operation::ShmCtl => "shmctl",
            Operation::TskCtl => "tskctl",
            Operation::TskGet => "tskget",
            Operation::TskPut => "tskput",
            Operation::MsgGet => "msgget",
            Operation::MsgPut => "msgput",
            Operation::SemGet => "semget",
            Operation::SemPut => "semput",
            Operation::ShmGet => "shmget",
            Operation::ShmPut => "shmput",
            Operation::PgSave => "pgsave",
            Operation::Migrate => "migrate",
            Operation::Dump => "dump",
            Operation::Restore => "restore",
            Operation::Release => "release",
            Operation::Probe => "probe",
            Operation::Join => "join",
            Operation::Leave => "leave",
            Operation::Sync => "sync",
            Operation::Reply => "reply",
            Operation::Cancel => "cancel",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.to_lowercase();
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }

    /// The class this operation is bound to, or `None` for protocol-generic
    /// operations that pair with any class.
    pub fn bound_class(self) -> Option<ResourceClass> {
        match self {
            Operation::MsgSnd
            | Operation::MsgRcv
            | Operation::MsgCtl
            | Operation::MsgGet
            | Operation::MsgPut => Some(ResourceClass::MessageQueue),

            Operation::SemOp
            | Operation::SemCtl
            | Operation::SemExit
            | Operation::SemGet
            | Operation::SemPut => Some(ResourceClass::Semaphore),

            Operation::ShmFault
            | Operation::ShmCtl
            | Operation::ShmGet
            | Operation::ShmPut
            | Operation::PgSave => Some(ResourceClass::SharedMemory),

            Operation::TskCtl
            | Operation::TskGet
            | Operation::TskPut
            | Operation::Migrate
            | Operation::Dump
            | Operation::Restore
            | Operation::Release => Some(ResourceClass::Task),

            Operation::Probe
            | Operation::Join
            | Operation::Leave
            | Operation::Sync
            | Operation::Reply
            | Operation::Cancel => None,
        }
    }

    /// Whether `(cls, self)` is a legal pairing.
    pub fn is_valid_for(self, cls: ResourceClass) -> bool {
        self.bound_class().map_or(true, |bound| bound == cls)
    }

    /// The get operation for a class.
    pub fn get_for(cls: ResourceClass) -> Self {
        match cls {
            ResourceClass::MessageQueue => Operation::MsgGet,
            ResourceClass::Semaphore => Operation::SemGet,
            ResourceClass::SharedMemory => Operation::ShmGet,
            ResourceClass::Task => Operation::TskGet,
        }
    }

    /// The put operation for a class.
    pub fn put_for(cls: ResourceClass) -> Self {
        match cls {
            ResourceClass::MessageQueue => Operation::MsgPut,
            ResourceClass::Semaphore => Operation::SemPut,
            ResourceClass::SharedMemory => Operation::ShmPut,
            ResourceClass::Task => Operation::TskPut,
        }
    }

    /// Slot meanings of a [`ResourceEntry`] carrying this operation.
    pub fn slot_layout(self) -> [Slot; 4] {
        let slot1 = match self {
            Operation::MsgGet | Operation::SemGet | Operation::ShmGet | Operation::TskGet => {
                Slot::Key
            }
            _ => Slot::Id,
        };
        let slot2 = match self {
            Operation::Dump | Operation::Restore | Operation::Release | Operation::Probe => {
                Slot::Class
            }
            _ => Slot::Val1,
        };
        let slot3 = match self {
            Operation::Cancel => Slot::Index,
            _ => Slot::Val2,
        };
        [Slot::Op, slot1, slot2, slot3]
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reject pairings the taxonomy does not allow.
pub fn validate_pair(cls: ResourceClass, op: Operation) -> Result<()> {
    if op.is_valid_for(cls) {
        Ok(())
    } else {
        debug!(target: "klnk::taxonomy", %cls, %op, "rejected class/operation pairing");
        Err(KlnkError::invalid(
            "op",
            format!("{} is not valid for class {}", op, cls),
        ))
    }
}

/// Reject a cancellation index outside `0..INDEX_MAX`.
pub fn validate_index(index: i32) -> Result<()> {
    if (0..ProtocolConfig::INDEX_MAX).contains(&index) {
        Ok(())
    } else {
        Err(KlnkError::invalid(
            "index",
            format!("{} outside 0..{}", index, ProtocolConfig::INDEX_MAX),
        ))
    }
}

/// Four-slot compact head of a request. See the module docs for the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceEntry(pub [i32; 4]);

impl ResourceEntry {
    pub const POS_OP: usize = 0;
    pub const POS_ID: usize = 1;
    pub const POS_KEY: usize = 1;
    pub const POS_VAL1: usize = 2;
    pub const POS_CLS: usize = 2;
    pub const POS_VAL2: usize = 3;
    pub const POS_INDEX: usize = 3;

    /// Fill all four slots positionally.
    pub fn new(op: Operation, id: i32, val1: i32, val2: i32) -> Self {
        let mut entry = Self::default();
        entry.set(op, id, val1, val2);
        entry
    }

    pub fn set(&mut self, op: Operation, id: i32, val1: i32, val2: i32) {
        self.0[Self::POS_OP] = op.code() as i32;
        self.0[Self::POS_ID] = id;
        self.0[Self::POS_VAL1] = val1;
        self.0[Self::POS_VAL2] = val2;
    }

    pub fn op(&self) -> Option<Operation> {
        u32::try_from(self.0[Self::POS_OP])
            .ok()
            .and_then(Operation::from_code)
    }

    pub fn id(&self) -> i32 {
        self.0[Self::POS_ID]
    }

    pub fn key(&self) -> i32 {
        self.0[Self::POS_KEY]
    }

    pub fn val1(&self) -> i32 {
        self.0[Self::POS_VAL1]
    }

    pub fn cls(&self) -> Option<ResourceClass> {
        u32::try_from(self.0[Self::POS_CLS])
            .ok()
            .and_then(ResourceClass::from_code)
    }

    pub fn val2(&self) -> i32 {
        self.0[Self::POS_VAL2]
    }

    pub fn index(&self) -> i32 {
        self.0[Self::POS_INDEX]
    }

    /// Read the slot that carries `meaning` under this entry's operation.
    pub fn slot(&self, meaning: Slot) -> Option<i32> {
        let op = self.op()?;
        op.slot_layout()
            .iter()
            .position(|s| *s == meaning)
            .map(|pos| self.0[pos])
    }
}

/// A resource as the backend names it: class, key and the four-slot head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub cls: ResourceClass,
    pub key: i32,
    pub entry: ResourceEntry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes_are_stable() {
        assert_eq!(Operation::MsgSnd.code(), 1);
        assert_eq!(Operation::ShmFault.code(), 7);
        assert_eq!(Operation::TskGet.code(), 11);
        assert_eq!(Operation::Migrate.code(), 20);
        assert_eq!(Operation::Probe.code(), 24);
        assert_eq!(Operation::Join.code(), 26);
        assert_eq!(Operation::Cancel.code(), 30);
        assert_eq!(ResourceClass::Task.code(), 3);
    }

    #[test]
    fn test_reserved_codes_have_no_operation() {
        for code in [0, 10, 25, 31, Operation::NR_OPERATIONS] {
            assert!(Operation::from_code(code).is_none(), "code {}", code);
        }
        assert!(ResourceClass::from_code(4).is_none());
    }

    #[test]
    fn test_name_roundtrip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_str(op.as_str()), Some(op));
            assert_eq!(Operation::from_code(op.code()), Some(op));
        }
        for cls in ResourceClass::ALL {
            assert_eq!(ResourceClass::from_str(cls.as_str()), Some(cls));
        }
    }

    #[test]
    fn test_pairing_rules() {
        assert!(Operation::SemOp.is_valid_for(ResourceClass::Semaphore));
        assert!(!Operation::SemOp.is_valid_for(ResourceClass::MessageQueue));
        assert!(Operation::Migrate.is_valid_for(ResourceClass::Task));
        assert!(!Operation::Migrate.is_valid_for(ResourceClass::SharedMemory));
        for cls in ResourceClass::ALL {
            assert!(Operation::Cancel.is_valid_for(cls));
            assert!(Operation::get_for(cls).is_valid_for(cls));
            assert!(Operation::put_for(cls).is_valid_for(cls));
        }
        assert!(validate_pair(ResourceClass::SharedMemory, Operation::MsgSnd).is_err());
    }

    #[test]
    fn test_slot_overlay() {
        assert_eq!(
            Operation::MsgSnd.slot_layout(),
            [Slot::Op, Slot::Id, Slot::Val1, Slot::Val2]
        );
        assert_eq!(Operation::SemGet.slot_layout()[1], Slot::Key);
        assert_eq!(Operation::Release.slot_layout()[2], Slot::Class);
        assert_eq!(Operation::Cancel.slot_layout()[3], Slot::Index);
    }

    #[test]
    fn test_entry_positional_access() {
        let entry = ResourceEntry::new(Operation::Probe, 7, ResourceClass::Semaphore.code() as i32, 0);
        assert_eq!(entry.op(), Some(Operation::Probe));
        assert_eq!(entry.id(), 7);
        assert_eq!(entry.cls(), Some(ResourceClass::Semaphore));
        assert_eq!(entry.slot(Slot::Class), Some(1));
        assert_eq!(entry.slot(Slot::Val1), None);

        let cancel = ResourceEntry::new(Operation::Cancel, 3, 0, 42);
        assert_eq!(cancel.index(), 42);
        assert_eq!(cancel.slot(Slot::Index), Some(42));
    }

    #[test]
    fn test_index_bounds() {
        assert!(validate_index(0).is_ok());
        assert!(validate_index(ProtocolConfig::INDEX_MAX - 1).is_ok());
        assert!(validate_index(ProtocolConfig::INDEX_MAX).is_err());
        assert!(validate_index(ProtocolConfig::INDEX_MAX + 1).is_err());
        assert!(validate_index(-1).is_err());
    }
}
