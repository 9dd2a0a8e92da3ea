use std::fmt::Display;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Deserialize;

/// index into the cache arena.
pub type CacheId = usize;
/// global id of any component able to send or receive a package.
pub type ComponentId = usize;

pub const NUM_MEMORY_OPERATIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MemoryOperation {
    Read,
    Inst,
    Write,
    Prefetch,
    Writeback,
}

impl MemoryOperation {
    pub const ALL: [MemoryOperation; NUM_MEMORY_OPERATIONS] = [
        MemoryOperation::Read,
        MemoryOperation::Inst,
        MemoryOperation::Write,
        MemoryOperation::Prefetch,
        MemoryOperation::Writeback,
    ];

    #[inline]
    pub fn index(self) -> usize {
        u8::from(self) as usize
    }
}

impl Display for MemoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use MemoryOperation::*;
        let s = match self {
            Read => "READ",
            Inst => "INST",
            Write => "WRITE",
            Prefetch => "PREFETCH",
            Writeback => "WRITEBACK",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    Untreated,
    Wait,
    Transmit,
    Ready,
}

impl Display for PackageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use PackageState::*;
        let s = match self {
            Untreated => "UNTREATED",
            Wait => "WAIT",
            Transmit => "TRANSMIT",
            Ready => "READY",
        };
        f.write_str(s)
    }
}

/// MOESI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolStatus {
    M,
    O,
    E,
    S,
    #[default]
    I,
}

impl ProtocolStatus {
    pub fn is_dirty(self) -> bool {
        matches!(self, ProtocolStatus::M | ProtocolStatus::O)
    }
    /// holds the line exclusively or as the owner.
    pub fn is_exclusive_owner(self) -> bool {
        matches!(self, ProtocolStatus::M | ProtocolStatus::O | ProtocolStatus::E)
    }
}

impl Display for ProtocolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ProtocolStatus::*;
        let s = match self {
            M => "M",
            O => "O",
            E => "E",
            S => "S",
            I => "I",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Free,
    Read,
    Write,
}

impl Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LockType::Free => "FREE",
            LockType::Read => "READ",
            LockType::Write => "WRITE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplacementPolicy {
    #[default]
    Lru,
    DeadOrLru,
    InvalidOrLru,
    Random,
    Fifo,
    Lrf,
}

impl Display for ReplacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ReplacementPolicy::*;
        let s = match self {
            Lru => "LRU",
            DeadOrLru => "DEAD_OR_LRU",
            InvalidOrLru => "INVALID_OR_LRU",
            Random => "RANDOM",
            Fifo => "FIFO",
            Lrf => "LRF",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InclusivenessPolicy {
    #[default]
    NonInclusive,
    InclusiveLlc,
    InclusiveAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressMaskType {
    #[default]
    TagIndexOffset,
    TagIndexBankOffset,
    TagBankIndexOffset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_index() {
        for (i, op) in MemoryOperation::ALL.iter().enumerate() {
            assert_eq!(op.index(), i);
            assert_eq!(MemoryOperation::try_from(i as u8).unwrap(), *op);
        }
        assert!(MemoryOperation::try_from(NUM_MEMORY_OPERATIONS as u8).is_err());
    }

    #[test]
    fn test_status_classes() {
        use ProtocolStatus::*;
        assert!(M.is_dirty() && O.is_dirty());
        assert!(!E.is_dirty() && !S.is_dirty() && !I.is_dirty());
        assert!(E.is_exclusive_owner());
        assert!(!S.is_exclusive_owner());
    }

    #[test]
    fn test_policy_deser() {
        let p: ReplacementPolicy = serde_json::from_str("\"DEAD_OR_LRU\"").unwrap();
        assert_eq!(p, ReplacementPolicy::DeadOrLru);
        let i: InclusivenessPolicy = serde_json::from_str("\"INCLUSIVE_LLC\"").unwrap();
        assert_eq!(i, InclusivenessPolicy::InclusiveLlc);
    }
}
