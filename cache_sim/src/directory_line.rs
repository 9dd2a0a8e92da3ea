use std::fmt::Display;

use crate::{
    common::{CacheId, ComponentId, LockType, MemoryOperation},
    package::MemoryPackage,
};

/// bookkeeping for one transaction crossing cache levels.
#[derive(Debug, Clone)]
pub struct DirectoryLine {
    pub id_owner: ComponentId,
    pub opcode_number: u64,
    pub opcode_address: u64,
    pub uop_number: u64,
    pub lock_type: LockType,
    /// indexed by cache id, 0 means the cache is not part of the chain.
    pub cache_request_order: Vec<u32>,
    pub cache_requested: u32,
    pub initial_memory_operation: MemoryOperation,
    pub initial_memory_address: u64,
    pub initial_memory_size: u32,
    pub born_cycle: u64,
}

impl DirectoryLine {
    pub fn new(package: &MemoryPackage, lock_type: LockType, total_caches: usize, now: u64) -> Self {
        Self {
            id_owner: package.id_owner,
            opcode_number: package.opcode_number,
            opcode_address: package.opcode_address,
            uop_number: package.uop_number,
            lock_type,
            cache_request_order: vec![0; total_caches],
            cache_requested: 0,
            initial_memory_operation: package.memory_operation,
            initial_memory_address: package.memory_address,
            initial_memory_size: package.memory_size,
            born_cycle: now,
        }
    }

    /// pushes `cache_id` on top of the requester chain.
    pub fn stamp(&mut self, cache_id: CacheId) {
        self.cache_requested += 1;
        self.cache_request_order[cache_id] = self.cache_requested;
    }

    pub fn count_requesters(&self) -> u32 {
        self.cache_request_order.iter().filter(|o| **o != 0).count() as u32
    }

    /// the cache whose turn is `order` in the chain.
    pub fn requester_at(&self, order: u32) -> Option<CacheId> {
        self.cache_request_order.iter().position(|o| *o == order)
    }

    pub fn is_same_transaction(&self, package: &MemoryPackage) -> bool {
        self.id_owner == package.id_owner
            && self.opcode_number == package.opcode_number
            && self.uop_number == package.uop_number
    }

    pub fn check_age(&self, now: u64, max_alive_time: u64) -> bool {
        self.born_cycle >= now.saturating_sub(max_alive_time)
    }
}

impl Display for DirectoryLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OWNER:{} OPCODE:#{}({:#x}) UOP:#{} LOCK:{} | {} {:#x} size:{} | requested:{} order:{:?} born:{}",
            self.id_owner,
            self.opcode_number,
            self.opcode_address,
            self.uop_number,
            self.lock_type,
            self.initial_memory_operation,
            self.initial_memory_address,
            self.initial_memory_size,
            self.cache_requested,
            self.cache_request_order,
            self.born_cycle,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_chain() {
        let p = MemoryPackage::request(9, 3, 0x400, 1, 0x1000, 8, MemoryOperation::Read, 0);
        let mut d = DirectoryLine::new(&p, LockType::Read, 4, 0);
        d.stamp(0);
        d.stamp(2);
        assert_eq!(d.cache_requested, 2);
        assert_eq!(d.count_requesters(), 2);
        assert_eq!(d.requester_at(1), Some(0));
        assert_eq!(d.requester_at(2), Some(2));
        assert_eq!(d.requester_at(3), None);
        assert!(d.is_same_transaction(&p));
    }
}
