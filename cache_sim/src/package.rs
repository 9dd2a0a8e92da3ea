use std::fmt::Display;

use crate::common::{ComponentId, MemoryOperation, PackageState};

/// one in-flight memory transaction as seen by a single component.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPackage {
    pub id_owner: ComponentId,
    pub opcode_number: u64,
    pub opcode_address: u64,
    pub uop_number: u64,
    pub memory_address: u64,
    pub memory_size: u32,
    pub memory_operation: MemoryOperation,
    pub state: PackageState,
    pub is_answer: bool,
    pub id_src: ComponentId,
    pub id_dst: ComponentId,
    pub ready_cycle: u64,
    pub born_cycle: u64,
    /// one flag per byte of the line.
    pub sub_blocks: Vec<bool>,
}

impl Default for MemoryPackage {
    fn default() -> Self {
        Self {
            id_owner: 0,
            opcode_number: 0,
            opcode_address: 0,
            uop_number: 0,
            memory_address: 0,
            memory_size: 0,
            memory_operation: MemoryOperation::Read,
            state: PackageState::Untreated,
            is_answer: false,
            id_src: 0,
            id_dst: 0,
            ready_cycle: 0,
            born_cycle: 0,
            sub_blocks: Vec::new(),
        }
    }
}

impl MemoryPackage {
    /// a fresh request leaving `owner`, stamped with `now`.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        owner: ComponentId,
        opcode_number: u64,
        opcode_address: u64,
        uop_number: u64,
        memory_address: u64,
        memory_size: u32,
        memory_operation: MemoryOperation,
        now: u64,
    ) -> Self {
        Self {
            id_owner: owner,
            opcode_number,
            opcode_address,
            uop_number,
            memory_address,
            memory_size,
            memory_operation,
            state: PackageState::Untreated,
            is_answer: false,
            id_src: owner,
            id_dst: owner,
            ready_cycle: now,
            born_cycle: now,
            sub_blocks: Vec::new(),
        }
    }

    pub fn package_set_src_dst(&mut self, src: ComponentId, dst: ComponentId) {
        self.id_src = src;
        self.id_dst = dst;
    }

    pub fn package_untreated(&mut self, now: u64, stall: u64) {
        self.ready_cycle = now + stall;
        self.state = PackageState::Untreated;
    }

    pub fn package_wait(&mut self, now: u64, stall: u64) {
        self.ready_cycle = now + stall;
        self.state = PackageState::Wait;
    }

    pub fn package_ready(&mut self, now: u64, stall: u64) {
        self.ready_cycle = now + stall;
        self.state = PackageState::Ready;
    }

    pub fn package_transmit(&mut self, now: u64, stall: u64) {
        self.ready_cycle = now + stall;
        self.state = PackageState::Transmit;
    }

    /// `false` if the package has been alive for longer than `max_alive_time`.
    pub fn check_age(&self, now: u64, max_alive_time: u64) -> bool {
        self.born_cycle >= now.saturating_sub(max_alive_time)
    }

    pub fn is_ready_at(&self, now: u64) -> bool {
        self.ready_cycle <= now
    }
}

impl Display for MemoryPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OWNER:{} OPCODE:#{}({:#x}) UOP:#{} | {} {:#x} size:{} | {} answer:{} | {}->{} | ready:{} born:{}",
            self.id_owner,
            self.opcode_number,
            self.opcode_address,
            self.uop_number,
            self.memory_operation,
            self.memory_address,
            self.memory_size,
            self.state,
            self.is_answer,
            self.id_src,
            self.id_dst,
            self.ready_cycle,
            self.born_cycle,
        )
    }
}
