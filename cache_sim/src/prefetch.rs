use std::collections::VecDeque;

use serde::Deserialize;

use crate::{
    common::MemoryOperation,
    error::ConfigError,
    package::MemoryPackage,
};

/// request generator attached to one cache. generated requests wait in a
/// bounded buffer until the cache finds room in its prefetch MSHR range.
pub trait Prefetcher {
    /// train on a request the cache just admitted.
    fn treat_prefetch(&mut self, package: &MemoryPackage, now: u64);
    fn buffer(&self) -> &RequestBuffer;
    fn buffer_mut(&mut self) -> &mut RequestBuffer;
    fn clock(&mut self, _now: u64) {}
    fn stat(&self) -> PrefetchStat;
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrefetcherConfig {
    #[default]
    Disable,
    Stride {
        stride_table_size: usize,
        prefetch_degree: u32,
        search_distance: u32,
        #[serde(default)]
        next_lines_prefetch: u32,
        request_buffer_size: usize,
    },
}

impl PrefetcherConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, PrefetcherConfig::Disable)
    }

    pub fn build(&self, label: &str, line_size: u32) -> Result<Box<dyn Prefetcher>, ConfigError> {
        Ok(match *self {
            PrefetcherConfig::Disable => Box::new(DisabledPrefetcher::default()),
            PrefetcherConfig::Stride {
                stride_table_size,
                prefetch_degree,
                search_distance,
                next_lines_prefetch,
                request_buffer_size,
            } => {
                if prefetch_degree == 0 {
                    return Err(ConfigError::ZeroPrefetchDegree(label.to_string()));
                }
                Box::new(StridePrefetcher::new(
                    line_size,
                    stride_table_size.max(1),
                    prefetch_degree,
                    search_distance,
                    next_lines_prefetch,
                    request_buffer_size,
                ))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchStat {
    pub created_prefetches: u64,
    pub dropped_prefetches: u64,
    pub full_buffer: u64,
    pub upstride_prefetches: u64,
    pub downstride_prefetches: u64,
    pub request_matches: u64,
    pub next_line_prefetches: u64,
    pub steady_state: u64,
}

#[derive(Debug, Default)]
pub struct RequestBuffer {
    inner: VecDeque<MemoryPackage>,
    capacity: usize,
}

impl RequestBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.capacity
    }
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
    pub fn len(&self) -> usize {
        self.inner.len()
    }
    pub fn front(&self) -> Option<&MemoryPackage> {
        self.inner.front()
    }
    pub fn pop_front(&mut self) -> Option<MemoryPackage> {
        self.inner.pop_front()
    }
    /// `false` if the buffer was full.
    pub fn push_back(&mut self, package: MemoryPackage) -> bool {
        if self.is_full() {
            return false;
        }
        self.inner.push_back(package);
        true
    }
}

#[derive(Default)]
pub struct DisabledPrefetcher {
    buffer: RequestBuffer,
}

impl Prefetcher for DisabledPrefetcher {
    fn treat_prefetch(&mut self, _: &MemoryPackage, _: u64) {}
    fn buffer(&self) -> &RequestBuffer {
        &self.buffer
    }
    fn buffer_mut(&mut self) -> &mut RequestBuffer {
        &mut self.buffer
    }
    fn stat(&self) -> PrefetchStat {
        Default::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrideState {
    #[default]
    Init,
    Transient,
    Steady,
    NoPred,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StrideTableLine {
    pub last_opcode_address: u64,
    pub last_memory_address: u64,
    pub memory_address_difference: i64,
    pub prefetch_ahead: u32,
    pub cycle_last_activation: u64,
    pub stride_state: StrideState,
}

pub struct StridePrefetcher {
    line_size: u32,
    not_offset_mask: u64,
    table: Vec<StrideTableLine>,
    prefetch_degree: u32,
    search_distance: u32,
    next_lines_prefetch: u32,
    last_request_address: u64,
    last_prefetch_address: u64,
    buffer: RequestBuffer,
    stat: PrefetchStat,
}

impl StridePrefetcher {
    pub fn new(
        line_size: u32,
        stride_table_size: usize,
        prefetch_degree: u32,
        search_distance: u32,
        next_lines_prefetch: u32,
        request_buffer_size: usize,
    ) -> Self {
        Self {
            line_size,
            not_offset_mask: !(line_size as u64 - 1),
            table: vec![Default::default(); stride_table_size],
            prefetch_degree,
            search_distance,
            next_lines_prefetch,
            last_request_address: 0,
            last_prefetch_address: 0,
            buffer: RequestBuffer::new(request_buffer_size),
            stat: Default::default(),
        }
    }

    pub fn table(&self) -> &[StrideTableLine] {
        &self.table
    }

    fn cmp_index_tag(&self, a: u64, b: u64) -> bool {
        a & self.not_offset_mask == b & self.not_offset_mask
    }

    fn prefetch_request(opcode_address: u64, memory_address: u64, line_size: u32) -> MemoryPackage {
        MemoryPackage {
            opcode_address,
            memory_address,
            memory_size: line_size,
            memory_operation: MemoryOperation::Prefetch,
            ..Default::default()
        }
    }

    fn move_to(&mut self, slot: usize, state: StrideState, now: u64, address: u64) {
        let line = &mut self.table[slot];
        line.last_memory_address = address;
        line.cycle_last_activation = now;
        line.stride_state = state;
        if state == StrideState::Steady {
            self.stat.steady_state += 1;
        }
    }

    fn emit_strides(&mut self, slot: usize, package: &MemoryPackage) -> u64 {
        let mut new_request_address = 0;
        for _ in 1..=self.prefetch_degree {
            let line = self.table[slot];
            if line.prefetch_ahead >= self.prefetch_degree {
                break;
            }
            let last = package
                .memory_address
                .wrapping_add_signed(line.prefetch_ahead as i64 * line.memory_address_difference);
            new_request_address = last.wrapping_add_signed(line.memory_address_difference);
            if !self.cmp_index_tag(package.memory_address, new_request_address)
                && !self.cmp_index_tag(last, new_request_address)
            {
                let request = Self::prefetch_request(
                    line.last_opcode_address,
                    new_request_address,
                    self.line_size,
                );
                if self.buffer.push_back(request) {
                    self.stat.created_prefetches += 1;
                    if line.memory_address_difference > 0 {
                        self.stat.upstride_prefetches += 1;
                    } else {
                        self.stat.downstride_prefetches += 1;
                    }
                } else {
                    self.stat.full_buffer += 1;
                }
            } else {
                self.stat.dropped_prefetches += 1;
            }
            self.table[slot].prefetch_ahead += 1;
        }
        new_request_address
    }
}

impl Prefetcher for StridePrefetcher {
    fn treat_prefetch(&mut self, package: &MemoryPackage, now: u64) {
        debug_assert!(!package.is_answer, "prefetcher should never receive an answer");
        let mut new_request_address = 0;
        let window = self.search_distance as i64 * self.line_size as i64;
        let found = self
            .table
            .iter()
            .position(|l| l.last_opcode_address == package.opcode_address);
        if let Some(slot) = found {
            let line = self.table[slot];
            let difference = package.memory_address.wrapping_sub(line.last_memory_address) as i64;
            let is_stride_match = difference == line.memory_address_difference
                && difference != 0
                && difference.abs() <= window;
            if is_stride_match {
                self.stat.request_matches += 1;
            }
            use StrideState::*;
            match (line.stride_state, is_stride_match) {
                (Init, true) | (Transient, true) => {
                    self.table[slot].prefetch_ahead = 0;
                    self.move_to(slot, Steady, now, package.memory_address);
                }
                (Init, false) => {
                    self.table[slot].memory_address_difference = difference;
                    self.table[slot].prefetch_ahead = 0;
                    self.move_to(slot, Transient, now, package.memory_address);
                }
                (Transient, false) | (NoPred, false) => {
                    self.table[slot].memory_address_difference = difference;
                    self.table[slot].prefetch_ahead = 0;
                    self.move_to(slot, NoPred, now, package.memory_address);
                }
                (Steady, true) => {
                    if self.table[slot].prefetch_ahead > 0 {
                        self.table[slot].prefetch_ahead -= 1;
                    }
                    self.move_to(slot, Steady, now, package.memory_address);
                    new_request_address = self.emit_strides(slot, package);
                }
                (Steady, false) => {
                    self.table[slot].prefetch_ahead = 0;
                    self.move_to(slot, Init, now, package.memory_address);
                }
                (NoPred, true) => {
                    self.table[slot].prefetch_ahead = 0;
                    self.move_to(slot, Transient, now, package.memory_address);
                }
            }
        }

        let line_size = self.line_size as u64;
        if self.next_lines_prefetch > 0
            && package.memory_address.wrapping_sub(self.last_request_address) <= line_size
            && new_request_address != package.memory_address + line_size
        {
            for index in 1..=self.next_lines_prefetch as u64 {
                let next = package.memory_address + index * line_size;
                if next < self.last_prefetch_address {
                    break;
                }
                self.last_prefetch_address = next;
                let request = Self::prefetch_request(package.opcode_address, next, self.line_size);
                if self.buffer.push_back(request) {
                    self.stat.created_prefetches += 1;
                    self.stat.upstride_prefetches += 1;
                    self.stat.next_line_prefetches += 1;
                } else {
                    self.stat.full_buffer += 1;
                }
            }
        }
        self.last_request_address = package.memory_address;

        if found.is_none() {
            // replace the slot activated the longest time ago
            let mut slot = 0;
            let mut old_cycle = u64::MAX;
            for (i, l) in self.table.iter().enumerate() {
                if old_cycle > l.cycle_last_activation {
                    slot = i;
                    old_cycle = l.cycle_last_activation;
                }
            }
            self.table[slot] = StrideTableLine {
                last_opcode_address: package.opcode_address,
                ..Default::default()
            };
            self.move_to(slot, StrideState::Init, now, package.memory_address);
        }
    }

    fn buffer(&self) -> &RequestBuffer {
        &self.buffer
    }
    fn buffer_mut(&mut self) -> &mut RequestBuffer {
        &mut self.buffer
    }
    fn stat(&self) -> PrefetchStat {
        self.stat
    }
}

#[cfg(feature = "stat")]
pub mod stat {
    use std::fmt;

    use super::PrefetchStat;
    use crate::stat::{percent, Stat, StatView};

    pub struct LabeledPrefetchStat {
        pub label: String,
        pub stat: PrefetchStat,
    }

    impl Stat for LabeledPrefetchStat {
        fn view(&self) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ LabeledPrefetchStat {
        fn header(&self) -> String {
            format!("{} prefetcher", self.label)
        }
        fn width(&self) -> usize {
            44
        }
    }

    impl fmt::Display for &'_ LabeledPrefetchStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = &self.stat;
            let tried = s.created_prefetches + s.dropped_prefetches;
            let dropped = percent(s.dropped_prefetches, tried);
            writeln!(f, "  created:     {:>12}", s.created_prefetches)?;
            writeln!(f, "  dropped:     {:>12} ({dropped:>8.3}%)", s.dropped_prefetches)?;
            writeln!(f, "  full buffer: {:>12}", s.full_buffer)?;
            writeln!(f, "  upstride:    {:>12}", s.upstride_prefetches)?;
            writeln!(f, "  downstride:  {:>12}", s.downstride_prefetches)?;
            writeln!(f, "  next line:   {:>12}", s.next_line_prefetches)?;
            writeln!(f, "  steady:      {:>12}", s.steady_state)?;
            write!(f, "  matches:     {:>12}", s.request_matches)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(pc: u64, addr: u64) -> MemoryPackage {
        MemoryPackage::request(0, 0, pc, 0, addr, 8, MemoryOperation::Read, 0)
    }

    #[test]
    fn test_stride_reaches_steady_and_prefetches() {
        let mut p = StridePrefetcher::new(64, 4, 2, 4, 0, 8);
        // allocate, learn the stride, confirm it
        p.treat_prefetch(&read(0x400, 0x1000), 1);
        p.treat_prefetch(&read(0x400, 0x1080), 2);
        p.treat_prefetch(&read(0x400, 0x1100), 3);
        assert_eq!(p.table()[0].stride_state, StrideState::Steady);
        assert!(p.buffer().is_empty());
        p.treat_prefetch(&read(0x400, 0x1180), 4);
        assert_eq!(p.buffer().len(), 2);
        assert_eq!(p.buffer().front().unwrap().memory_address, 0x1200);
        assert_eq!(
            p.buffer().front().unwrap().memory_operation,
            MemoryOperation::Prefetch
        );
        assert_eq!(p.stat().upstride_prefetches, 2);
    }

    #[test]
    fn test_stride_outside_window_never_matches() {
        let mut p = StridePrefetcher::new(64, 2, 1, 1, 0, 8);
        p.treat_prefetch(&read(0x10, 0x0), 1);
        p.treat_prefetch(&read(0x10, 0x1000), 2);
        p.treat_prefetch(&read(0x10, 0x2000), 3);
        assert_eq!(p.table()[0].stride_state, StrideState::NoPred);
        assert_eq!(p.stat().request_matches, 0);
    }

    #[test]
    fn test_slot_replacement_by_activation() {
        let mut p = StridePrefetcher::new(64, 2, 1, 4, 0, 8);
        p.treat_prefetch(&read(0x10, 0x0), 5);
        p.treat_prefetch(&read(0x20, 0x0), 6);
        p.treat_prefetch(&read(0x30, 0x0), 7);
        let pcs: Vec<_> = p.table().iter().map(|l| l.last_opcode_address).collect();
        assert_eq!(pcs, vec![0x30, 0x20]);
    }

    #[test]
    fn test_next_line() {
        let mut p = StridePrefetcher::new(64, 2, 1, 4, 2, 1);
        p.treat_prefetch(&read(0x10, 0x0), 1);
        assert_eq!(p.buffer().len(), 1);
        assert_eq!(p.stat().full_buffer, 1);
        assert_eq!(p.buffer().front().unwrap().memory_address, 0x40);
        // far away from the previous request, no next line
        p.buffer_mut().pop_front();
        p.treat_prefetch(&read(0x20, 0x9000), 2);
        assert!(p.buffer().is_empty());
    }

    #[test]
    fn test_zero_degree_rejected() {
        let c = PrefetcherConfig::Stride {
            stride_table_size: 4,
            prefetch_degree: 0,
            search_distance: 1,
            next_lines_prefetch: 0,
            request_buffer_size: 4,
        };
        assert!(c.build("L1", 64).is_err());
        assert!(PrefetcherConfig::Disable.build("L1", 64).is_ok());
    }
}
