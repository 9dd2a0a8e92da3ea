use std::{fmt, ops::Range};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    bin::{extract, is_power_of_two, log2, mask},
    cache_line::{CacheLine, CacheSet},
    common::{
        AddressMaskType, CacheId, MemoryOperation, PackageState, ProtocolStatus,
        ReplacementPolicy, NUM_MEMORY_OPERATIONS,
    },
    config::CacheConfig,
    directory::DirectoryController,
    error::{ConfigError, ProtocolError},
    line_usage_predictor::LineUsagePredictor,
    package::MemoryPackage,
    prefetch::Prefetcher,
};

/// anything outside the cache arena able to take a package.
pub trait PackageSink {
    fn interconnect_latency(&self) -> u64;
    /// `Ok(false)` if the destination is busy this cycle.
    fn deliver(&mut self, package: &MemoryPackage, now: u64) -> Result<bool, ProtocolError>;
}

#[derive(Debug, Clone)]
struct AddressMasks {
    offset: Range<u32>,
    index: Range<u32>,
    bank: Range<u32>,
    tag: Range<u32>,
}

impl AddressMasks {
    fn new(kind: AddressMaskType, line_size: u32, total_sets: u32, total_banks: u32) -> Self {
        let ob = log2(line_size as u64);
        let ib = log2(total_sets as u64);
        let bb = log2(total_banks as u64);
        match kind {
            AddressMaskType::TagIndexOffset => Self {
                offset: 0..ob,
                index: ob..ob + ib,
                bank: 0..0,
                tag: ob + ib..64,
            },
            AddressMaskType::TagIndexBankOffset => Self {
                offset: 0..ob,
                bank: ob..ob + bb,
                index: ob + bb..ob + bb + ib,
                tag: ob + bb + ib..64,
            },
            AddressMaskType::TagBankIndexOffset => Self {
                offset: 0..ob,
                index: ob..ob + ib,
                bank: ob + ib..ob + ib + bb,
                tag: ob + ib + bb..64,
            },
        }
    }
}

/// throughput limiter of one traffic class.
#[derive(Debug, Clone, Copy, Default)]
struct Throttle {
    ready_cycle: u64,
    latency: u64,
}

impl Throttle {
    fn new(latency: u64) -> Self {
        Self {
            ready_cycle: 0,
            latency,
        }
    }
    #[inline]
    fn is_ready(&self, now: u64) -> bool {
        self.ready_cycle <= now
    }
    #[inline]
    fn consume(&mut self, now: u64) {
        self.ready_cycle = now + self.latency;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStat {
    pub min: u64,
    pub max: u64,
    pub accumulated: u64,
    pub count: u64,
}

impl Default for WaitStat {
    fn default() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            accumulated: 0,
            count: 0,
        }
    }
}

impl WaitStat {
    pub fn add(&mut self, cycles: u64) {
        self.min = self.min.min(cycles);
        self.max = self.max.max(cycles);
        self.accumulated += cycles;
        self.count += 1;
    }
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.accumulated as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStat {
    pub accesses: u64,
    pub hit: [u64; NUM_MEMORY_OPERATIONS],
    pub miss: [u64; NUM_MEMORY_OPERATIONS],
    pub sub_block_miss: u64,
    pub invalidation: u64,
    pub eviction: u64,
    pub writeback: u64,
    pub final_eviction: u64,
    pub final_writeback: u64,
    pub full_mshr_request: u64,
    pub full_mshr_writeback: u64,
    pub full_mshr_prefetch: u64,
    pub wait: [WaitStat; NUM_MEMORY_OPERATIONS],
}

impl CacheStat {
    pub fn add_hit(&mut self, op: MemoryOperation) {
        self.accesses += 1;
        self.hit[op.index()] += 1;
    }
    pub fn add_miss(&mut self, op: MemoryOperation) {
        self.accesses += 1;
        self.miss[op.index()] += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MshrRange {
    Request,
    Writeback,
    Prefetch,
}

/// one cache (or one bank of a cache): tag array, MSHR and throttles.
///
/// the cache never reasons about coherence. every status change comes from the
/// [`DirectoryController`].
pub struct CacheMemory {
    pub id: CacheId,
    pub label: String,
    pub hierarchy_level: u32,
    pub bank_number: u32,
    pub total_banks: u32,
    pub line_size: u32,
    pub line_number: u32,
    pub associativity: u32,
    pub total_sets: u32,
    pub replacement: ReplacementPolicy,
    pub penalty_read: u64,
    pub penalty_write: u64,
    masks: AddressMasks,
    sets: Vec<CacheSet>,
    mshr: Vec<Option<MemoryPackage>>,
    mshr_request_size: usize,
    mshr_writeback_size: usize,
    mshr_prefetch_size: usize,
    born_ordered: Vec<usize>,
    pub higher_level: Vec<CacheId>,
    pub lower_level: Vec<CacheId>,
    pub predictor: Box<dyn LineUsagePredictor>,
    pub prefetcher: Box<dyn Prefetcher>,
    send_answer: Throttle,
    send_request: Throttle,
    recv_answer: Throttle,
    recv_read: Throttle,
    recv_write: Throttle,
    rng: StdRng,
    /// opcode numbers of generated prefetches. writebacks own number 0.
    prefetch_sequence: u64,
    pub stat: CacheStat,
}

impl CacheMemory {
    pub fn new(id: CacheId, config: &CacheConfig, line_size: u32) -> Result<Self, ConfigError> {
        let label = config.label.clone();
        if !is_power_of_two(line_size as u64) {
            return Err(ConfigError::LineSizeNotPowerOfTwo(line_size));
        }
        if config.associativity == 0
            || config.line_number % config.associativity != 0
            || !is_power_of_two((config.line_number / config.associativity) as u64)
        {
            return Err(ConfigError::SetsNotPowerOfTwo {
                label,
                line_number: config.line_number,
                associativity: config.associativity,
            });
        }
        if !is_power_of_two(config.total_banks as u64)
            || config.bank_number >= config.total_banks
            || (config.total_banks > 1 && config.address_mask == AddressMaskType::TagIndexOffset)
        {
            return Err(ConfigError::WrongBanks {
                label,
                bank_number: config.bank_number,
                total_banks: config.total_banks,
            });
        }
        for (size, range) in [
            (config.mshr_request_size, "request"),
            (config.mshr_writeback_size, "writeback"),
            (config.mshr_prefetch_size, "prefetch"),
        ] {
            if size == 0 {
                return Err(ConfigError::EmptyMshrRange { label, range });
            }
        }
        if matches!(config.replacement, ReplacementPolicy::Fifo | ReplacementPolicy::Lrf) {
            return Err(ConfigError::UnimplementedReplacement {
                label,
                policy: config.replacement,
            });
        }
        if config.total_banks > 1 && config.prefetcher.is_enabled() {
            return Err(ConfigError::PrefetchOnBankedCache(label));
        }

        let total_sets = config.line_number / config.associativity;
        let masks = AddressMasks::new(config.address_mask, line_size, total_sets, config.total_banks);
        let sets = (0..total_sets as u64)
            .map(|index| {
                CacheSet::new(
                    (0..config.associativity as u64)
                        .map(|way| {
                            CacheLine::new(
                                (way << masks.tag.start)
                                    | (index << masks.index.start)
                                    | ((config.bank_number as u64) << masks.bank.start),
                            )
                        })
                        .collect(),
                )
            })
            .collect();
        let mshr_size = config.mshr_request_size + config.mshr_writeback_size + config.mshr_prefetch_size;
        let throttle = &config.throttle;
        Ok(Self {
            id,
            prefetcher: config.prefetcher.build(&label, line_size)?,
            predictor: config.line_usage_predictor.build(line_size),
            label,
            hierarchy_level: config.hierarchy_level,
            bank_number: config.bank_number,
            total_banks: config.total_banks,
            line_size,
            line_number: config.line_number,
            associativity: config.associativity,
            total_sets,
            replacement: config.replacement,
            penalty_read: config.penalty_read,
            penalty_write: config.penalty_write,
            masks,
            sets,
            mshr: vec![None; mshr_size],
            mshr_request_size: config.mshr_request_size,
            mshr_writeback_size: config.mshr_writeback_size,
            mshr_prefetch_size: config.mshr_prefetch_size,
            born_ordered: Vec::with_capacity(mshr_size),
            higher_level: Vec::new(),
            lower_level: Vec::new(),
            send_answer: Throttle::new(throttle.send_answer),
            send_request: Throttle::new(throttle.send_request),
            recv_answer: Throttle::new(throttle.recv_answer),
            recv_read: Throttle::new(throttle.recv_read),
            recv_write: Throttle::new(throttle.recv_write),
            rng: StdRng::seed_from_u64(config.random_seed),
            prefetch_sequence: 1,
            stat: Default::default(),
        })
    }

    #[inline]
    pub fn is_last_level(&self) -> bool {
        self.lower_level.is_empty()
    }

    // ---- address masks ----

    #[inline]
    pub fn get_tag(&self, addr: u64) -> u64 {
        mask(addr, self.masks.tag.clone())
    }
    #[inline]
    pub fn get_index(&self, addr: u64) -> usize {
        extract(addr, self.masks.index.clone()) as usize
    }
    #[inline]
    pub fn get_bank(&self, addr: u64) -> u32 {
        extract(addr, self.masks.bank.clone()) as u32
    }
    /// address of the first byte of the line holding `addr`.
    #[inline]
    pub fn line_address(&self, addr: u64) -> u64 {
        mask(addr, self.masks.offset.end..64)
    }
    #[inline]
    pub fn cmp_tag_index_bank(&self, a: u64, b: u64) -> bool {
        self.line_address(a) == self.line_address(b)
    }

    // ---- tag array ----

    pub fn find_line(&self, addr: u64) -> Option<(usize, usize)> {
        let index = self.get_index(addr);
        self.sets[index]
            .ways
            .iter()
            .position(|l| self.cmp_tag_index_bank(l.tag, addr))
            .map(|way| (index, way))
    }

    /// the status of the line holding `addr`, `I` when absent.
    pub fn line_status(&self, addr: u64) -> ProtocolStatus {
        self.find_line(addr)
            .map(|(index, way)| self.sets[index].ways[way].status)
            .unwrap_or(ProtocolStatus::I)
    }

    #[inline]
    pub fn line(&self, index: usize, way: usize) -> &CacheLine {
        &self.sets[index].ways[way]
    }

    pub fn sets(&self) -> &[CacheSet] {
        &self.sets
    }

    pub fn change_address(&mut self, index: usize, way: usize, addr: u64) {
        let tag = self.line_address(addr);
        self.sets[index].ways[way].tag = tag;
    }

    pub fn change_status(&mut self, index: usize, way: usize, status: ProtocolStatus) {
        self.sets[index].ways[way].status = status;
    }

    pub fn update_last_access(&mut self, index: usize, way: usize, now: u64) {
        let line = &mut self.sets[index].ways[way];
        line.last_access = now;
        line.usage_counter += 1;
    }

    /// chooses a victim way in the set of `addr`. lines whose address is locked
    /// by an in-flight transaction are never chosen.
    pub fn evict_address(
        &mut self,
        addr: u64,
        is_locked: impl Fn(u64) -> bool,
    ) -> Result<Option<(usize, usize)>, ProtocolError> {
        let index = self.get_index(addr);
        let way = match self.replacement {
            ReplacementPolicy::Lru => self.lru_victim(index, addr, &is_locked, false)?,
            ReplacementPolicy::DeadOrLru => self.lru_victim(index, addr, &is_locked, true)?,
            ReplacementPolicy::InvalidOrLru => {
                let invalid = self.sets[index]
                    .ways
                    .iter()
                    .position(|l| l.status == ProtocolStatus::I && !is_locked(l.tag));
                match invalid {
                    Some(way) => Some(way),
                    None => self.lru_victim(index, addr, &is_locked, false)?,
                }
            }
            ReplacementPolicy::Random => {
                let way = self.rng.random_range(0..self.associativity as usize);
                (!is_locked(self.sets[index].ways[way].tag)).then_some(way)
            }
            policy @ (ReplacementPolicy::Fifo | ReplacementPolicy::Lrf) => {
                return Err(ProtocolError::UnsupportedReplacement {
                    cache_id: self.id,
                    policy,
                })
            }
        };
        if way.is_none() {
            log::warn!("{}: could not evict a line in set {} for {:#x}", self.label, index, addr);
        }
        Ok(way.map(|way| (index, way)))
    }

    /// the last way holding the minimum `last_access` wins ties.
    fn lru_victim(
        &self,
        index: usize,
        addr: u64,
        is_locked: &impl Fn(u64) -> bool,
        dead_aware: bool,
    ) -> Result<Option<usize>, ProtocolError> {
        let mut best = u64::MAX;
        let mut choice = None;
        let mut dead = None;
        for (way, line) in self.sets[index].ways.iter().enumerate() {
            if is_locked(line.tag) {
                if self.cmp_tag_index_bank(line.tag, addr) {
                    return Err(ProtocolError::EvictLockedTag {
                        cache_id: self.id,
                        address: addr,
                    });
                }
                continue;
            }
            if line.last_access <= best {
                best = line.last_access;
                choice = Some(way);
                if dead_aware && self.predictor.check_line_is_last_access(index, way) {
                    dead = Some(way);
                }
            }
        }
        Ok(dead.or(choice))
    }

    // ---- mshr ----

    fn range_of(&self, range: MshrRange) -> Range<usize> {
        let r = self.mshr_request_size;
        let w = self.mshr_writeback_size;
        match range {
            MshrRange::Request => 0..r,
            MshrRange::Writeback => r..r + w,
            MshrRange::Prefetch => r + w..r + w + self.mshr_prefetch_size,
        }
    }

    fn allocate(&mut self, range: MshrRange, package: MemoryPackage) -> Option<usize> {
        let slot = self.range_of(range).find(|i| self.mshr[*i].is_none());
        match slot {
            Some(slot) => {
                self.mshr[slot] = Some(package);
                self.insert_born_ordered(slot);
            }
            None => match range {
                MshrRange::Request => self.stat.full_mshr_request += 1,
                MshrRange::Writeback => self.stat.full_mshr_writeback += 1,
                MshrRange::Prefetch => self.stat.full_mshr_prefetch += 1,
            },
        }
        slot
    }

    pub fn allocate_request(&mut self, package: MemoryPackage) -> Option<usize> {
        self.allocate(MshrRange::Request, package)
    }

    pub fn allocate_writeback(&mut self, package: MemoryPackage) -> Option<usize> {
        self.allocate(MshrRange::Writeback, package)
    }

    pub fn allocate_prefetch(&mut self, mut package: MemoryPackage, now: u64) -> Option<usize> {
        package.id_owner = self.id;
        package.opcode_number = self.prefetch_sequence;
        package.package_set_src_dst(self.id, self.id);
        package.born_cycle = now;
        package.package_untreated(now, 0);
        let slot = self.allocate(MshrRange::Prefetch, package);
        if slot.is_some() {
            self.prefetch_sequence += 1;
        }
        slot
    }

    /// keeps `born_ordered` sorted by `born_cycle`, oldest first; equal ages
    /// keep their arrival order.
    fn insert_born_ordered(&mut self, slot: usize) {
        let Some(born) = self.mshr[slot].as_ref().map(|p| p.born_cycle) else {
            return;
        };
        let position = self
            .born_ordered
            .iter()
            .rposition(|s| self.mshr[*s].as_ref().is_some_and(|p| p.born_cycle <= born))
            .map_or(0, |p| p + 1);
        self.born_ordered.insert(position, slot);
    }

    /// resets the age of `slot`, sending it behind every other entry.
    fn rebirth(&mut self, slot: usize, now: u64) {
        if let Some(p) = self.mshr[slot].as_mut() {
            p.born_cycle = now;
        }
        self.born_ordered.retain(|s| *s != slot);
        self.insert_born_ordered(slot);
    }

    fn release(&mut self, slot: usize) -> Option<MemoryPackage> {
        self.born_ordered.retain(|s| *s != slot);
        self.mshr[slot].take()
    }

    pub fn mshr_package(&self, slot: usize) -> Option<&MemoryPackage> {
        self.mshr.get(slot).and_then(|p| p.as_ref())
    }

    /// in-flight entries, oldest first.
    pub fn mshr_born_ordered(&self) -> impl Iterator<Item = (usize, &MemoryPackage)> {
        self.born_ordered
            .iter()
            .filter_map(|s| self.mshr[*s].as_ref().map(|p| (*s, p)))
    }

    pub fn mshr_len(&self) -> usize {
        self.born_ordered.len()
    }

    pub fn is_idle(&self) -> bool {
        self.born_ordered.is_empty() && self.prefetcher.buffer().is_empty()
    }

    /// every MSHR entry waiting for an answer on the line of `addr`.
    pub fn waiting_on_line(&mut self, addr: u64) -> impl Iterator<Item = &mut MemoryPackage> {
        let line = self.line_address(addr);
        let not_offset = !(self.line_size as u64 - 1);
        self.mshr.iter_mut().flatten().filter(move |p| {
            p.state == PackageState::Wait && p.memory_address & not_offset == line
        })
    }

    fn first_eligible(&self, now: u64, pred: impl Fn(&MemoryPackage) -> bool) -> Option<usize> {
        self.born_ordered.iter().copied().find(|s| {
            self.mshr[*s]
                .as_ref()
                .is_some_and(|p| p.is_ready_at(now) && pred(p))
        })
    }

    fn retire_ready(&mut self, now: u64) {
        let ready: Vec<usize> = self
            .born_ordered
            .iter()
            .copied()
            .filter(|s| {
                self.mshr[*s]
                    .as_ref()
                    .is_some_and(|p| p.state == PackageState::Ready && p.is_ready_at(now))
            })
            .collect();
        for slot in ready {
            if let Some(p) = self.release(slot) {
                self.stat.wait[p.memory_operation.index()].add(now.saturating_sub(p.born_cycle));
            }
        }
    }

    pub fn stale_packages(&self, now: u64, max_alive_time: u64) -> impl Iterator<Item = &MemoryPackage> {
        self.mshr
            .iter()
            .flatten()
            .filter(move |p| !p.check_age(now, max_alive_time))
    }

    /// admission into the MSHR. `Ok(false)` when throttled or out of slots.
    pub fn receive_package(
        &mut self,
        package: &MemoryPackage,
        now: u64,
        latency: u64,
    ) -> Result<bool, ProtocolError> {
        if package.id_dst != self.id {
            return Err(ProtocolError::WrongDestination {
                component: self.id,
                package: package.to_string(),
            });
        }
        if self.total_banks > 1 && self.get_bank(package.memory_address) != self.bank_number {
            return Err(ProtocolError::WrongBank {
                cache_id: self.id,
                package: package.to_string(),
            });
        }
        if package.is_answer {
            if !self.recv_answer.is_ready(now) {
                return Ok(false);
            }
            let line = self.line_address(package.memory_address);
            let not_offset = !(self.line_size as u64 - 1);
            let waiting = self.mshr.iter_mut().flatten().find(|p| {
                p.state == PackageState::Wait
                    && p.opcode_number == package.opcode_number
                    && p.uop_number == package.uop_number
                    && p.id_owner == package.id_owner
                    && p.memory_address & not_offset == line
            });
            let Some(waiting) = waiting else {
                return Err(ProtocolError::UnwantedAnswer {
                    component: self.id,
                    package: package.to_string(),
                });
            };
            waiting.is_answer = package.is_answer;
            waiting.memory_size = package.memory_size;
            waiting.package_set_src_dst(package.id_src, package.id_dst);
            waiting.package_untreated(now, latency + 1);
            self.recv_answer.consume(now);
            return Ok(true);
        }

        let is_read = matches!(
            package.memory_operation,
            MemoryOperation::Read | MemoryOperation::Inst | MemoryOperation::Prefetch
        );
        let throttle = if is_read {
            &mut self.recv_read
        } else {
            &mut self.recv_write
        };
        if !throttle.is_ready(now) {
            return Ok(false);
        }
        let mut admitted = package.clone();
        admitted.package_untreated(now, latency);
        if self.allocate_request(admitted).is_none() {
            return Ok(false);
        }
        if is_read {
            self.recv_read.consume(now);
        } else {
            self.recv_write.consume(now);
        }
        if package.memory_operation != MemoryOperation::Writeback {
            self.prefetcher.treat_prefetch(package, now);
        }
        Ok(true)
    }

    /// one cycle of the cache at `cache_id`.
    ///
    /// retires finished entries, then handles at most one entry per class in
    /// priority order: transmit answer, transmit request, untreated answer,
    /// untreated request. finally moves one prefetch into the MSHR.
    pub fn clock(
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        directory: &mut DirectoryController,
        sink: &mut dyn PackageSink,
        now: u64,
    ) -> Result<(), ProtocolError> {
        if caches[cache_id].is_idle() {
            return Ok(());
        }
        caches[cache_id].retire_ready(now);

        let cache = &caches[cache_id];
        if let Some(slot) =
            cache.first_eligible(now, |p| p.state == PackageState::Transmit && p.is_answer)
        {
            if Self::send(caches, cache_id, slot, sink, now)? {
                let cache = &mut caches[cache_id];
                let latency = cache.send_answer.latency;
                if let Some(p) = cache.mshr[slot].as_mut() {
                    p.package_ready(now, latency);
                }
            }
        }

        let cache = &caches[cache_id];
        if let Some(slot) =
            cache.first_eligible(now, |p| p.state == PackageState::Transmit && !p.is_answer)
        {
            if Self::send(caches, cache_id, slot, sink, now)? {
                if let Some(mut package) = caches[cache_id].mshr[slot].clone() {
                    let state = directory.treat_cache_request_sent(caches, cache_id, &package)?;
                    let cache = &mut caches[cache_id];
                    let latency = cache.send_request.latency;
                    match state {
                        PackageState::Wait => package.package_wait(now, latency),
                        _ => package.package_ready(now, latency),
                    }
                    cache.mshr[slot] = Some(package);
                }
            }
        }

        let cache = &caches[cache_id];
        if let Some(slot) =
            cache.first_eligible(now, |p| p.state == PackageState::Untreated && p.is_answer)
        {
            if let Some(mut package) = caches[cache_id].mshr[slot].clone() {
                let state = directory.treat_cache_answer(caches, cache_id, &mut package, now)?;
                let cache = &mut caches[cache_id];
                cache.mshr[slot] = Some(package);
                if state == PackageState::Untreated {
                    cache.rebirth(slot, now);
                }
            }
        }

        let cache = &caches[cache_id];
        if let Some(slot) =
            cache.first_eligible(now, |p| p.state == PackageState::Untreated && !p.is_answer)
        {
            if let Some(mut package) = caches[cache_id].mshr[slot].clone() {
                let state = directory.treat_cache_request(caches, cache_id, &mut package, now)?;
                let cache = &mut caches[cache_id];
                let retry = state == PackageState::Untreated && !package.is_answer;
                cache.mshr[slot] = Some(package);
                if retry {
                    cache.rebirth(slot, now);
                }
            }
        }

        let cache = &mut caches[cache_id];
        if let Some(prefetch) = cache.prefetcher.buffer().front().cloned() {
            if cache.allocate_prefetch(prefetch, now).is_some() {
                cache.prefetcher.buffer_mut().pop_front();
            }
        }
        cache.prefetcher.clock(now);
        Ok(())
    }

    fn send(
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        slot: usize,
        sink: &mut dyn PackageSink,
        now: u64,
    ) -> Result<bool, ProtocolError> {
        let cache = &caches[cache_id];
        let Some(package) = cache.mshr[slot].clone() else {
            return Ok(false);
        };
        let throttle = if package.is_answer {
            cache.send_answer
        } else {
            cache.send_request
        };
        if !throttle.is_ready(now) {
            return Ok(false);
        }
        let latency = sink.interconnect_latency();
        let delivered = match caches.get_mut(package.id_dst) {
            Some(dst) => dst.receive_package(&package, now, latency)?,
            None => sink.deliver(&package, now)?,
        };
        if delivered {
            let cache = &mut caches[cache_id];
            if package.is_answer {
                cache.send_answer.consume(now);
            } else {
                cache.send_request.consume(now);
            }
        }
        Ok(delivered)
    }

    pub fn lines_view(&self) -> LinesView<'_> {
        LinesView(self)
    }

    pub fn mshr_view(&self) -> MshrView<'_> {
        MshrView(self)
    }
}

/// every valid line of the cache.
pub struct LinesView<'a>(&'a CacheMemory);

impl fmt::Display for LinesView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.0;
        writeln!(
            f,
            "{} (level {}, bank {}/{}, {} sets x {} ways)",
            c.label, c.hierarchy_level, c.bank_number, c.total_banks, c.total_sets, c.associativity
        )?;
        for (index, set) in c.sets.iter().enumerate() {
            for (way, line) in set.ways.iter().enumerate() {
                if line.status != ProtocolStatus::I {
                    writeln!(f, "  [{index:>5}][{way:>2}] {line}")?;
                }
            }
        }
        Ok(())
    }
}

pub struct MshrView<'a>(&'a CacheMemory);

impl fmt::Display for MshrView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.0;
        writeln!(
            f,
            "{} mshr {}/{} (request {}, writeback {}, prefetch {})",
            c.label,
            c.mshr_len(),
            c.mshr.len(),
            c.mshr_request_size,
            c.mshr_writeback_size,
            c.mshr_prefetch_size
        )?;
        for (slot, p) in c.mshr_born_ordered() {
            writeln!(f, "  #{slot:<3} {p}")?;
        }
        Ok(())
    }
}

#[cfg(feature = "stat")]
pub mod stat {
    use std::fmt;

    use super::{CacheMemory, CacheStat};
    use crate::{
        common::MemoryOperation,
        stat::{percent, AddStats, Stat, StatView, Stats},
    };

    pub struct LabeledCacheStat {
        pub label: String,
        pub stat: CacheStat,
    }

    pub struct CacheStatView<'a> {
        label: &'a str,
        stat: &'a CacheStat,
    }

    impl Stat for LabeledCacheStat {
        fn view(&self) -> Box<dyn StatView + '_> {
            Box::new(CacheStatView {
                label: &self.label,
                stat: &self.stat,
            })
        }
    }

    impl StatView for CacheStatView<'_> {
        fn header(&self) -> String {
            format!("cache {}", self.label)
        }
        fn width(&self) -> usize {
            64
        }
    }

    impl fmt::Display for CacheStatView<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = self.stat;
            let hits: u64 = s.hit.iter().sum();
            writeln!(
                f,
                "  accesses: {:>12} (hit rate {:>6.2}%)",
                s.accesses,
                percent(hits, s.accesses)
            )?;
            for op in MemoryOperation::ALL {
                let i = op.index();
                let w = &s.wait[i];
                writeln!(
                    f,
                    "  {:<10} hit {:>10} miss {:>10} wait avg {:>8.2} max {:>8}",
                    op.to_string(),
                    s.hit[i],
                    s.miss[i],
                    w.average(),
                    w.max
                )?;
            }
            writeln!(f, "  sub-block miss: {:>12}", s.sub_block_miss)?;
            writeln!(f, "  invalidation:   {:>12}", s.invalidation)?;
            writeln!(f, "  eviction:       {:>12}", s.eviction)?;
            writeln!(f, "  writeback:      {:>12}", s.writeback)?;
            writeln!(f, "  final eviction: {:>12}", s.final_eviction)?;
            writeln!(f, "  final writeback:{:>12}", s.final_writeback)?;
            write!(
                f,
                "  full mshr: request {} writeback {} prefetch {}",
                s.full_mshr_request, s.full_mshr_writeback, s.full_mshr_prefetch
            )
        }
    }

    impl AddStats for CacheMemory {
        fn add_stats(&self, buf: &mut Stats) {
            use crate::{
                line_usage_predictor::stat::LabeledPredictorStat,
                prefetch::stat::LabeledPrefetchStat,
            };
            buf.push(Box::new(LabeledCacheStat {
                label: self.label.clone(),
                stat: self.stat.clone(),
            }));
            buf.push(Box::new(LabeledPredictorStat {
                label: self.label.clone(),
                stat: self.predictor.stat(),
            }));
            if self.prefetcher.stat() != Default::default() {
                buf.push(Box::new(LabeledPrefetchStat {
                    label: self.label.clone(),
                    stat: self.prefetcher.stat(),
                }));
            }
        }
    }
}
