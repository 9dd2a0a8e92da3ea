use std::fmt;

use crate::{
    cache_line::CacheSet,
    cache_memory::CacheMemory,
    common::{
        CacheId, ComponentId, InclusivenessPolicy, LockType, MemoryOperation, PackageState,
        ProtocolStatus, NUM_MEMORY_OPERATIONS,
    },
    config::DirectoryConfig,
    directory_line::DirectoryLine,
    error::ProtocolError,
    package::MemoryPackage,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryStat {
    pub hit: [u64; NUM_MEMORY_OPERATIONS],
    pub miss: [u64; NUM_MEMORY_OPERATIONS],
    pub sub_block_miss: u64,
    pub parallel_request: u64,
    pub lock_conflict: u64,
    pub early_writeback: u64,
    pub final_writeback: u64,
    pub final_eviction: u64,
}

/// resumable position of [`DirectoryController::coherence_evict_all`].
#[derive(Debug, Clone, Default)]
pub struct EvictAllCursor {
    level: u32,
    next_set: Vec<usize>,
}

impl EvictAllCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// hierarchy level being drained.
    pub fn level(&self) -> u32 {
        self.level
    }

    fn reset(&mut self, caches: &[CacheMemory]) {
        self.level = caches.iter().map(|c| c.hierarchy_level).min().unwrap_or(0);
        self.next_set = vec![0; caches.len()];
    }
}

/// the single coherence authority of the hierarchy.
///
/// every entry point takes the whole cache arena, the id of the cache asking,
/// and the package being treated. the returned state tells the cache whether
/// to retire (`Ready`), forward (`Transmit`), sleep (`Wait`) or retry
/// (`Untreated`) the package. the package itself is updated to match.
pub struct DirectoryController {
    pub inclusiveness: InclusivenessPolicy,
    pub generate_llc_writeback: bool,
    pub generate_non_llc_writeback: bool,
    line_size: u32,
    not_offset_mask: u64,
    total_caches: usize,
    llc_caches: Vec<CacheId>,
    memory_controllers: Vec<ComponentId>,
    directory_lines: Vec<DirectoryLine>,
    pub stat: DirectoryStat,
}

impl DirectoryController {
    pub fn new(
        config: &DirectoryConfig,
        line_size: u32,
        caches: &[CacheMemory],
        memory_controllers: Vec<ComponentId>,
    ) -> Self {
        Self {
            inclusiveness: config.inclusiveness,
            generate_llc_writeback: config.generate_llc_writeback,
            generate_non_llc_writeback: config.generate_non_llc_writeback,
            line_size,
            not_offset_mask: !(line_size as u64 - 1),
            total_caches: caches.len(),
            llc_caches: caches
                .iter()
                .filter(|c| c.is_last_level())
                .map(|c| c.id)
                .collect(),
            memory_controllers,
            directory_lines: Vec::new(),
            stat: Default::default(),
        }
    }

    pub fn directory_lines(&self) -> &[DirectoryLine] {
        &self.directory_lines
    }

    pub fn llc_caches(&self) -> &[CacheId] {
        &self.llc_caches
    }

    #[inline]
    fn same_line(&self, a: u64, b: u64) -> bool {
        a & self.not_offset_mask == b & self.not_offset_mask
    }

    /// `true` if some in-flight transaction holds the line of `addr`.
    pub fn is_locked(&self, addr: u64) -> bool {
        self.directory_lines
            .iter()
            .any(|d| self.same_line(d.initial_memory_address, addr))
    }

    fn find_directory_line(&self, package: &MemoryPackage) -> Option<usize> {
        self.directory_lines.iter().position(|d| {
            d.is_same_transaction(package)
                && self.same_line(d.initial_memory_address, package.memory_address)
        })
    }

    fn new_directory_line(&mut self, package: &MemoryPackage, now: u64) -> usize {
        let lock = if Self::coherence_is_read(package.memory_operation) {
            LockType::Read
        } else {
            LockType::Write
        };
        self.directory_lines
            .push(DirectoryLine::new(package, lock, self.total_caches, now));
        self.directory_lines.len() - 1
    }

    // ---- predicates ----

    pub fn coherence_is_read(op: MemoryOperation) -> bool {
        match op {
            MemoryOperation::Read | MemoryOperation::Inst | MemoryOperation::Prefetch => true,
            MemoryOperation::Write | MemoryOperation::Writeback => false,
        }
    }

    pub fn coherence_is_dirty(status: ProtocolStatus) -> bool {
        status.is_dirty()
    }

    pub fn coherence_is_hit(status: Option<ProtocolStatus>, op: MemoryOperation) -> bool {
        match (status, op) {
            (None, _) => false,
            (Some(_), MemoryOperation::Writeback) => true,
            (Some(status), _) => status != ProtocolStatus::I,
        }
    }

    pub fn coherence_need_writeback(&self, cache: &CacheMemory, status: ProtocolStatus) -> bool {
        let enabled = if cache.is_last_level() {
            self.generate_llc_writeback
        } else {
            self.generate_non_llc_writeback
        };
        Self::coherence_is_dirty(status) && enabled
    }

    fn is_inclusive_at(&self, cache: &CacheMemory) -> bool {
        match self.inclusiveness {
            InclusivenessPolicy::NonInclusive => false,
            InclusivenessPolicy::InclusiveLlc => cache.is_last_level(),
            InclusivenessPolicy::InclusiveAll => true,
        }
    }

    /// the next component towards main memory for `addr`.
    fn find_next_obj_id(
        &self,
        caches: &[CacheMemory],
        cache_id: CacheId,
        addr: u64,
    ) -> Result<ComponentId, ProtocolError> {
        let cache = &caches[cache_id];
        if cache.is_last_level() {
            if self.memory_controllers.is_empty() {
                return Err(ProtocolError::NoRoute {
                    cache_id,
                    address: addr,
                });
            }
            let line = addr / self.line_size as u64;
            return Ok(self.memory_controllers[(line % self.memory_controllers.len() as u64) as usize]);
        }
        cache
            .lower_level
            .iter()
            .copied()
            .find(|l| {
                let lower = &caches[*l];
                lower.total_banks <= 1 || lower.get_bank(addr) == lower.bank_number
            })
            .ok_or(ProtocolError::NoRoute {
                cache_id,
                address: addr,
            })
    }

    // ---- entry points ----

    pub fn treat_cache_request(
        &mut self,
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        package: &mut MemoryPackage,
        now: u64,
    ) -> Result<PackageState, ProtocolError> {
        let op = package.memory_operation;
        let is_read = Self::coherence_is_read(op);
        let addr = package.memory_address;
        let is_origin = caches[cache_id].hierarchy_level == 1 || package.id_owner == cache_id;

        let mut dir_index = if is_origin {
            for d in &self.directory_lines {
                if !self.same_line(d.initial_memory_address, addr) {
                    continue;
                }
                if is_read && d.lock_type == LockType::Read {
                    continue;
                }
                log::debug!("cache {cache_id}: {addr:#x} locked by [{d}]");
                self.stat.lock_conflict += 1;
                package.package_untreated(now, 1);
                return Ok(PackageState::Untreated);
            }
            if self.find_directory_line(package).is_some() {
                return Err(ProtocolError::UnexpectedDirectoryLine {
                    cache_id,
                    package: package.to_string(),
                });
            }
            caches[cache_id].predictor.fill_package_sub_blocks(package);
            None
        } else {
            match self.find_directory_line(package) {
                Some(index) => Some(index),
                None => {
                    return Err(ProtocolError::MissingDirectoryLine {
                        cache_id,
                        package: package.to_string(),
                    })
                }
            }
        };

        if op == MemoryOperation::Writeback {
            return self.treat_writeback(caches, cache_id, package, dir_index, now);
        }

        let found = caches[cache_id].find_line(addr);
        let status = found.map(|(i, w)| caches[cache_id].line(i, w).status);
        let is_hit = Self::coherence_is_hit(status, op);
        let is_sub_block_hit = found.is_some_and(|(i, w)| {
            caches[cache_id]
                .predictor
                .check_sub_block_is_hit(package, i, w)
        });

        let parallel = self.directory_lines.iter().any(|d| {
            d.cache_request_order[cache_id] != 0 && self.same_line(d.initial_memory_address, addr)
        });
        if parallel {
            if let (true, true, Some((i, w))) = (is_hit, is_sub_block_hit, found) {
                caches[cache_id].predictor.line_hit(package, i, w);
                let dir_index = match dir_index {
                    Some(index) => index,
                    None => self.new_directory_line(package, now),
                };
                self.directory_lines[dir_index].stamp(cache_id);
                self.stat.parallel_request += 1;
                log::debug!("cache {cache_id}: joined a parallel request on {addr:#x}");
                package.package_wait(now, 0);
                return Ok(PackageState::Wait);
            }
            package.package_untreated(now, 1);
            return Ok(PackageState::Untreated);
        }

        let (index, way) = match (is_hit, found) {
            (true, Some((i, w))) if is_sub_block_hit => {
                caches[cache_id].stat.add_hit(op);
                self.stat.hit[op.index()] += 1;
                caches[cache_id].predictor.line_hit(package, i, w);
                self.coherence_new_operation(caches, cache_id, i, w, package, true, now)?;
                self.early_writeback(caches, cache_id, i, w, now)?;

                let cache = &caches[cache_id];
                return Ok(if package.id_owner == cache_id {
                    package.package_ready(now, cache.penalty_read);
                    PackageState::Ready
                } else if op == MemoryOperation::Write {
                    package.package_ready(now, cache.penalty_write);
                    PackageState::Ready
                } else {
                    package.is_answer = true;
                    package.package_set_src_dst(cache_id, package.id_src);
                    package.package_transmit(now, cache.penalty_read);
                    PackageState::Transmit
                });
            }
            (true, Some((i, w))) => {
                caches[cache_id].stat.add_miss(op);
                caches[cache_id].stat.sub_block_miss += 1;
                self.stat.miss[op.index()] += 1;
                self.stat.sub_block_miss += 1;
                let cache = &mut caches[cache_id];
                cache.predictor.sub_block_miss(package, i, w);
                cache.predictor.line_hit(package, i, w);
                let dir_index = match dir_index.take() {
                    Some(index) => index,
                    None => self.new_directory_line(package, now),
                };
                self.directory_lines[dir_index].stamp(cache_id);
                cache.change_status(i, w, ProtocolStatus::I);
                let status = self.find_cache_line_higher_levels(caches, cache_id, package, true)?;
                caches[cache_id].change_status(i, w, status);
                (i, w)
            }
            _ => {
                caches[cache_id].stat.add_miss(op);
                self.stat.miss[op.index()] += 1;
                let (i, w) = match found {
                    Some((i, w)) => {
                        caches[cache_id].predictor.line_eviction(i, w);
                        (i, w)
                    }
                    None => match self.evict_for(caches, cache_id, addr, now)? {
                        Some(victim) => victim,
                        None => {
                            package.package_untreated(now, 1);
                            return Ok(PackageState::Untreated);
                        }
                    },
                };
                let cache = &mut caches[cache_id];
                cache.change_address(i, w, addr);
                cache.change_status(i, w, ProtocolStatus::I);
                let dir_index = match dir_index.take() {
                    Some(index) => index,
                    None => self.new_directory_line(package, now),
                };
                self.directory_lines[dir_index].stamp(cache_id);
                let status = self.find_cache_line_higher_levels(caches, cache_id, package, true)?;
                let cache = &mut caches[cache_id];
                cache.change_status(i, w, status);
                if status != ProtocolStatus::I {
                    cache.predictor.line_recv_writeback(package, i, w);
                } else {
                    cache.predictor.line_miss(package, i, w);
                }
                cache.predictor.line_hit(package, i, w);
                (i, w)
            }
        };
        log::debug!(
            "cache {cache_id}: miss on {addr:#x} installed at [{index}][{way}] as {}",
            caches[cache_id].line(index, way).status
        );

        if package.memory_operation == MemoryOperation::Write {
            package.memory_operation = MemoryOperation::Read;
        }
        let cache = &caches[cache_id];
        if cache.line(index, way).status != ProtocolStatus::I {
            package.is_answer = true;
            package.package_untreated(now, cache.penalty_read + cache.penalty_write);
            Ok(PackageState::Untreated)
        } else {
            let dst = self.find_next_obj_id(caches, cache_id, addr)?;
            package.package_set_src_dst(cache_id, dst);
            package.package_transmit(now, caches[cache_id].penalty_read);
            Ok(PackageState::Transmit)
        }
    }

    fn treat_writeback(
        &mut self,
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        package: &mut MemoryPackage,
        dir_index: Option<usize>,
        now: u64,
    ) -> Result<PackageState, ProtocolError> {
        if package.id_owner == cache_id {
            return Err(ProtocolError::WritebackLoop { cache_id });
        }
        let addr = package.memory_address;
        let found = caches[cache_id].find_line(addr);
        let (index, way) = match found {
            Some(found) => found,
            None => match self.evict_for(caches, cache_id, addr, now)? {
                Some(victim) => victim,
                None => {
                    package.package_untreated(now, 1);
                    return Ok(PackageState::Untreated);
                }
            },
        };
        let op = MemoryOperation::Writeback;
        if found.is_some() {
            caches[cache_id].stat.add_hit(op);
            self.stat.hit[op.index()] += 1;
        } else {
            caches[cache_id].stat.add_miss(op);
            self.stat.miss[op.index()] += 1;
        }

        // the victim is already copied back or dropped
        let cache = &mut caches[cache_id];
        cache.predictor.line_recv_writeback(package, index, way);
        cache.change_address(index, way, addr);
        cache.change_status(index, way, ProtocolStatus::I);
        self.coherence_new_operation(caches, cache_id, index, way, package, true, now)?;
        package.package_ready(now, caches[cache_id].penalty_write);
        if let Some(dir_index) = dir_index {
            self.directory_lines.remove(dir_index);
        }
        self.early_writeback(caches, cache_id, index, way, now)?;
        Ok(PackageState::Ready)
    }

    /// a dirty line the predictor flags as written for the last time is
    /// copied back right away and kept as a clean copy.
    fn early_writeback(
        &mut self,
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        index: usize,
        way: usize,
        now: u64,
    ) -> Result<(), ProtocolError> {
        let cache = &caches[cache_id];
        let line = cache.line(index, way);
        if !self.coherence_need_writeback(cache, line.status)
            || !cache.predictor.check_line_is_last_write(index, way)
        {
            return Ok(());
        }
        if self.create_cache_writeback(caches, cache_id, index, way, now)? {
            self.stat.early_writeback += 1;
            caches[cache_id].stat.eviction += 1;
            let mut writeback = MemoryPackage {
                memory_operation: MemoryOperation::Writeback,
                ..Default::default()
            };
            writeback.memory_address = caches[cache_id].line(index, way).tag;
            self.coherence_new_operation(caches, cache_id, index, way, &writeback, false, now)?;
        }
        Ok(())
    }

    /// frees a way for `addr`, copying back or invalidating whatever the
    /// inclusiveness policy demands. `None` if nothing could be evicted now.
    fn evict_for(
        &mut self,
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        addr: u64,
        now: u64,
    ) -> Result<Option<(usize, usize)>, ProtocolError> {
        let victim = caches[cache_id].evict_address(addr, |a| self.is_locked(a))?;
        let Some((index, way)) = victim else {
            return Ok(None);
        };
        let line = *caches[cache_id].line(index, way);
        let inclusive = self.is_inclusive_at(&caches[cache_id]);

        if self.coherence_need_writeback(&caches[cache_id], line.status) {
            if !self.create_cache_writeback(caches, cache_id, index, way, now)? {
                return Ok(None);
            }
            caches[cache_id].stat.eviction += 1;
        } else if inclusive {
            // the victim takes over a dirty copy from above, so a retry still copies it back
            let status = self.find_writeback_higher_levels(caches, cache_id, line.tag);
            caches[cache_id].change_status(index, way, status);
            if self.coherence_need_writeback(&caches[cache_id], status) {
                let pseudo = MemoryPackage {
                    memory_address: line.tag,
                    memory_operation: MemoryOperation::Writeback,
                    ..Default::default()
                };
                caches[cache_id]
                    .predictor
                    .line_recv_writeback(&pseudo, index, way);
                if !self.create_cache_writeback(caches, cache_id, index, way, now)? {
                    return Ok(None);
                }
            }
            if line.status != ProtocolStatus::I {
                caches[cache_id].stat.eviction += 1;
            }
        } else if line.status != ProtocolStatus::I {
            caches[cache_id].stat.eviction += 1;
        }

        if inclusive {
            self.coherence_evict_higher_levels(caches, cache_id, line.tag);
        }
        caches[cache_id].predictor.line_eviction(index, way);
        Ok(Some((index, way)))
    }

    /// queues a copyback of the line at `index`/`way` in the writeback range of
    /// the MSHR and locks its address until it lands. `false` if the range is full.
    fn create_cache_writeback(
        &mut self,
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        index: usize,
        way: usize,
        now: u64,
    ) -> Result<bool, ProtocolError> {
        let tag = caches[cache_id].line(index, way).tag;
        let dst = self.find_next_obj_id(caches, cache_id, tag)?;
        let mut package =
            MemoryPackage::request(cache_id, 0, 0, 0, tag, self.line_size, MemoryOperation::Writeback, now);
        package.package_set_src_dst(cache_id, dst);
        package.package_transmit(now, 0);
        let cache = &mut caches[cache_id];
        cache.predictor.line_sub_blocks_to_package(&mut package, index, way);
        if cache.allocate_writeback(package.clone()).is_none() {
            return Ok(false);
        }
        let dir_index = self.new_directory_line(&package, now);
        self.directory_lines[dir_index].stamp(cache_id);
        cache.predictor.line_send_writeback(&package, index, way);
        cache.stat.writeback += 1;
        log::debug!("cache {cache_id}: writeback of {tag:#x} towards {dst}");
        Ok(true)
    }

    pub fn treat_cache_answer(
        &mut self,
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        package: &mut MemoryPackage,
        now: u64,
    ) -> Result<PackageState, ProtocolError> {
        let Some(dir_index) = self.find_directory_line(package) else {
            return Err(ProtocolError::MissingDirectoryLine {
                cache_id,
                package: package.to_string(),
            });
        };

        for waiting in caches[cache_id].waiting_on_line(package.memory_address) {
            waiting.is_answer = package.is_answer;
            waiting.memory_size = package.memory_size;
            waiting.package_set_src_dst(package.id_src, package.id_dst);
            waiting.package_untreated(now, 0);
        }

        let penalty = caches[cache_id].penalty_write;
        let line = &mut self.directory_lines[dir_index];
        if line.id_owner == cache_id {
            self.directory_lines.remove(dir_index);
            self.answer_new_operation(caches, cache_id, package, now)?;
            package.package_ready(now, penalty);
            return Ok(PackageState::Ready);
        }

        let order = line.cache_request_order[cache_id];
        if order != line.cache_requested {
            return Err(ProtocolError::WrongRequestOrder {
                cache_id,
                found: order,
                expected: line.cache_requested,
            });
        }
        line.cache_requested -= 1;
        line.cache_request_order[cache_id] = 0;

        if line.cache_requested == 0 {
            let line = self.directory_lines.remove(dir_index);
            package.package_set_src_dst(cache_id, line.id_owner);
            package.memory_operation = line.initial_memory_operation;
            package.memory_address = line.initial_memory_address;
            package.memory_size = line.initial_memory_size;
            self.answer_new_operation(caches, cache_id, package, now)?;
            if line.initial_memory_operation == MemoryOperation::Write {
                package.package_ready(now, penalty);
                Ok(PackageState::Ready)
            } else {
                package.package_transmit(now, penalty);
                Ok(PackageState::Transmit)
            }
        } else {
            let Some(next) = line.requester_at(line.cache_requested) else {
                return Err(ProtocolError::LostRequester {
                    cache_id,
                    order: line.cache_requested,
                });
            };
            package.package_set_src_dst(cache_id, next);
            self.answer_new_operation(caches, cache_id, package, now)?;
            package.package_transmit(now, penalty);
            Ok(PackageState::Transmit)
        }
    }

    fn answer_new_operation(
        &mut self,
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        package: &MemoryPackage,
        now: u64,
    ) -> Result<(), ProtocolError> {
        let Some((index, way)) = caches[cache_id].find_line(package.memory_address) else {
            return Err(ProtocolError::LineVanished {
                cache_id,
                address: package.memory_address,
            });
        };
        self.coherence_new_operation(caches, cache_id, index, way, package, false, now)
    }

    pub fn treat_cache_request_sent(
        &mut self,
        caches: &[CacheMemory],
        cache_id: CacheId,
        package: &MemoryPackage,
    ) -> Result<PackageState, ProtocolError> {
        if package.memory_operation != MemoryOperation::Writeback {
            return Ok(PackageState::Wait);
        }
        if caches[cache_id].is_last_level() {
            let Some(dir_index) = self.find_directory_line(package) else {
                return Err(ProtocolError::MissingDirectoryLine {
                    cache_id,
                    package: package.to_string(),
                });
            };
            self.directory_lines.remove(dir_index);
        }
        Ok(PackageState::Ready)
    }

    // ---- coherence ----

    #[allow(clippy::too_many_arguments)]
    fn coherence_new_operation(
        &mut self,
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        index: usize,
        way: usize,
        package: &MemoryPackage,
        is_hit: bool,
        now: u64,
    ) -> Result<(), ProtocolError> {
        let status = caches[cache_id].line(index, way).status;
        match package.memory_operation {
            MemoryOperation::Read | MemoryOperation::Inst | MemoryOperation::Prefetch => {
                let cache = &mut caches[cache_id];
                cache.update_last_access(index, way, now);
                if status == ProtocolStatus::I {
                    cache.change_status(index, way, ProtocolStatus::S);
                }
            }
            MemoryOperation::Write => {
                self.coherence_invalidate_all(caches, cache_id, package.memory_address);
                let cache = &mut caches[cache_id];
                cache.update_last_access(index, way, now);
                cache.change_status(index, way, ProtocolStatus::M);
            }
            MemoryOperation::Writeback => {
                // receiving side (`is_hit`) always gets an invalid line
                if !is_hit && status == ProtocolStatus::I {
                    return Err(ProtocolError::WritebackFromInvalidLine {
                        cache_id,
                        package: package.to_string(),
                    });
                }
                let next = if is_hit {
                    ProtocolStatus::O
                } else {
                    ProtocolStatus::S
                };
                let cache = &mut caches[cache_id];
                cache.update_last_access(index, way, now);
                cache.change_status(index, way, next);
            }
        }
        Ok(())
    }

    /// every other copy of the line is dropped.
    pub fn coherence_invalidate_all(&mut self, caches: &mut [CacheMemory], cache_id: CacheId, addr: u64) {
        for cache in caches.iter_mut().filter(|c| c.id != cache_id) {
            let Some((index, way)) = cache.find_line(addr) else {
                continue;
            };
            let status = cache.line(index, way).status;
            if Self::coherence_is_hit(Some(status), MemoryOperation::Read) {
                cache.predictor.line_invalidation(index, way);
                cache.change_status(index, way, ProtocolStatus::I);
                cache.stat.invalidation += 1;
            }
        }
    }

    /// MOESI hand-off of the line `package` asks for. an owner found above
    /// becomes a sharer and ownership moves to the asking level.
    pub fn find_cache_line_higher_levels(
        &self,
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        package: &MemoryPackage,
        check_llc: bool,
    ) -> Result<ProtocolStatus, ProtocolError> {
        let addr = package.memory_address;
        if check_llc && caches[cache_id].is_last_level() {
            for llc in self.llc_caches.iter().copied() {
                let cache = &caches[llc];
                if cache.total_banks > 1 && cache.get_bank(addr) != cache.bank_number {
                    continue;
                }
                match self.find_cache_line_higher_levels(caches, llc, package, false)? {
                    ProtocolStatus::M | ProtocolStatus::O => return Ok(ProtocolStatus::O),
                    ProtocolStatus::E | ProtocolStatus::S => return Ok(ProtocolStatus::S),
                    ProtocolStatus::I => {}
                }
            }
            return Ok(ProtocolStatus::I);
        }

        let cache = &mut caches[cache_id];
        if let Some((index, way)) = cache.find_line(addr) {
            let status = cache.line(index, way).status;
            let sub_block_hit = cache.predictor.check_sub_block_is_hit(package, index, way);
            match status {
                ProtocolStatus::M | ProtocolStatus::O if sub_block_hit => {
                    cache.change_status(index, way, ProtocolStatus::S);
                    return Ok(ProtocolStatus::O);
                }
                ProtocolStatus::E | ProtocolStatus::S if sub_block_hit => {
                    return Ok(ProtocolStatus::S);
                }
                _ => {}
            }
        }

        for higher in caches[cache_id].higher_level.clone() {
            match self.find_cache_line_higher_levels(caches, higher, package, false)? {
                ProtocolStatus::M | ProtocolStatus::O => {
                    let cache = &mut caches[cache_id];
                    if let Some((index, way)) = cache.find_line(addr) {
                        cache.change_status(index, way, ProtocolStatus::S);
                    }
                    return Ok(ProtocolStatus::O);
                }
                ProtocolStatus::E | ProtocolStatus::S => return Ok(ProtocolStatus::S),
                ProtocolStatus::I => {}
            }
        }
        Ok(ProtocolStatus::I)
    }

    /// freshest status of `addr` above `cache_id`, downgrading a dirty owner.
    /// `cache_id`'s own line is skipped, the caller already ran its writeback check.
    fn find_writeback_higher_levels(&self, caches: &mut [CacheMemory], cache_id: CacheId, addr: u64) -> ProtocolStatus {
        for higher in caches[cache_id].higher_level.clone() {
            let cache = &mut caches[higher];
            if let Some((index, way)) = cache.find_line(addr) {
                match cache.line(index, way).status {
                    ProtocolStatus::M | ProtocolStatus::O => {
                        cache.change_status(index, way, ProtocolStatus::S);
                        return ProtocolStatus::O;
                    }
                    ProtocolStatus::E | ProtocolStatus::S => return ProtocolStatus::S,
                    ProtocolStatus::I => {}
                }
            }
            match self.find_writeback_higher_levels(caches, higher, addr) {
                ProtocolStatus::M | ProtocolStatus::O => return ProtocolStatus::O,
                ProtocolStatus::E | ProtocolStatus::S => return ProtocolStatus::S,
                ProtocolStatus::I => {}
            }
        }
        ProtocolStatus::I
    }

    fn coherence_evict_higher_levels(&self, caches: &mut [CacheMemory], cache_id: CacheId, addr: u64) {
        for higher in caches[cache_id].higher_level.clone() {
            self.coherence_evict_higher_levels(caches, higher, addr);
            let cache = &mut caches[higher];
            if let Some((index, way)) = cache.find_line(addr) {
                if cache.line(index, way).status != ProtocolStatus::I {
                    cache.predictor.line_eviction(index, way);
                    cache.change_status(index, way, ProtocolStatus::I);
                    cache.stat.invalidation += 1;
                }
            }
        }
    }

    /// end of run drain, one hierarchy level at a time from the first level
    /// down. dirty lines are copied back, clean ones dropped.
    ///
    /// must be called once per cycle until it returns `true`; `cursor` keeps
    /// the sets already flushed.
    pub fn coherence_evict_all(
        &mut self,
        caches: &mut [CacheMemory],
        cursor: &mut EvictAllCursor,
        now: u64,
    ) -> Result<bool, ProtocolError> {
        if cursor.next_set.len() != caches.len() {
            cursor.reset(caches);
        }
        let max_level = caches.iter().map(|c| c.hierarchy_level).max().unwrap_or(0);
        while cursor.level <= max_level {
            let mut level_clean = true;
            for cache_id in 0..caches.len() {
                if caches[cache_id].hierarchy_level != cursor.level {
                    continue;
                }
                if !self.evict_cache_sets(caches, cache_id, cursor, now)? {
                    level_clean = false;
                }
            }
            if !level_clean {
                return Ok(false);
            }
            log::info!("hierarchy level {} drained at cycle {now}", cursor.level);
            cursor.level += 1;
        }

        let clean = self.directory_lines.is_empty()
            && caches
                .iter()
                .all(|c| c.mshr_len() == 0 && c.sets().iter().all(CacheSet::is_clean));
        if !clean {
            cursor.reset(caches);
        }
        Ok(clean)
    }

    /// `true` once every set of the cache is invalid and its MSHR empty.
    fn evict_cache_sets(
        &mut self,
        caches: &mut [CacheMemory],
        cache_id: CacheId,
        cursor: &mut EvictAllCursor,
        now: u64,
    ) -> Result<bool, ProtocolError> {
        let total_sets = caches[cache_id].total_sets as usize;
        while cursor.next_set[cache_id] < total_sets {
            let index = cursor.next_set[cache_id];
            let mut set_clean = true;
            for way in 0..caches[cache_id].associativity as usize {
                let line = *caches[cache_id].line(index, way);
                if line.status == ProtocolStatus::I {
                    continue;
                }
                if self.is_locked(line.tag) {
                    set_clean = false;
                    continue;
                }
                if self.coherence_need_writeback(&caches[cache_id], line.status) {
                    if !self.create_cache_writeback(caches, cache_id, index, way, now)? {
                        set_clean = false;
                        break;
                    }
                    caches[cache_id].stat.final_writeback += 1;
                    self.stat.final_writeback += 1;
                } else {
                    caches[cache_id].stat.final_eviction += 1;
                    self.stat.final_eviction += 1;
                }
                let cache = &mut caches[cache_id];
                cache.predictor.line_eviction(index, way);
                cache.change_status(index, way, ProtocolStatus::I);
            }
            if !set_clean {
                return Ok(false);
            }
            cursor.next_set[cache_id] += 1;
        }
        Ok(caches[cache_id].mshr_len() == 0)
    }

    /// warns about transactions alive for longer than `max_alive_time`.
    pub fn check_age(&self, now: u64, max_alive_time: u64) {
        for line in &self.directory_lines {
            if !line.check_age(now, max_alive_time) {
                log::warn!("directory line older than {max_alive_time} cycles: [{line}]");
            }
        }
    }

    pub fn lines_view(&self) -> DirectoryView<'_> {
        DirectoryView(self)
    }
}

pub struct DirectoryView<'a>(&'a DirectoryController);

impl fmt::Display for DirectoryView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} directory lines", self.0.directory_lines.len())?;
        for line in &self.0.directory_lines {
            writeln!(f, "  {line}")?;
        }
        Ok(())
    }
}

#[cfg(feature = "stat")]
pub mod stat {
    use std::fmt;

    use super::{DirectoryController, DirectoryStat};
    use crate::{
        common::MemoryOperation,
        stat::{AddStats, Stat, StatView, Stats},
    };

    pub struct DirectoryStatView<'a>(&'a DirectoryStat);

    impl Stat for DirectoryStat {
        fn view(&self) -> Box<dyn StatView + '_> {
            Box::new(DirectoryStatView(self))
        }
    }

    impl StatView for DirectoryStatView<'_> {
        fn header(&self) -> String {
            "directory".to_string()
        }
        fn width(&self) -> usize {
            40
        }
    }

    impl fmt::Display for DirectoryStatView<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = self.0;
            for op in MemoryOperation::ALL {
                writeln!(
                    f,
                    "  {:<10} hit {:>10} miss {:>10}",
                    op.to_string(),
                    s.hit[op.index()],
                    s.miss[op.index()]
                )?;
            }
            writeln!(f, "  sub-block miss:   {:>10}", s.sub_block_miss)?;
            writeln!(f, "  parallel request: {:>10}", s.parallel_request)?;
            writeln!(f, "  lock conflict:    {:>10}", s.lock_conflict)?;
            writeln!(f, "  early writeback:  {:>10}", s.early_writeback)?;
            writeln!(f, "  final writeback:  {:>10}", s.final_writeback)?;
            write!(f, "  final eviction:   {:>10}", s.final_eviction)
        }
    }

    impl AddStats for DirectoryController {
        fn add_stats(&self, buf: &mut Stats) {
            buf.push(Box::new(self.stat.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::ReplacementPolicy, config::CacheConfig, line_usage_predictor::testing::DeadWay};

    const LINE: u32 = 64;

    fn cache_config(label: &str, level: u32, line_number: u32, associativity: u32) -> CacheConfig {
        CacheConfig {
            label: label.to_string(),
            hierarchy_level: level,
            line_number,
            associativity,
            penalty_read: 1,
            penalty_write: 1,
            mshr_request_size: 4,
            mshr_writeback_size: 2,
            mshr_prefetch_size: 1,
            ..Default::default()
        }
    }

    /// `n_l1` first level caches sharing one llc, then the memory controller.
    fn two_levels(n_l1: usize) -> (Vec<CacheMemory>, DirectoryController) {
        let llc = n_l1;
        let mut caches: Vec<CacheMemory> = (0..n_l1)
            .map(|i| CacheMemory::new(i, &cache_config(&format!("L1_{i}"), 1, 8, 2), LINE).unwrap())
            .collect();
        caches.push(CacheMemory::new(llc, &cache_config("LLC", 2, 64, 4), LINE).unwrap());
        for i in 0..n_l1 {
            caches[i].lower_level.push(llc);
            caches[llc].higher_level.push(i);
        }
        let dir = DirectoryController::new(&DirectoryConfig::default(), LINE, &caches, vec![llc + 1]);
        (caches, dir)
    }

    fn core_request(core: ComponentId, opcode: u64, addr: u64, op: MemoryOperation) -> MemoryPackage {
        MemoryPackage::request(core, opcode, 0x400, 0, addr, 8, op, 0)
    }

    fn status_of(caches: &[CacheMemory], id: CacheId, addr: u64) -> ProtocolStatus {
        caches[id].line_status(addr)
    }

    fn assert_requesters_conserved(dir: &DirectoryController) {
        for d in dir.directory_lines() {
            assert_eq!(d.cache_requested, d.count_requesters(), "{d}");
        }
    }

    fn assert_locks_exclusive(dir: &DirectoryController) {
        let lines = dir.directory_lines();
        for a in lines {
            for b in lines {
                if std::ptr::eq(a, b) || !dir.same_line(a.initial_memory_address, b.initial_memory_address) {
                    continue;
                }
                assert!(a.lock_type == LockType::Read && b.lock_type == LockType::Read);
            }
        }
    }

    fn assert_moesi_sound(caches: &[CacheMemory], addr: u64) {
        let owners = caches
            .iter()
            .filter(|c| c.line_status(addr).is_exclusive_owner())
            .count();
        assert!(owners <= 1, "more than one M/O/E copy of {addr:#x}");
    }

    #[test]
    fn test_predicates() {
        use MemoryOperation::*;
        assert!(DirectoryController::coherence_is_read(Read));
        assert!(DirectoryController::coherence_is_read(Inst));
        assert!(DirectoryController::coherence_is_read(Prefetch));
        assert!(!DirectoryController::coherence_is_read(Write));
        assert!(!DirectoryController::coherence_is_read(Writeback));

        assert!(!DirectoryController::coherence_is_hit(None, Writeback));
        assert!(DirectoryController::coherence_is_hit(Some(ProtocolStatus::I), Writeback));
        assert!(!DirectoryController::coherence_is_hit(Some(ProtocolStatus::I), Read));
        for s in [ProtocolStatus::M, ProtocolStatus::O, ProtocolStatus::E, ProtocolStatus::S] {
            assert!(DirectoryController::coherence_is_hit(Some(s), Write));
        }
    }

    #[test]
    fn test_need_writeback() {
        let (caches, mut dir) = two_levels(1);
        let (l1, llc) = (&caches[0], &caches[1]);
        for s in [ProtocolStatus::M, ProtocolStatus::O] {
            assert!(dir.coherence_need_writeback(l1, s));
            assert!(dir.coherence_need_writeback(llc, s));
        }
        for s in [ProtocolStatus::E, ProtocolStatus::S, ProtocolStatus::I] {
            assert!(!dir.coherence_need_writeback(l1, s));
            assert!(!dir.coherence_need_writeback(llc, s));
        }
        dir.generate_llc_writeback = false;
        assert!(!dir.coherence_need_writeback(llc, ProtocolStatus::M));
        assert!(dir.coherence_need_writeback(l1, ProtocolStatus::M));
        dir.generate_non_llc_writeback = false;
        assert!(!dir.coherence_need_writeback(l1, ProtocolStatus::O));
    }

    fn single_cache_pair() -> (Vec<CacheMemory>, DirectoryController) {
        let caches = vec![
            CacheMemory::new(0, &cache_config("A", 1, 1, 1), LINE).unwrap(),
            CacheMemory::new(1, &cache_config("B", 1, 1, 1), LINE).unwrap(),
        ];
        let dir = DirectoryController::new(&DirectoryConfig::default(), LINE, &caches, vec![2]);
        (caches, dir)
    }

    #[test]
    fn test_cold_miss_forwards_to_memory() {
        let (mut caches, mut dir) = single_cache_pair();
        let mut p = core_request(3, 1, 0x1000, MemoryOperation::Read);
        let state = dir.treat_cache_request(&mut caches, 0, &mut p, 10).unwrap();

        assert_eq!(state, PackageState::Transmit);
        assert_eq!(p.state, PackageState::Transmit);
        assert_eq!((p.id_src, p.id_dst), (0, 2));
        assert!(!p.is_answer);
        let line = caches[0].line(0, 0);
        assert_eq!(line.tag, 0x1000);
        assert_eq!(line.status, ProtocolStatus::I);
        assert_eq!(caches[0].stat.miss[MemoryOperation::Read.index()], 1);
        assert_eq!(caches[0].stat.accesses, 1);
        assert_eq!(dir.stat.miss[MemoryOperation::Read.index()], 1);
        assert_eq!(caches[0].stat.eviction, 0);
        assert_eq!(dir.directory_lines().len(), 1);
        assert_requesters_conserved(&dir);
    }

    #[test]
    fn test_write_after_read_invalidates_sharers() {
        let (mut caches, mut dir) = single_cache_pair();
        let mut p = core_request(3, 1, 0x1000, MemoryOperation::Read);
        dir.treat_cache_request(&mut caches, 0, &mut p, 10).unwrap();

        // memory answers
        p.is_answer = true;
        p.package_set_src_dst(2, 0);
        let state = dir.treat_cache_answer(&mut caches, 0, &mut p, 20).unwrap();
        assert_eq!(state, PackageState::Transmit);
        assert_eq!((p.id_src, p.id_dst), (0, 3));
        assert_eq!(status_of(&caches, 0, 0x1000), ProtocolStatus::S);
        assert!(dir.directory_lines().is_empty());

        // another cache shares the line
        caches[1].change_address(0, 0, 0x1000);
        caches[1].change_status(0, 0, ProtocolStatus::S);

        let mut w = core_request(3, 2, 0x1008, MemoryOperation::Write);
        let state = dir.treat_cache_request(&mut caches, 0, &mut w, 30).unwrap();
        assert_eq!(state, PackageState::Ready);
        assert_eq!(status_of(&caches, 0, 0x1000), ProtocolStatus::M);
        assert_eq!(status_of(&caches, 1, 0x1000), ProtocolStatus::I);
        assert_eq!(caches[1].stat.invalidation, 1);
        assert_eq!(caches[0].stat.hit[MemoryOperation::Write.index()], 1);
        assert_moesi_sound(&caches, 0x1000);
        assert!(dir.directory_lines().is_empty());
    }

    #[test]
    fn test_incompatible_lock_retries() {
        let (mut caches, mut dir) = two_levels(2);
        let mut w = core_request(4, 1, 0x2000, MemoryOperation::Write);
        assert_eq!(
            dir.treat_cache_request(&mut caches, 0, &mut w, 0).unwrap(),
            PackageState::Transmit
        );
        assert_eq!(w.memory_operation, MemoryOperation::Read);
        assert_eq!(dir.directory_lines()[0].lock_type, LockType::Write);

        let mut r = core_request(5, 1, 0x2010, MemoryOperation::Read);
        assert_eq!(
            dir.treat_cache_request(&mut caches, 1, &mut r, 1).unwrap(),
            PackageState::Untreated
        );
        assert_eq!(dir.stat.lock_conflict, 1);
        assert_eq!(dir.directory_lines().len(), 1);
        assert_locks_exclusive(&dir);
    }

    #[test]
    fn test_parallel_reads_join_outstanding_llc_request() {
        let (mut caches, mut dir) = two_levels(3);
        let llc = 3;
        let x = 0x4000;
        caches[0].change_address(0, 0, x);
        caches[0].change_status(0, 0, ProtocolStatus::M);

        // B misses and reaches the llc, which finds A's dirty copy
        let mut b = core_request(6, 1, x, MemoryOperation::Read);
        assert_eq!(dir.treat_cache_request(&mut caches, 1, &mut b, 0).unwrap(), PackageState::Transmit);
        assert_eq!(b.id_dst, llc);
        assert_eq!(dir.treat_cache_request(&mut caches, llc, &mut b, 1).unwrap(), PackageState::Untreated);
        assert!(b.is_answer);
        assert_eq!(status_of(&caches, 0, x), ProtocolStatus::S);
        assert_eq!(status_of(&caches, llc, x), ProtocolStatus::O);
        assert_eq!(dir.directory_lines()[0].cache_request_order[llc], 2);

        // C reads the same line while B is still resolving at the llc
        let mut c = core_request(7, 1, x, MemoryOperation::Read);
        assert_eq!(dir.treat_cache_request(&mut caches, 2, &mut c, 2).unwrap(), PackageState::Transmit);
        assert_eq!(dir.directory_lines().len(), 2);
        let state = dir.treat_cache_request(&mut caches, llc, &mut c, 3).unwrap();
        assert_eq!(state, PackageState::Wait);
        assert_eq!(dir.stat.parallel_request, 1);
        let c_line = &dir.directory_lines()[1];
        assert_eq!(c_line.cache_request_order[llc], 2);
        assert_eq!(c_line.cache_requested, 2);
        assert_eq!(dir.directory_lines().len(), 2);
        assert_eq!(caches[llc].mshr_len(), 0);
        assert_requesters_conserved(&dir);
        assert_locks_exclusive(&dir);

        // B's answer wakes C at the llc
        let slot = caches[llc].allocate_request(c.clone()).unwrap();
        let state = dir.treat_cache_answer(&mut caches, llc, &mut b, 4).unwrap();
        assert_eq!(state, PackageState::Transmit);
        assert_eq!((b.id_src, b.id_dst), (llc, 1));
        let mut woken = caches[llc].mshr_package(slot).unwrap().clone();
        assert_eq!(woken.state, PackageState::Untreated);
        assert!(woken.is_answer);
        let state = dir.treat_cache_answer(&mut caches, llc, &mut woken, 5).unwrap();
        assert_eq!(state, PackageState::Transmit);
        assert_eq!(woken.id_dst, 2);

        // both first levels hand the data to their core
        assert_eq!(dir.treat_cache_answer(&mut caches, 1, &mut b, 6).unwrap(), PackageState::Transmit);
        assert_eq!(b.id_dst, 6);
        assert_eq!(dir.treat_cache_answer(&mut caches, 2, &mut woken, 7).unwrap(), PackageState::Transmit);
        assert_eq!(woken.id_dst, 7);
        assert!(dir.directory_lines().is_empty());
        for id in 0..3 {
            assert_eq!(status_of(&caches, id, x), ProtocolStatus::S);
        }
        assert_eq!(status_of(&caches, llc, x), ProtocolStatus::O);
        assert_moesi_sound(&caches, x);
    }

    #[test]
    fn test_wrong_answer_order_is_fatal() {
        let (mut caches, mut dir) = two_levels(1);
        let mut p = core_request(3, 1, 0x80, MemoryOperation::Read);
        dir.treat_cache_request(&mut caches, 0, &mut p, 0).unwrap();
        dir.treat_cache_request(&mut caches, 1, &mut p, 1).unwrap();
        p.is_answer = true;
        // the first level answers before the llc did
        assert!(matches!(
            dir.treat_cache_answer(&mut caches, 0, &mut p, 2),
            Err(ProtocolError::WrongRequestOrder { found: 1, expected: 2, .. })
        ));
    }

    #[test]
    fn test_higher_level_request_needs_directory_line() {
        let (mut caches, mut dir) = two_levels(1);
        let mut p = core_request(3, 1, 0x80, MemoryOperation::Read);
        assert!(matches!(
            dir.treat_cache_request(&mut caches, 1, &mut p, 0),
            Err(ProtocolError::MissingDirectoryLine { cache_id: 1, .. })
        ));
    }

    #[test]
    fn test_dirty_eviction_creates_writeback() {
        let (mut caches, mut dir) = two_levels(1);
        // L1 has 4 sets of 2 ways: 0x0 and 0x100 and 0x200 share set 0
        for (way, addr) in [(0, 0x0), (1, 0x100)] {
            caches[0].change_address(0, way, addr);
            caches[0].change_status(0, way, ProtocolStatus::M);
            caches[0].update_last_access(0, way, 5 + way as u64);
        }
        let mut p = core_request(3, 1, 0x200, MemoryOperation::Read);
        assert_eq!(dir.treat_cache_request(&mut caches, 0, &mut p, 10).unwrap(), PackageState::Transmit);
        assert_eq!(caches[0].stat.writeback, 1);
        assert_eq!(caches[0].stat.eviction, 1);
        assert_eq!(status_of(&caches, 0, 0x200), ProtocolStatus::I);
        assert!(dir.is_locked(0x0));
        let (_, wb) = caches[0]
            .mshr_born_ordered()
            .find(|(_, p)| p.memory_operation == MemoryOperation::Writeback)
            .unwrap();
        let mut wb = wb.clone();
        assert_eq!((wb.memory_address, wb.id_dst, wb.state), (0x0, 1, PackageState::Transmit));

        assert_eq!(dir.treat_cache_request_sent(&caches, 0, &wb).unwrap(), PackageState::Ready);
        assert!(dir.is_locked(0x0));
        assert_eq!(dir.treat_cache_request(&mut caches, 1, &mut wb, 11).unwrap(), PackageState::Ready);
        assert_eq!(status_of(&caches, 1, 0x0), ProtocolStatus::O);
        assert!(!dir.is_locked(0x0));
        assert_moesi_sound(&caches, 0x0);
    }

    #[test]
    fn test_llc_writeback_released_when_sent() {
        let (mut caches, mut dir) = single_cache_pair();
        caches[0].change_address(0, 0, 0x40);
        caches[0].change_status(0, 0, ProtocolStatus::M);
        let mut p = core_request(3, 1, 0x1000, MemoryOperation::Read);
        assert_eq!(dir.treat_cache_request(&mut caches, 0, &mut p, 0).unwrap(), PackageState::Transmit);
        let (_, wb) = caches[0]
            .mshr_born_ordered()
            .find(|(_, p)| p.memory_operation == MemoryOperation::Writeback)
            .unwrap();
        let wb = wb.clone();
        assert_eq!(wb.id_dst, 2);
        assert!(dir.is_locked(0x40));
        assert_eq!(dir.treat_cache_request_sent(&caches, 0, &wb).unwrap(), PackageState::Ready);
        assert!(!dir.is_locked(0x40));
    }

    #[test]
    fn test_inclusive_llc_evicts_higher_copies() {
        let (mut caches, _) = two_levels(1);
        let config = DirectoryConfig {
            inclusiveness: InclusivenessPolicy::InclusiveLlc,
            ..Default::default()
        };
        let mut dir = DirectoryController::new(&config, LINE, &caches, vec![2]);
        // LLC has 16 sets of 4 ways. the oldest way of set 0 holds 0x0, which
        // only the first level has a dirty copy of.
        for way in 1..4u64 {
            let addr = way * 0x400;
            caches[1].change_address(0, way as usize, addr);
            caches[1].change_status(0, way as usize, ProtocolStatus::S);
            caches[1].update_last_access(0, way as usize, 10 + way);
        }
        caches[1].change_address(0, 0, 0x0);
        caches[1].update_last_access(0, 0, 1);
        caches[0].change_address(0, 0, 0x0);
        caches[0].change_status(0, 0, ProtocolStatus::M);

        let mut p = core_request(3, 9, 0x1000, MemoryOperation::Read);
        assert_eq!(dir.treat_cache_request(&mut caches, 0, &mut p, 20).unwrap(), PackageState::Transmit);
        assert_eq!(dir.treat_cache_request(&mut caches, 1, &mut p, 21).unwrap(), PackageState::Transmit);
        // the llc victim 0x0 was dirty above: copied back then dropped everywhere
        assert_eq!(status_of(&caches, 0, 0x0), ProtocolStatus::I);
        assert_eq!(caches[0].stat.invalidation, 1);
        assert_eq!(caches[1].stat.writeback, 1);
        assert!(dir.is_locked(0x0));
    }

    #[test]
    fn test_drain_clean_and_dirty() {
        let (mut caches, mut dir) = two_levels(1);
        caches[0].change_address(1, 0, 0x40);
        caches[0].change_status(1, 0, ProtocolStatus::S);
        caches[1].change_address(2, 1, 0x80);
        caches[1].change_status(2, 1, ProtocolStatus::M);
        dir.generate_llc_writeback = false;

        let mut cursor = EvictAllCursor::new();
        assert!(dir.coherence_evict_all(&mut caches, &mut cursor, 0).unwrap());
        for c in &caches {
            assert!(c.sets().iter().all(CacheSet::is_clean));
        }
        assert_eq!(caches[0].stat.final_eviction, 1);
        assert_eq!(caches[1].stat.final_eviction, 1);

        caches[0].change_address(3, 1, 0xc0);
        caches[0].change_status(3, 1, ProtocolStatus::M);
        let mut cursor = EvictAllCursor::new();
        assert!(!dir.coherence_evict_all(&mut caches, &mut cursor, 1).unwrap());
        assert_eq!(cursor.level(), 1);
        assert_eq!(caches[0].stat.final_writeback, 1);
        assert_eq!(status_of(&caches, 0, 0xc0), ProtocolStatus::I);
        assert!(dir.is_locked(0xc0));
        // the copyback is still in flight
        assert!(!dir.coherence_evict_all(&mut caches, &mut cursor, 2).unwrap());
    }

    #[test]
    fn test_writeback_into_full_clean_set() {
        let (mut caches, mut dir) = two_levels(1);
        let llc = 1;
        // every way of llc set 0 holds a clean line, way 0 is the oldest
        for way in 0..4u64 {
            caches[llc].change_address(0, way as usize, (way + 1) * 0x400);
            caches[llc].change_status(0, way as usize, ProtocolStatus::S);
            caches[llc].update_last_access(0, way as usize, 10 + way);
        }
        for (way, addr) in [(0, 0x0), (1, 0x100)] {
            caches[0].change_address(0, way, addr);
            caches[0].change_status(0, way, ProtocolStatus::M);
            caches[0].update_last_access(0, way, 5 + way as u64);
        }
        let mut p = core_request(3, 1, 0x200, MemoryOperation::Read);
        assert_eq!(dir.treat_cache_request(&mut caches, 0, &mut p, 20).unwrap(), PackageState::Transmit);
        let (_, wb) = caches[0]
            .mshr_born_ordered()
            .find(|(_, p)| p.memory_operation == MemoryOperation::Writeback)
            .unwrap();
        let mut wb = wb.clone();
        assert_eq!(wb.memory_address, 0x0);

        assert_eq!(dir.treat_cache_request(&mut caches, llc, &mut wb, 100).unwrap(), PackageState::Ready);
        assert_eq!(caches[llc].line(0, 0).tag, 0x0);
        assert_eq!(status_of(&caches, llc, 0x0), ProtocolStatus::O);
        assert_eq!(status_of(&caches, llc, 0x400), ProtocolStatus::I);
        assert_eq!(caches[llc].stat.eviction, 1);
        assert_eq!(caches[llc].stat.miss[MemoryOperation::Writeback.index()], 1);
        assert!(!dir.is_locked(0x0));
        assert_moesi_sound(&caches, 0x0);

        // the fresh owner is now the most recently used way
        assert_eq!(caches[llc].line(0, 0).last_access, 100);
        assert_eq!(caches[llc].evict_address(0x4000, |_| false).unwrap(), Some((0, 1)));
    }

    /// L1_0 and L1_1 share L2_0, L1_2 sits on L2_1, both second levels share
    /// the llc. ids follow that order, the memory controller is 6.
    fn three_levels(inclusiveness: InclusivenessPolicy) -> (Vec<CacheMemory>, DirectoryController) {
        let mut caches = vec![
            CacheMemory::new(0, &cache_config("L1_0", 1, 8, 2), LINE).unwrap(),
            CacheMemory::new(1, &cache_config("L1_1", 1, 8, 2), LINE).unwrap(),
            CacheMemory::new(2, &cache_config("L2_0", 2, 16, 2), LINE).unwrap(),
            CacheMemory::new(3, &cache_config("L1_2", 1, 8, 2), LINE).unwrap(),
            CacheMemory::new(4, &cache_config("L2_1", 2, 16, 2), LINE).unwrap(),
            CacheMemory::new(5, &cache_config("LLC", 3, 64, 4), LINE).unwrap(),
        ];
        for (higher, lower) in [(0, 2), (1, 2), (3, 4), (2, 5), (4, 5)] {
            caches[higher].lower_level.push(lower);
            caches[lower].higher_level.push(higher);
        }
        let config = DirectoryConfig {
            inclusiveness,
            ..Default::default()
        };
        let dir = DirectoryController::new(&config, LINE, &caches, vec![6]);
        (caches, dir)
    }

    #[test]
    fn test_owner_two_levels_above_the_llc() {
        let (mut caches, mut dir) = three_levels(InclusivenessPolicy::NonInclusive);
        let x = 0x4000;
        caches[0].change_address(0, 0, x);
        caches[0].change_status(0, 0, ProtocolStatus::M);

        let mut p = core_request(10, 1, x, MemoryOperation::Read);
        assert_eq!(dir.treat_cache_request(&mut caches, 3, &mut p, 0).unwrap(), PackageState::Transmit);
        assert_eq!(p.id_dst, 4);
        assert_eq!(dir.treat_cache_request(&mut caches, 4, &mut p, 1).unwrap(), PackageState::Transmit);
        assert_eq!(p.id_dst, 5);
        // the llc finds the dirty copy behind L2_0 and takes the ownership
        assert_eq!(dir.treat_cache_request(&mut caches, 5, &mut p, 2).unwrap(), PackageState::Untreated);
        assert!(p.is_answer);
        assert_eq!(status_of(&caches, 0, x), ProtocolStatus::S);
        assert_eq!(status_of(&caches, 5, x), ProtocolStatus::O);
        assert_eq!(dir.directory_lines()[0].cache_requested, 3);
        assert_requesters_conserved(&dir);

        assert_eq!(dir.treat_cache_answer(&mut caches, 5, &mut p, 3).unwrap(), PackageState::Transmit);
        assert_eq!((p.id_src, p.id_dst), (5, 4));
        assert_eq!(dir.treat_cache_answer(&mut caches, 4, &mut p, 4).unwrap(), PackageState::Transmit);
        assert_eq!((p.id_src, p.id_dst), (4, 3));
        assert_eq!(dir.treat_cache_answer(&mut caches, 3, &mut p, 5).unwrap(), PackageState::Transmit);
        assert_eq!(p.id_dst, 10);
        assert!(dir.directory_lines().is_empty());
        for id in [0, 3, 4] {
            assert_eq!(status_of(&caches, id, x), ProtocolStatus::S);
        }
        assert_moesi_sound(&caches, x);
    }

    #[test]
    fn test_middle_level_takes_writeback_over_valid_line() {
        let (mut caches, mut dir) = three_levels(InclusivenessPolicy::NonInclusive);
        // L2_0 set 0 is full of clean lines
        for (way, addr) in [(0, 0x1400), (1, 0x1800)] {
            caches[2].change_address(0, way, addr);
            caches[2].change_status(0, way, ProtocolStatus::S);
            caches[2].update_last_access(0, way, 3 + way as u64);
        }
        for (way, addr) in [(0, 0x1000), (1, 0x1100)] {
            caches[0].change_address(0, way, addr);
            caches[0].change_status(0, way, ProtocolStatus::M);
            caches[0].update_last_access(0, way, 5 + way as u64);
        }
        let mut p = core_request(10, 1, 0x1200, MemoryOperation::Read);
        assert_eq!(dir.treat_cache_request(&mut caches, 0, &mut p, 10).unwrap(), PackageState::Transmit);
        let (_, wb) = caches[0]
            .mshr_born_ordered()
            .find(|(_, p)| p.memory_operation == MemoryOperation::Writeback)
            .unwrap();
        let mut wb = wb.clone();
        assert_eq!((wb.memory_address, wb.id_dst), (0x1000, 2));

        assert_eq!(dir.treat_cache_request(&mut caches, 2, &mut wb, 50).unwrap(), PackageState::Ready);
        assert_eq!(status_of(&caches, 2, 0x1000), ProtocolStatus::O);
        assert_eq!(status_of(&caches, 2, 0x1400), ProtocolStatus::I);
        assert_eq!(caches[2].line(0, 0).last_access, 50);
        assert_eq!(caches[2].stat.eviction, 1);
        assert_eq!(caches[2].stat.writeback, 0);
        assert!(!dir.is_locked(0x1000));
        assert_moesi_sound(&caches, 0x1000);
    }

    #[test]
    fn test_inclusive_all_back_invalidates_first_level() {
        let (mut caches, mut dir) = three_levels(InclusivenessPolicy::InclusiveAll);
        let y = 0x1000;
        // L2_0 kept y's tag after a write invalidated it, L1_0 holds the dirty copy
        caches[2].change_address(0, 0, y);
        caches[2].update_last_access(0, 0, 1);
        caches[2].change_address(0, 1, 0x1400);
        caches[2].change_status(0, 1, ProtocolStatus::S);
        caches[2].update_last_access(0, 1, 5);
        caches[0].change_address(0, 0, y);
        caches[0].change_status(0, 0, ProtocolStatus::M);

        let mut p = core_request(11, 1, 0x1800, MemoryOperation::Read);
        assert_eq!(dir.treat_cache_request(&mut caches, 1, &mut p, 20).unwrap(), PackageState::Transmit);
        assert_eq!(p.id_dst, 2);
        assert_eq!(dir.treat_cache_request(&mut caches, 2, &mut p, 21).unwrap(), PackageState::Transmit);
        assert_eq!(p.id_dst, 5);

        assert_eq!(status_of(&caches, 0, y), ProtocolStatus::I);
        assert_eq!(caches[0].stat.invalidation, 1);
        assert_eq!(caches[2].stat.writeback, 1);
        assert!(dir.is_locked(y));
        let (_, wb) = caches[2]
            .mshr_born_ordered()
            .find(|(_, p)| p.memory_operation == MemoryOperation::Writeback)
            .unwrap();
        assert_eq!((wb.memory_address, wb.id_dst), (y, 5));
        assert_eq!(caches[2].line(0, 0).tag, 0x1800);
        assert_moesi_sound(&caches, y);
    }

    #[test]
    fn test_dead_or_lru_victim_on_miss() {
        let mut config = cache_config("L1_0", 1, 8, 2);
        config.replacement = ReplacementPolicy::DeadOrLru;
        let mut caches = vec![
            CacheMemory::new(0, &config, LINE).unwrap(),
            CacheMemory::new(1, &cache_config("LLC", 2, 64, 4), LINE).unwrap(),
        ];
        caches[0].lower_level.push(1);
        caches[1].higher_level.push(0);
        let mut dir = DirectoryController::new(&DirectoryConfig::default(), LINE, &caches, vec![2]);
        caches[0].predictor = Box::new(DeadWay(0));
        for (way, addr, last) in [(0, 0x1000, 5), (1, 0x1100, 1)] {
            caches[0].change_address(0, way, addr);
            caches[0].change_status(0, way, ProtocolStatus::S);
            caches[0].update_last_access(0, way, last);
        }

        let mut p = core_request(3, 1, 0x1200, MemoryOperation::Read);
        assert_eq!(dir.treat_cache_request(&mut caches, 0, &mut p, 10).unwrap(), PackageState::Transmit);
        // the dead way goes before the least recently used one
        assert_eq!(caches[0].line(0, 0).tag, 0x1200);
        assert_eq!(status_of(&caches, 0, 0x1100), ProtocolStatus::S);
        assert_eq!(caches[0].stat.eviction, 1);
        assert_eq!(caches[0].stat.writeback, 0);
    }
}
