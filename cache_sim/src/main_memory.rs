use std::collections::VecDeque;

use crate::{
    cache_memory::WaitStat,
    common::{ComponentId, MemoryOperation, PackageState, NUM_MEMORY_OPERATIONS},
    config::MainMemoryConfig,
    error::ProtocolError,
    package::MemoryPackage,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStat {
    pub requests: [u64; NUM_MEMORY_OPERATIONS],
    pub answers: u64,
    pub full_queue: u64,
    /// transaction age when its answer leaves the controller.
    pub age: WaitStat,
}

/// fixed latency DRAM channel behind the last level caches.
///
/// requests are answered in arrival order. writebacks are absorbed on arrival.
pub struct MemoryController {
    pub id: ComponentId,
    pub label: String,
    latency: u64,
    capacity: usize,
    send_latency: u64,
    send_ready_cycle: u64,
    queue: VecDeque<MemoryPackage>,
    pub stat: MemoryStat,
}

impl MemoryController {
    pub fn new(id: ComponentId, label: String, config: &MainMemoryConfig) -> Self {
        Self {
            id,
            label,
            latency: config.latency,
            capacity: config.buffer_size.max(1),
            send_latency: config.send_latency,
            send_ready_cycle: 0,
            queue: VecDeque::new(),
            stat: Default::default(),
        }
    }

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
        if package.is_answer {
            return Err(ProtocolError::UnwantedAnswer {
                component: self.id,
                package: package.to_string(),
            });
        }
        if package.memory_operation == MemoryOperation::Writeback {
            self.stat.requests[package.memory_operation.index()] += 1;
            return Ok(true);
        }
        if self.queue.len() >= self.capacity {
            self.stat.full_queue += 1;
            return Ok(false);
        }
        self.stat.requests[package.memory_operation.index()] += 1;
        let mut request = package.clone();
        request.package_wait(now, latency + self.latency);
        self.queue.push_back(request);
        Ok(true)
    }

    /// the answer due this cycle, if the channel is free.
    pub fn ready_answer(&self, now: u64) -> Option<MemoryPackage> {
        if self.send_ready_cycle > now {
            return None;
        }
        let request = self.queue.front().filter(|p| p.is_ready_at(now))?;
        let mut answer = request.clone();
        answer.is_answer = true;
        answer.package_set_src_dst(self.id, request.id_src);
        answer.state = PackageState::Transmit;
        Some(answer)
    }

    /// the answer returned by [`Self::ready_answer`] was accepted.
    pub fn answer_sent(&mut self, now: u64) {
        if let Some(request) = self.queue.pop_front() {
            self.stat.answers += 1;
            self.stat.age.add(now.saturating_sub(request.born_cycle));
            self.send_ready_cycle = now + self.send_latency;
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &MemoryPackage> {
        self.queue.iter()
    }
}

#[cfg(feature = "stat")]
pub mod stat {
    use std::fmt;

    use super::{MemoryController, MemoryStat};
    use crate::{
        common::MemoryOperation,
        stat::{AddStats, Stat, StatView, Stats},
    };

    pub struct LabeledMemoryStat {
        pub label: String,
        pub stat: MemoryStat,
    }

    impl Stat for LabeledMemoryStat {
        fn view(&self) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ LabeledMemoryStat {
        fn header(&self) -> String {
            format!("memory controller {}", self.label)
        }
        fn width(&self) -> usize {
            40
        }
    }

    impl fmt::Display for &'_ LabeledMemoryStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = &self.stat;
            for op in MemoryOperation::ALL {
                writeln!(f, "  {:<10} {:>16}", op.to_string(), s.requests[op.index()])?;
            }
            writeln!(f, "  answers:    {:>16}", s.answers)?;
            writeln!(f, "  full queue: {:>16}", s.full_queue)?;
            write!(f, "  age avg:    {:>16.2}", s.age.average())
        }
    }

    impl AddStats for MemoryController {
        fn add_stats(&self, buf: &mut Stats) {
            buf.push(Box::new(LabeledMemoryStat {
                label: self.label.clone(),
                stat: self.stat.clone(),
            }))
        }
    }
}
