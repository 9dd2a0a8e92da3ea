use std::{collections::BTreeMap, fmt};

use thiserror::Error;

use crate::{
    cache_memory::{CacheMemory, PackageSink},
    common::{ComponentId, ProtocolStatus},
    config::SimConfig,
    directory::{DirectoryController, EvictAllCursor},
    error::{ConfigError, ProtocolError},
    main_memory::MemoryController,
    package::MemoryPackage,
    trace::{Trace, TraceCore},
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl RuntimeError {
    pub fn level(&self) -> RuntimeErrorLevel {
        RuntimeErrorLevel::Fatal
    }
}

pub enum RuntimeErrorLevel {
    /// cannot restart, but program need not halt
    Fatal,
}

impl RuntimeErrorLevel {
    /// Returns `true` if the runtime error level is [`Fatal`].
    ///
    /// [`Fatal`]: RuntimeErrorLevel::Fatal
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal)
    }
}

type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// memory controllers and cores, as seen from a cache sending a package.
struct Outside<'a> {
    memory: &'a mut [MemoryController],
    cores: &'a mut [TraceCore],
    latency: u64,
}

impl PackageSink for Outside<'_> {
    fn interconnect_latency(&self) -> u64 {
        self.latency
    }

    fn deliver(&mut self, package: &MemoryPackage, now: u64) -> Result<bool, ProtocolError> {
        let dst = package.id_dst;
        if let Some(memory) = self.memory.iter_mut().find(|m| m.id == dst) {
            return memory.receive_package(package, now, self.latency);
        }
        if let Some(core) = self.cores.iter_mut().find(|c| c.id == dst) {
            return core.receive_package(package, now);
        }
        Err(ProtocolError::UnknownComponent(dst))
    }
}

/// the whole machine and its clock.
///
/// component ids are laid out as caches first (so a cache id indexes the
/// arena), then memory controllers, then cores.
pub struct Simulation {
    cycle: u64,
    heartbeat: u64,
    periodic_check: u64,
    max_alive_time: u64,
    interconnect_latency: u64,
    caches: Vec<CacheMemory>,
    directory: DirectoryController,
    memory: Vec<MemoryController>,
    cores: Vec<TraceCore>,
    drain: Option<EvictAllCursor>,
    drained: bool,
    fatal_error: Option<RuntimeError>,
    #[cfg(feature = "stat")]
    stat_builder: stat::SimStatBuilder,
}

impl Simulation {
    /// one trace per configured core, in order.
    pub fn new(config: &SimConfig, traces: Vec<Trace>) -> Result<Self> {
        if traces.len() != config.cores.len() {
            return Err(anyhow::anyhow!(
                "{} traces given for {} cores",
                traces.len(),
                config.cores.len()
            )
            .into());
        }
        let caches = config.build_caches()?;
        let first_memory = caches.len();
        let memory: Vec<_> = (0..config.main_memory.controllers)
            .map(|i| MemoryController::new(first_memory + i, format!("mem{i}"), &config.main_memory))
            .collect();
        let first_core = first_memory + memory.len();
        let cores = config
            .cores
            .iter()
            .zip(traces)
            .enumerate()
            .map(|(i, (core, trace))| {
                let data_cache = config.cache_id(&core.data_cache)?;
                let inst_cache = match &core.inst_cache {
                    Some(label) => config.cache_id(label)?,
                    None => data_cache,
                };
                log::info!("{}: {} accesses", core.label, trace.len());
                Ok(TraceCore::new(
                    first_core + i,
                    core.label.clone(),
                    data_cache,
                    inst_cache,
                    core.max_outstanding_reads,
                    trace,
                ))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let directory = DirectoryController::new(
            &config.directory,
            config.line_size,
            &caches,
            memory.iter().map(|m| m.id).collect(),
        );
        log::info!(
            "{} caches ({} last level), {} memory controllers, {} cores",
            caches.len(),
            directory.llc_caches().len(),
            memory.len(),
            cores.len()
        );
        Ok(Self {
            cycle: 0,
            heartbeat: config.heartbeat,
            periodic_check: config.periodic_check,
            max_alive_time: config.max_alive_time,
            interconnect_latency: config.interconnect_latency,
            caches,
            directory,
            memory,
            cores,
            drain: None,
            drained: false,
            fatal_error: None,
            #[cfg(feature = "stat")]
            stat_builder: stat::SimStatBuilder::new(),
        })
    }

    #[cfg(feature = "stat")]
    pub fn collect_stat(&self) -> Stats {
        let mut ss = Stats::default();
        self.add_stats(&mut ss);
        ss
    }
}

#[cfg(feature = "stat")]
impl AddStats for Simulation {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat_builder.finish(self.cycle, self.drained)));
        self.directory.add_stats(buf);
        self.caches[..].add_stats(buf);
        for cache in &self.caches {
            cache.add_stats(buf);
        }
        for memory in &self.memory {
            memory.add_stats(buf);
        }
        for core in &self.cores {
            core.add_stats(buf);
        }
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::{fmt, time};

    use crate::stat::{Stat, StatView};

    pub struct SimStatBuilder {
        begin: time::Instant,
        elapsed: Option<time::Duration>,
    }

    impl SimStatBuilder {
        pub fn new() -> Self {
            Self {
                begin: time::Instant::now(),
                elapsed: None,
            }
        }
        pub fn stop_timer(&mut self) {
            self.elapsed = Some(time::Instant::now() - self.begin)
        }
        pub fn finish(&self, cycle: u64, drained: bool) -> SimStat {
            SimStat {
                cycle,
                drained,
                elapsed: self.elapsed.unwrap_or_else(|| self.begin.elapsed()),
            }
        }
    }

    pub struct SimStat {
        cycle: u64,
        drained: bool,
        elapsed: time::Duration,
    }

    impl Stat for SimStat {
        fn view(&self) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ SimStat {
        fn header(&self) -> String {
            "simulator stat".to_string()
        }
        fn width(&self) -> usize {
            33
        }
    }

    impl fmt::Display for &'_ SimStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let ms = format!("{} ms", self.elapsed.as_millis());
            writeln!(f, "  elapsed total: {ms:>9}")?;
            let cycle = format!("#{}", self.cycle);
            writeln!(f, "  cycles total: {cycle:>10}")?;
            write!(f, "  drained: {:>15}", self.drained)
        }
    }
}

pub enum ExecuteMode {
    /// until every trace is replayed and the hierarchy drained.
    Run,
    RunStep(u64),
    /// stop the cores and flush every cache.
    Drain,
}

impl fmt::Display for ExecuteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteMode::Run => write!(f, "run"),
            ExecuteMode::RunStep(n) => write!(f, "step {n}"),
            ExecuteMode::Drain => write!(f, "drain"),
        }
    }
}

pub struct SimulationOption {
    pub mode: ExecuteMode,
    /// line addresses whose status is reported on every break.
    pub watchings: Vec<u64>,
    /// give up after this many cycles of the current call.
    pub max_cycles: Option<u64>,
}

impl SimulationOption {
    pub fn new(mode: ExecuteMode) -> Self {
        Self {
            mode,
            watchings: Vec::new(),
            max_cycles: None,
        }
    }
}

pub enum ControlFlow {
    Break(OnBreak),
    Exit,
}

pub enum ExitCode {
    Success,
    Failure,
}

impl ExitCode {
    /// Returns `true` if the exit code is [`Success`].
    ///
    /// [`Success`]: ExitCode::Success
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl ControlFlow {
    pub fn exit_code(&self) -> Option<ExitCode> {
        if let Self::Exit = self {
            Some(ExitCode::Success)
        } else if let Self::Break(OnBreak {
            reason: BreakReason::CannotRestart | BreakReason::Failed,
            ..
        }) = self
        {
            Some(ExitCode::Failure)
        } else {
            None
        }
    }
}

pub enum BreakReason {
    CannotRestart,
    Failed,
    StepEnded,
    CycleLimit,
}

pub struct OnBreak {
    pub watchings: WatchingValues,
    pub reason: BreakReason,
}

/// status of every watched line in every cache holding it.
#[derive(Default)]
pub struct WatchingValues {
    pub line_map: BTreeMap<u64, Vec<(String, ProtocolStatus)>>,
}

impl Simulation {
    fn gather_watchings(&self, watchings: &[u64]) -> WatchingValues {
        let mut values = WatchingValues::default();
        for &addr in watchings {
            let statuses = self
                .line_statuses(addr)
                .into_iter()
                .map(|(label, status)| (label.to_string(), status))
                .collect();
            values.line_map.insert(addr, statuses);
        }
        values
    }

    fn break_sim(&self, opt: &SimulationOption, reason: BreakReason) -> ControlFlow {
        ControlFlow::Break(OnBreak {
            watchings: self.gather_watchings(&opt.watchings),
            reason,
        })
    }

    cfg_if::cfg_if! {
        if #[cfg(feature = "stat")] {
            pub fn exit_sim(&mut self) {
                self.stat_builder.stop_timer();
                log::info!("simulation finished at cycle {}", self.cycle);
            }
        } else {
            pub fn exit_sim(&mut self) {
                log::info!("simulation finished at cycle {}", self.cycle);
            }
        }
    }

    /// flush the hierarchy from now on. cores stop issuing.
    pub fn start_drain(&mut self) {
        if self.drain.is_none() && !self.drained {
            log::info!("drain started at cycle {}", self.cycle);
            self.drain = Some(EvictAllCursor::new());
        }
    }

    pub fn single_cycle(&mut self, opt: &SimulationOption) -> ControlFlow {
        if self.fatal_error.is_some() {
            return self.break_sim(opt, BreakReason::CannotRestart);
        }
        if let ExecuteMode::Drain = opt.mode {
            self.start_drain();
        }
        let begin = self.cycle;
        let mut steps = 0;
        loop {
            if self.drained {
                self.exit_sim();
                return ControlFlow::Exit;
            }
            if let ExecuteMode::RunStep(n) = opt.mode {
                if steps >= n {
                    return self.break_sim(opt, BreakReason::StepEnded);
                }
            }
            if let Some(max) = opt.max_cycles {
                if self.cycle - begin >= max {
                    return self.break_sim(opt, BreakReason::CycleLimit);
                }
            }
            let now = self.cycle;
            if let Err(e) = self.cycle_one(now) {
                let e = RuntimeError::from(e);
                log::error!("cycle {now}: {e}");
                if e.level().is_fatal() {
                    self.fatal_error = Some(e)
                }
                return self.break_sim(opt, BreakReason::Failed);
            }
            self.cycle += 1;
            steps += 1;
        }
    }

    fn cycle_one(&mut self, now: u64) -> Result<(), ProtocolError> {
        let latency = self.interconnect_latency;

        if self.drain.is_none() {
            for core in &mut self.cores {
                let Some(package) = core.next_request(now) else {
                    continue;
                };
                let Some(cache) = self.caches.get_mut(package.id_dst) else {
                    return Err(ProtocolError::UnknownComponent(package.id_dst));
                };
                if cache.receive_package(&package, now, latency)? {
                    core.request_sent(&package, now);
                } else {
                    core.request_rejected();
                }
            }
        }

        for cache_id in 0..self.caches.len() {
            let mut outside = Outside {
                memory: &mut self.memory,
                cores: &mut self.cores,
                latency,
            };
            CacheMemory::clock(&mut self.caches, cache_id, &mut self.directory, &mut outside, now)?;
        }

        for memory in &mut self.memory {
            let Some(answer) = memory.ready_answer(now) else {
                continue;
            };
            let Some(cache) = self.caches.get_mut(answer.id_dst) else {
                return Err(ProtocolError::UnknownComponent(answer.id_dst));
            };
            if cache.receive_package(&answer, now, latency)? {
                memory.answer_sent(now);
            }
        }

        if self.drain.is_none() && !self.drained && self.cores.iter().all(TraceCore::is_finished) {
            self.start_drain();
        }
        if let Some(cursor) = self.drain.as_mut() {
            if self.directory.coherence_evict_all(&mut self.caches, cursor, now)?
                && self.memory.iter().all(MemoryController::is_idle)
            {
                log::info!("drain finished at cycle {now}");
                self.drain = None;
                self.drained = true;
            }
        }

        if self.periodic_check != 0 && now != 0 && now % self.periodic_check == 0 {
            self.check_health(now);
        }
        if self.heartbeat != 0 && now != 0 && now % self.heartbeat == 0 {
            let (issued, total) = self
                .cores
                .iter()
                .map(TraceCore::progress)
                .fold((0, 0), |(a, b), (i, t)| (a + i, b + t));
            log::info!(
                "cycle {now}: {issued}/{total} accesses issued, {} directory lines",
                self.directory.directory_lines().len()
            );
        }
        Ok(())
    }

    fn check_health(&self, now: u64) {
        self.directory.check_age(now, self.max_alive_time);
        for cache in &self.caches {
            for package in cache.stale_packages(now, self.max_alive_time) {
                log::warn!("{}: mshr entry older than {} cycles: {package}", cache.label, self.max_alive_time);
            }
        }
        for memory in &self.memory {
            for package in memory.pending().filter(|p| !p.check_age(now, self.max_alive_time)) {
                log::warn!("{}: request older than {} cycles: {package}", memory.label, self.max_alive_time);
            }
        }
    }

    /// every cache holding `addr` in a valid status.
    pub fn line_statuses(&self, addr: u64) -> Vec<(&str, ProtocolStatus)> {
        self.caches
            .iter()
            .filter_map(|c| {
                let status = c.line_status(addr);
                (status != ProtocolStatus::I).then_some((c.label.as_str(), status))
            })
            .collect()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn caches(&self) -> &[CacheMemory] {
        &self.caches
    }

    pub fn cache_by_label(&self, label: &str) -> Option<&CacheMemory> {
        self.caches.iter().find(|c| c.label == label)
    }

    pub fn directory(&self) -> &DirectoryController {
        &self.directory
    }

    pub fn memory_controllers(&self) -> &[MemoryController] {
        &self.memory
    }

    pub fn cores(&self) -> &[TraceCore] {
        &self.cores
    }

    pub fn component_label(&self, id: ComponentId) -> Option<&str> {
        if let Some(c) = self.caches.get(id) {
            return Some(&c.label);
        }
        self.memory
            .iter()
            .map(|m| (m.id, &m.label))
            .chain(self.cores.iter().map(|c| (c.id, &c.label)))
            .find(|(i, _)| *i == id)
            .map(|(_, l)| l.as_str())
    }

    pub fn get_error_msg(&self) -> Option<String> {
        self.fatal_error.as_ref().map(|e| format!("{e}"))
    }
}
