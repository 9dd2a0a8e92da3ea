use std::{collections::HashMap, fmt::Display};

use anyhow::{anyhow, Result};
use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{anychar, hex_digit1, space0, space1, u64 as dec_u64},
    combinator::{eof, map_opt, map_res, opt},
    sequence::preceded,
    IResult,
};
use once_cell::sync::Lazy;

use crate::{
    cache_memory::WaitStat,
    common::{CacheId, ComponentId, MemoryOperation, NUM_MEMORY_OPERATIONS},
    error::ProtocolError,
    package::MemoryPackage,
};

pub const DEFAULT_ACCESS_SIZE: u32 = 8;

static OPERATION_LOOKUP: Lazy<HashMap<char, MemoryOperation>> = Lazy::new(|| {
    HashMap::from([
        ('R', MemoryOperation::Read),
        ('W', MemoryOperation::Write),
        ('I', MemoryOperation::Inst),
        ('P', MemoryOperation::Prefetch),
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    pub operation: MemoryOperation,
    pub address: u64,
    pub size: u32,
    pub pc: u64,
}

impl Display for TraceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:#x} {} {:#x}", self.operation, self.address, self.size, self.pc)
    }
}

/// memory accesses of one core, in program order.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn parse(trace_str: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (n, line) in trace_str.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default();
            if line.trim().is_empty() {
                continue;
            }
            let (_, entry) = TraceParser::entry(line)
                .map_err(|e| anyhow!("failed to parse line {}: {e}", n + 1))?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<TraceEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct TraceParser;

impl TraceParser {
    fn number(input: &str) -> IResult<&str, u64> {
        alt((
            map_res(preceded(tag_no_case("0x"), hex_digit1), |h| {
                u64::from_str_radix(h, 16)
            }),
            dec_u64,
        ))(input)
    }

    fn operation(input: &str) -> IResult<&str, MemoryOperation> {
        map_opt(anychar, |c| {
            OPERATION_LOOKUP.get(&c.to_ascii_uppercase()).copied()
        })(input)
    }

    fn entry(input: &str) -> IResult<&str, TraceEntry> {
        let (input, _) = space0(input)?;
        let (input, operation) = Self::operation(input)?;
        let (input, _) = space1(input)?;
        let (input, address) = Self::number(input)?;
        let (input, size) = opt(preceded(
            space1,
            map_res(Self::number, |n: u64| u32::try_from(n)),
        ))(input)?;
        let (input, pc) = opt(preceded(space1, Self::number))(input)?;
        let (input, _) = space0(input)?;
        let (input, _) = eof(input)?;
        Ok((
            input,
            TraceEntry {
                operation,
                address,
                size: size.unwrap_or(DEFAULT_ACCESS_SIZE),
                pc: pc.unwrap_or(0),
            },
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreStat {
    pub issued: [u64; NUM_MEMORY_OPERATIONS],
    pub answers: u64,
    /// cycles the first level cache refused the next access.
    pub rejected: u64,
    /// cycles a read spent blocked on the outstanding limit.
    pub outstanding_full: u64,
    pub latency: WaitStat,
}

/// replays a [`Trace`] into its first level caches.
///
/// at most one access leaves per cycle. writes are posted, everything else
/// holds an outstanding slot until its answer comes back.
pub struct TraceCore {
    pub id: ComponentId,
    pub label: String,
    data_cache: CacheId,
    inst_cache: CacheId,
    trace: Trace,
    next: usize,
    opcode_number: u64,
    max_outstanding: usize,
    /// (opcode number, issue cycle)
    outstanding: Vec<(u64, u64)>,
    pub stat: CoreStat,
}

impl TraceCore {
    pub fn new(
        id: ComponentId,
        label: String,
        data_cache: CacheId,
        inst_cache: CacheId,
        max_outstanding: usize,
        trace: Trace,
    ) -> Self {
        Self {
            id,
            label,
            data_cache,
            inst_cache,
            trace,
            next: 0,
            opcode_number: 1,
            max_outstanding: max_outstanding.max(1),
            outstanding: Vec::new(),
            stat: Default::default(),
        }
    }

    /// the access this core wants to issue at `now`, already addressed to its cache.
    pub fn next_request(&mut self, now: u64) -> Option<MemoryPackage> {
        let entry = self.trace.entries.get(self.next)?;
        if entry.operation != MemoryOperation::Write && self.outstanding.len() >= self.max_outstanding {
            self.stat.outstanding_full += 1;
            return None;
        }
        let dst = if entry.operation == MemoryOperation::Inst {
            self.inst_cache
        } else {
            self.data_cache
        };
        let mut package = MemoryPackage::request(
            self.id,
            self.opcode_number,
            entry.pc,
            0,
            entry.address,
            entry.size,
            entry.operation,
            now,
        );
        package.package_set_src_dst(self.id, dst);
        Some(package)
    }

    /// the package from [`Self::next_request`] was admitted by the cache.
    pub fn request_sent(&mut self, package: &MemoryPackage, now: u64) {
        self.stat.issued[package.memory_operation.index()] += 1;
        if package.memory_operation != MemoryOperation::Write {
            self.outstanding.push((package.opcode_number, now));
        }
        self.next += 1;
        self.opcode_number += 1;
    }

    pub fn request_rejected(&mut self) {
        self.stat.rejected += 1;
    }

    pub fn receive_package(&mut self, package: &MemoryPackage, now: u64) -> Result<bool, ProtocolError> {
        let pending = self
            .outstanding
            .iter()
            .position(|&(opcode, _)| opcode == package.opcode_number);
        let (true, true, Some(pending)) = (package.is_answer, package.id_dst == self.id, pending) else {
            return Err(ProtocolError::UnwantedAnswer {
                component: self.id,
                package: package.to_string(),
            });
        };
        let (_, issued) = self.outstanding.swap_remove(pending);
        self.stat.answers += 1;
        self.stat.latency.add(now.saturating_sub(issued));
        Ok(true)
    }

    pub fn is_finished(&self) -> bool {
        self.next >= self.trace.len() && self.outstanding.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.next, self.trace.len())
    }
}

#[cfg(feature = "stat")]
pub mod stat {
    use std::fmt;

    use super::{CoreStat, TraceCore};
    use crate::{
        common::MemoryOperation,
        stat::{AddStats, Stat, StatView, Stats},
    };

    pub struct LabeledCoreStat {
        pub label: String,
        pub stat: CoreStat,
    }

    impl Stat for LabeledCoreStat {
        fn view(&self) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ LabeledCoreStat {
        fn header(&self) -> String {
            format!("core {}", self.label)
        }
        fn width(&self) -> usize {
            40
        }
    }

    impl fmt::Display for &'_ LabeledCoreStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = &self.stat;
            for op in [
                MemoryOperation::Read,
                MemoryOperation::Inst,
                MemoryOperation::Write,
                MemoryOperation::Prefetch,
            ] {
                writeln!(f, "  {:<10} {:>16}", op.to_string(), s.issued[op.index()])?;
            }
            writeln!(f, "  answers:    {:>16}", s.answers)?;
            writeln!(f, "  rejected:   {:>16}", s.rejected)?;
            writeln!(f, "  stalled:    {:>16}", s.outstanding_full)?;
            write!(
                f,
                "  latency:    avg {:.2} max {}",
                s.latency.average(),
                s.latency.max
            )
        }
    }

    impl AddStats for TraceCore {
        fn add_stats(&self, buf: &mut Stats) {
            buf.push(Box::new(LabeledCoreStat {
                label: self.label.clone(),
                stat: self.stat.clone(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let trace = Trace::parse(
            "# warm up\n\
             R 0x1000\n\
             w 4096 4 0x400 # store\n\
             \n\
             I 0x2000 16\n\
             P 0x3000 64 0x404\n",
        )
        .unwrap();
        assert_eq!(trace.len(), 4);
        assert_eq!(
            trace.entries[0],
            TraceEntry {
                operation: MemoryOperation::Read,
                address: 0x1000,
                size: DEFAULT_ACCESS_SIZE,
                pc: 0,
            }
        );
        assert_eq!(trace.entries[1].operation, MemoryOperation::Write);
        assert_eq!(trace.entries[1].address, 0x1000);
        assert_eq!((trace.entries[1].size, trace.entries[1].pc), (4, 0x400));
        assert_eq!(trace.entries[2].size, 16);
        assert_eq!(trace.entries[3].operation, MemoryOperation::Prefetch);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Trace::parse("X 0x10").is_err());
        assert!(Trace::parse("R").is_err());
        assert!(Trace::parse("R 0x10 8 0x4 junk").is_err());
        let e = Trace::parse("R 0x10\nR zz").unwrap_err();
        assert!(e.to_string().contains("line 2"));
    }

    fn core(entries: &str, max_outstanding: usize) -> TraceCore {
        TraceCore::new(10, "core0".to_string(), 0, 1, max_outstanding, Trace::parse(entries).unwrap())
    }

    #[test]
    fn test_issue_and_answer() {
        let mut c = core("R 0x40\nI 0x80\nW 0xc0", 2);
        let p = c.next_request(0).unwrap();
        assert_eq!((p.id_src, p.id_dst, p.opcode_number), (10, 0, 1));
        c.request_sent(&p, 0);

        let i = c.next_request(1).unwrap();
        assert_eq!(i.id_dst, 1);
        c.request_sent(&i, 1);

        // writes are posted even with every slot taken
        let w = c.next_request(2).unwrap();
        c.request_sent(&w, 2);
        assert!(c.next_request(3).is_none());
        assert_eq!(c.outstanding(), 2);
        assert!(!c.is_finished());

        let mut answer = p.clone();
        answer.is_answer = true;
        answer.package_set_src_dst(0, 10);
        assert!(c.receive_package(&answer, 12).unwrap());
        let mut answer = i.clone();
        answer.is_answer = true;
        answer.package_set_src_dst(1, 10);
        assert!(c.receive_package(&answer, 20).unwrap());
        assert!(c.is_finished());
        assert_eq!(c.stat.latency.max, 19);
        assert!(c.receive_package(&answer, 21).is_err());
    }

    #[test]
    fn test_outstanding_limit() {
        let mut c = core("R 0x40\nR 0x80", 1);
        let p = c.next_request(0).unwrap();
        c.request_sent(&p, 0);
        assert!(c.next_request(1).is_none());
        assert_eq!(c.stat.outstanding_full, 1);
    }
}
