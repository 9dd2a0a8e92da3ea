use std::{collections::BTreeMap, fmt};

use crate::{
    cache_memory::{CacheMemory, CacheStat},
    common::{MemoryOperation, NUM_MEMORY_OPERATIONS},
};

/// one section of the end of run report.
pub trait Stat {
    fn view(&self) -> Box<dyn StatView + '_>;
}

pub trait StatView: fmt::Display {
    /// section title, e.g. `cache L1_0`
    fn header(&self) -> String;
    /// widest body line
    fn width(&self) -> usize;
}

/// components push their report sections in the order they are printed.
pub trait AddStats {
    fn add_stats(&self, buf: &mut Stats);
}

#[derive(Default)]
pub struct Stats {
    sections: Vec<Box<dyn Stat>>,
}

impl Stats {
    pub fn push(&mut self, stat: Box<dyn Stat>) {
        self.sections.push(stat)
    }
    pub fn len(&self) -> usize {
        self.sections.len()
    }
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
    /// separators are cut at `max_width`, usually the terminal width.
    pub fn view(&self, max_width: usize) -> StatReport<'_> {
        StatReport {
            max_width,
            views: self.sections.iter().map(|s| s.view()).collect(),
        }
    }
}

pub struct StatReport<'s> {
    max_width: usize,
    views: Vec<Box<dyn StatView + 's>>,
}

impl fmt::Display for StatReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .views
            .iter()
            .map(|s| s.header().len().max(s.width()))
            .max()
            .unwrap_or(24)
            .min(self.max_width.max(24));
        writeln!(f, "{:=^width$}", " cache hierarchy report ")?;
        for sv in &self.views {
            writeln!(f, "[{}]", sv.header())?;
            writeln!(f, "{sv}")?;
        }
        write!(f, "{:=<width$}", "")
    }
}

/// `part` as a percentage of `total`, `0` when there is nothing to divide.
pub fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// cache counters summed over every cache and bank of one hierarchy level.
///
/// final evictions and writebacks of the drain are folded into the totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelStat {
    pub level: u32,
    pub caches: usize,
    pub accesses: u64,
    pub hit: [u64; NUM_MEMORY_OPERATIONS],
    pub miss: [u64; NUM_MEMORY_OPERATIONS],
    pub invalidation: u64,
    pub eviction: u64,
    pub writeback: u64,
}

impl LevelStat {
    /// one entry per level present, lowest level number first.
    pub fn by_level<'a>(stats: impl IntoIterator<Item = (u32, &'a CacheStat)>) -> Vec<LevelStat> {
        let mut levels: BTreeMap<u32, LevelStat> = BTreeMap::new();
        for (level, stat) in stats {
            levels
                .entry(level)
                .or_insert_with(|| LevelStat {
                    level,
                    ..Default::default()
                })
                .absorb(stat);
        }
        levels.into_values().collect()
    }

    fn absorb(&mut self, s: &CacheStat) {
        self.caches += 1;
        self.accesses += s.accesses;
        for i in 0..NUM_MEMORY_OPERATIONS {
            self.hit[i] += s.hit[i];
            self.miss[i] += s.miss[i];
        }
        self.invalidation += s.invalidation;
        self.eviction += s.eviction + s.final_eviction;
        self.writeback += s.writeback + s.final_writeback;
    }

    pub fn hit_rate(&self) -> f64 {
        percent(self.hit.iter().sum(), self.accesses)
    }
}

impl Stat for LevelStat {
    fn view(&self) -> Box<dyn StatView + '_> {
        Box::new(self)
    }
}

impl StatView for &'_ LevelStat {
    fn header(&self) -> String {
        format!("hierarchy level {} ({} caches)", self.level, self.caches)
    }
    fn width(&self) -> usize {
        48
    }
}

impl fmt::Display for &'_ LevelStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  accesses: {:>12} (hit rate {:>6.2}%)",
            self.accesses,
            self.hit_rate()
        )?;
        for op in MemoryOperation::ALL {
            let i = op.index();
            if self.hit[i] + self.miss[i] == 0 {
                continue;
            }
            writeln!(f, "  {:<10} hit {:>10} miss {:>10}", op.to_string(), self.hit[i], self.miss[i])?;
        }
        write!(
            f,
            "  eviction {} writeback {} invalidation {}",
            self.eviction, self.writeback, self.invalidation
        )
    }
}

impl AddStats for [CacheMemory] {
    fn add_stats(&self, buf: &mut Stats) {
        let levels = LevelStat::by_level(self.iter().map(|c| (c.hierarchy_level, &c.stat)));
        for level in levels {
            buf.push(Box::new(level));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_summed() {
        let mut l1_0 = CacheStat::default();
        l1_0.add_hit(MemoryOperation::Read);
        l1_0.add_miss(MemoryOperation::Write);
        l1_0.eviction = 2;
        let mut l1_1 = CacheStat::default();
        l1_1.add_hit(MemoryOperation::Read);
        l1_1.final_writeback = 1;
        let mut llc = CacheStat::default();
        llc.add_miss(MemoryOperation::Writeback);
        llc.invalidation = 3;

        let levels = LevelStat::by_level([(2, &llc), (1, &l1_0), (1, &l1_1)]);
        assert_eq!(levels.len(), 2);
        let first = &levels[0];
        assert_eq!((first.level, first.caches, first.accesses), (1, 2, 3));
        assert_eq!(first.hit[MemoryOperation::Read.index()], 2);
        assert_eq!(first.miss[MemoryOperation::Write.index()], 1);
        assert_eq!((first.eviction, first.writeback), (2, 1));
        assert!((first.hit_rate() - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(levels[1].miss[MemoryOperation::Writeback.index()], 1);
        assert_eq!(levels[1].invalidation, 3);
    }

    #[test]
    fn test_report_layout() {
        let mut s = Stats::default();
        assert!(s.is_empty());
        let mut llc = CacheStat::default();
        llc.add_hit(MemoryOperation::Read);
        for level in LevelStat::by_level([(2, &llc)]) {
            s.push(Box::new(level));
        }
        assert_eq!(s.len(), 1);
        let out = s.view(80).to_string();
        assert!(out.contains(" cache hierarchy report "));
        assert!(out.contains("[hierarchy level 2 (1 caches)]\n  accesses:"));
        assert!(out.contains("hit rate 100.00%"));
        // operations nobody issued are left out
        assert!(!out.contains("PREFETCH"));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(3, 0), 0.0);
    }
}
