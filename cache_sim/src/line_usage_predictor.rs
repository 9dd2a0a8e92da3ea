use serde::Deserialize;

use crate::package::MemoryPackage;

/// sub-block usage hooks consulted by the directory at fixed points.
///
/// `index`/`way` always name the line of the owning cache the call is about.
pub trait LineUsagePredictor {
    /// mark the bytes the request needs.
    fn fill_package_sub_blocks(&mut self, package: &mut MemoryPackage);
    /// copy the line sub-blocks into a writeback.
    fn line_sub_blocks_to_package(&mut self, package: &mut MemoryPackage, index: usize, way: usize);

    fn check_sub_block_is_hit(&self, package: &MemoryPackage, index: usize, way: usize) -> bool;
    fn check_line_is_disabled(&self, index: usize, way: usize) -> bool;
    fn check_line_is_last_access(&self, index: usize, way: usize) -> bool;
    fn check_line_is_last_write(&self, index: usize, way: usize) -> bool;

    fn line_hit(&mut self, package: &MemoryPackage, index: usize, way: usize);
    fn line_miss(&mut self, package: &mut MemoryPackage, index: usize, way: usize);
    fn sub_block_miss(&mut self, package: &mut MemoryPackage, index: usize, way: usize);
    fn line_send_writeback(&mut self, package: &MemoryPackage, index: usize, way: usize);
    fn line_recv_writeback(&mut self, package: &MemoryPackage, index: usize, way: usize);
    fn line_eviction(&mut self, index: usize, way: usize);
    fn line_invalidation(&mut self, index: usize, way: usize);

    fn stat(&self) -> PredictorStat;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineUsagePredictorPolicy {
    #[default]
    Disable,
}

impl LineUsagePredictorPolicy {
    pub fn build(self, line_size: u32) -> Box<dyn LineUsagePredictor> {
        match self {
            LineUsagePredictorPolicy::Disable => Box::new(DisabledPredictor::new(line_size)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictorStat {
    pub line_hit: u64,
    pub line_miss: u64,
    pub sub_block_miss: u64,
    pub send_writeback: u64,
    pub recv_writeback: u64,
    pub eviction: u64,
    pub invalidation: u64,
}

/// whole-line behaviour: every sub-block hits and no line is ever predicted dead.
pub struct DisabledPredictor {
    line_size: u32,
    stat: PredictorStat,
}

impl DisabledPredictor {
    pub fn new(line_size: u32) -> Self {
        Self {
            line_size,
            stat: Default::default(),
        }
    }
}

impl LineUsagePredictor for DisabledPredictor {
    fn fill_package_sub_blocks(&mut self, _: &mut MemoryPackage) {}

    fn line_sub_blocks_to_package(&mut self, _: &mut MemoryPackage, _: usize, _: usize) {}

    fn check_sub_block_is_hit(&self, _: &MemoryPackage, _: usize, _: usize) -> bool {
        true
    }
    fn check_line_is_disabled(&self, _: usize, _: usize) -> bool {
        false
    }
    fn check_line_is_last_access(&self, _: usize, _: usize) -> bool {
        false
    }
    fn check_line_is_last_write(&self, _: usize, _: usize) -> bool {
        false
    }

    fn line_hit(&mut self, _: &MemoryPackage, _: usize, _: usize) {
        self.stat.line_hit += 1;
    }
    fn line_miss(&mut self, package: &mut MemoryPackage, _: usize, _: usize) {
        self.stat.line_miss += 1;
        package.memory_size = self.line_size;
    }
    fn sub_block_miss(&mut self, package: &mut MemoryPackage, _: usize, _: usize) {
        self.stat.sub_block_miss += 1;
        package.memory_size = self.line_size;
    }
    fn line_send_writeback(&mut self, _: &MemoryPackage, _: usize, _: usize) {
        self.stat.send_writeback += 1;
    }
    fn line_recv_writeback(&mut self, _: &MemoryPackage, _: usize, _: usize) {
        self.stat.recv_writeback += 1;
    }
    fn line_eviction(&mut self, _: usize, _: usize) {
        self.stat.eviction += 1;
    }
    fn line_invalidation(&mut self, _: usize, _: usize) {
        self.stat.invalidation += 1;
    }

    fn stat(&self) -> PredictorStat {
        self.stat
    }
}

#[cfg(feature = "stat")]
pub mod stat {
    use std::fmt;

    use super::PredictorStat;
    use crate::stat::{Stat, StatView};

    pub struct PredictorStatView<'a> {
        label: String,
        stat: &'a PredictorStat,
    }

    pub struct LabeledPredictorStat {
        pub label: String,
        pub stat: PredictorStat,
    }

    impl Stat for LabeledPredictorStat {
        fn view(&self) -> Box<dyn StatView + '_> {
            Box::new(PredictorStatView {
                label: format!("{} line usage predictor", self.label),
                stat: &self.stat,
            })
        }
    }

    impl StatView for PredictorStatView<'_> {
        fn header(&self) -> String {
            self.label.clone()
        }
        fn width(&self) -> usize {
            33
        }
    }

    impl fmt::Display for PredictorStatView<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = self.stat;
            writeln!(f, "  line hit:       {:>16}", s.line_hit)?;
            writeln!(f, "  line miss:      {:>16}", s.line_miss)?;
            writeln!(f, "  sub-block miss: {:>16}", s.sub_block_miss)?;
            writeln!(f, "  send writeback: {:>16}", s.send_writeback)?;
            writeln!(f, "  recv writeback: {:>16}", s.recv_writeback)?;
            writeln!(f, "  eviction:       {:>16}", s.eviction)?;
            write!(f, "  invalidation:   {:>16}", s.invalidation)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// whole-line predictor that flags one way of every set as dead.
    pub struct DeadWay(pub usize);

    impl LineUsagePredictor for DeadWay {
        fn fill_package_sub_blocks(&mut self, _: &mut MemoryPackage) {}
        fn line_sub_blocks_to_package(&mut self, _: &mut MemoryPackage, _: usize, _: usize) {}
        fn check_sub_block_is_hit(&self, _: &MemoryPackage, _: usize, _: usize) -> bool {
            true
        }
        fn check_line_is_disabled(&self, _: usize, _: usize) -> bool {
            false
        }
        fn check_line_is_last_access(&self, _: usize, way: usize) -> bool {
            way == self.0
        }
        fn check_line_is_last_write(&self, _: usize, _: usize) -> bool {
            false
        }
        fn line_hit(&mut self, _: &MemoryPackage, _: usize, _: usize) {}
        fn line_miss(&mut self, _: &mut MemoryPackage, _: usize, _: usize) {}
        fn sub_block_miss(&mut self, _: &mut MemoryPackage, _: usize, _: usize) {}
        fn line_send_writeback(&mut self, _: &MemoryPackage, _: usize, _: usize) {}
        fn line_recv_writeback(&mut self, _: &MemoryPackage, _: usize, _: usize) {}
        fn line_eviction(&mut self, _: usize, _: usize) {}
        fn line_invalidation(&mut self, _: usize, _: usize) {}
        fn stat(&self) -> PredictorStat {
            Default::default()
        }
    }
}
