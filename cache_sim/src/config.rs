use std::{collections::HashMap, io::Read};

use anyhow::Result;
use serde::Deserialize;

use crate::{
    cache_memory::CacheMemory,
    common::{AddressMaskType, CacheId, InclusivenessPolicy, ReplacementPolicy},
    error::ConfigError,
    line_usage_predictor::LineUsagePredictorPolicy,
    prefetch::PrefetcherConfig,
};

/// the whole machine: cache hierarchy, memory controllers and trace cores.
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    pub line_size: u32,
    /// cycles between progress logs, `0` disables them.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u64,
    /// cycles between stale package checks, `0` disables them.
    #[serde(default = "default_periodic_check")]
    pub periodic_check: u64,
    #[serde(default = "default_max_alive_time")]
    pub max_alive_time: u64,
    #[serde(default = "one")]
    pub interconnect_latency: u64,
    #[serde(default)]
    pub directory: DirectoryConfig,
    pub caches: Vec<CacheConfig>,
    #[serde(default)]
    pub main_memory: MainMemoryConfig,
    pub cores: Vec<CoreConfig>,
}

fn one() -> u64 {
    1
}

fn yes() -> bool {
    true
}

fn default_heartbeat() -> u64 {
    100_000
}

fn default_periodic_check() -> u64 {
    10_000
}

fn default_max_alive_time() -> u64 {
    1_000_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub label: String,
    pub hierarchy_level: u32,
    #[serde(default)]
    pub bank_number: u32,
    #[serde(default = "one_bank")]
    pub total_banks: u32,
    #[serde(default)]
    pub address_mask: AddressMaskType,
    pub line_number: u32,
    pub associativity: u32,
    #[serde(default)]
    pub replacement: ReplacementPolicy,
    pub penalty_read: u64,
    pub penalty_write: u64,
    pub mshr_request_size: usize,
    pub mshr_writeback_size: usize,
    pub mshr_prefetch_size: usize,
    /// labels of the caches one level closer to main memory. empty for an LLC.
    #[serde(default)]
    pub lower_level: Vec<String>,
    #[serde(default)]
    pub prefetcher: PrefetcherConfig,
    #[serde(default)]
    pub line_usage_predictor: LineUsagePredictorPolicy,
    #[serde(default)]
    pub random_seed: u64,
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

fn one_bank() -> u32 {
    1
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            hierarchy_level: 1,
            bank_number: 0,
            total_banks: 1,
            address_mask: Default::default(),
            line_number: 64,
            associativity: 4,
            replacement: Default::default(),
            penalty_read: 1,
            penalty_write: 1,
            mshr_request_size: 4,
            mshr_writeback_size: 2,
            mshr_prefetch_size: 1,
            lower_level: Vec::new(),
            prefetcher: Default::default(),
            line_usage_predictor: Default::default(),
            random_seed: 0,
            throttle: Default::default(),
        }
    }
}

/// minimum cycles between two packages of the same class.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub send_answer: u64,
    pub send_request: u64,
    pub recv_answer: u64,
    pub recv_read: u64,
    pub recv_write: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            send_answer: 1,
            send_request: 1,
            recv_answer: 1,
            recv_read: 1,
            recv_write: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub inclusiveness: InclusivenessPolicy,
    #[serde(default = "yes")]
    pub generate_llc_writeback: bool,
    #[serde(default = "yes")]
    pub generate_non_llc_writeback: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            inclusiveness: Default::default(),
            generate_llc_writeback: true,
            generate_non_llc_writeback: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MainMemoryConfig {
    pub controllers: usize,
    /// cycles from admission to answer.
    pub latency: u64,
    pub buffer_size: usize,
    /// minimum cycles between two answers of one controller.
    pub send_latency: u64,
}

impl Default for MainMemoryConfig {
    fn default() -> Self {
        Self {
            controllers: 1,
            latency: 100,
            buffer_size: 16,
            send_latency: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    pub label: String,
    pub data_cache: String,
    /// defaults to `data_cache`.
    #[serde(default)]
    pub inst_cache: Option<String>,
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding_reads: usize,
}

fn default_max_outstanding() -> usize {
    4
}

impl SimConfig {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// id of the cache labelled `label`.
    pub fn cache_id(&self, label: &str) -> Result<CacheId, ConfigError> {
        self.caches
            .iter()
            .position(|c| c.label == label)
            .ok_or_else(|| ConfigError::UnknownCache(label.to_string()))
    }

    /// instantiate the cache arena and wire both directions of every edge.
    pub fn build_caches(&self) -> Result<Vec<CacheMemory>, ConfigError> {
        let mut seen = HashMap::new();
        for label in self
            .caches
            .iter()
            .map(|c| &c.label)
            .chain(self.cores.iter().map(|c| &c.label))
        {
            if seen.insert(label.as_str(), ()).is_some() {
                return Err(ConfigError::DuplicatedLabel(label.clone()));
            }
        }
        if self.main_memory.controllers == 0 {
            return Err(ConfigError::NoMemoryController);
        }
        let mut caches = self
            .caches
            .iter()
            .enumerate()
            .map(|(id, c)| CacheMemory::new(id, c, self.line_size))
            .collect::<Result<Vec<_>, _>>()?;
        for (id, c) in self.caches.iter().enumerate() {
            for label in &c.lower_level {
                let lower = self.cache_id(label)?;
                caches[id].lower_level.push(lower);
                caches[lower].higher_level.push(id);
            }
        }
        for core in &self.cores {
            for label in std::iter::once(&core.data_cache).chain(core.inst_cache.as_ref()) {
                let id = self.cache_id(label)?;
                if caches[id].hierarchy_level != 1 {
                    return Err(ConfigError::WrongHierarchyLevel(label.clone()));
                }
            }
        }
        Ok(caches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_LEVELS: &str = r#"{
        "line_size": 64,
        "caches": [
            {
                "label": "L1D", "hierarchy_level": 1,
                "line_number": 64, "associativity": 4,
                "penalty_read": 2, "penalty_write": 2,
                "mshr_request_size": 4, "mshr_writeback_size": 2, "mshr_prefetch_size": 1,
                "lower_level": ["LLC"]
            },
            {
                "label": "LLC", "hierarchy_level": 2,
                "line_number": 256, "associativity": 8, "replacement": "RANDOM",
                "penalty_read": 10, "penalty_write": 10,
                "mshr_request_size": 8, "mshr_writeback_size": 4, "mshr_prefetch_size": 1
            }
        ],
        "main_memory": { "controllers": 2, "latency": 50 },
        "cores": [ { "label": "core0", "data_cache": "L1D" } ]
    }"#;

    #[test]
    fn test_parse_and_wire() {
        let config = SimConfig::from_reader(TWO_LEVELS.as_bytes()).unwrap();
        assert_eq!(config.max_alive_time, 1_000_000);
        assert_eq!(config.main_memory.buffer_size, 16);
        assert!(config.directory.generate_llc_writeback);
        assert_eq!(config.caches[1].replacement, ReplacementPolicy::Random);
        assert_eq!(config.caches[0].throttle.recv_read, 1);
        assert_eq!(config.cores[0].max_outstanding_reads, 4);

        let caches = config.build_caches().unwrap();
        assert_eq!(caches[0].lower_level, vec![1]);
        assert_eq!(caches[1].higher_level, vec![0]);
        assert!(caches[1].is_last_level());
        assert!(!caches[0].is_last_level());
    }

    #[test]
    fn test_bad_wiring() {
        let mut config = SimConfig::from_reader(TWO_LEVELS.as_bytes()).unwrap();
        config.caches[0].lower_level = vec!["L3".to_string()];
        assert!(matches!(
            config.build_caches(),
            Err(ConfigError::UnknownCache(l)) if l == "L3"
        ));

        let mut config = SimConfig::from_reader(TWO_LEVELS.as_bytes()).unwrap();
        config.cores[0].data_cache = "LLC".to_string();
        assert!(matches!(
            config.build_caches(),
            Err(ConfigError::WrongHierarchyLevel(_))
        ));

        let mut config = SimConfig::from_reader(TWO_LEVELS.as_bytes()).unwrap();
        config.cores[0].label = "LLC".to_string();
        assert!(matches!(
            config.build_caches(),
            Err(ConfigError::DuplicatedLabel(_))
        ));

        let mut config = SimConfig::from_reader(TWO_LEVELS.as_bytes()).unwrap();
        config.main_memory.controllers = 0;
        assert!(matches!(
            config.build_caches(),
            Err(ConfigError::NoMemoryController)
        ));
    }
}
