use std::fmt::Display;

use crate::common::ProtocolStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheLine {
    pub tag: u64,
    pub status: ProtocolStatus,
    pub last_access: u64,
    pub usage_counter: u64,
}

impl CacheLine {
    pub fn new(tag: u64) -> Self {
        Self {
            tag,
            ..Default::default()
        }
    }
}

impl Display for CacheLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] tag:{:#x} last_access:{} usage:{}",
            self.status, self.tag, self.last_access, self.usage_counter
        )
    }
}

/// the ways of one set, in way order.
#[derive(Debug, Clone, Default)]
pub struct CacheSet {
    pub ways: Vec<CacheLine>,
}

impl CacheSet {
    pub fn new(ways: Vec<CacheLine>) -> Self {
        Self { ways }
    }
    pub fn associativity(&self) -> usize {
        self.ways.len()
    }
    pub fn is_clean(&self) -> bool {
        self.ways.iter().all(|l| l.status == ProtocolStatus::I)
    }
}
