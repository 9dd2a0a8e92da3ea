use thiserror::Error;

use crate::common::{CacheId, ComponentId, ReplacementPolicy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{label}: wrong line number ({line_number}) or associativity ({associativity})")]
    SetsNotPowerOfTwo {
        label: String,
        line_number: u32,
        associativity: u32,
    },
    #[error("line size {0} is not a power of two")]
    LineSizeNotPowerOfTwo(u32),
    #[error("{label}: wrong number of banks ({bank_number}/{total_banks})")]
    WrongBanks {
        label: String,
        bank_number: u32,
        total_banks: u32,
    },
    #[error("{label}: mshr {range} range should be bigger than zero")]
    EmptyMshrRange { label: String, range: &'static str },
    #[error("{label}: replacement policy {policy} not implemented")]
    UnimplementedReplacement {
        label: String,
        policy: ReplacementPolicy,
    },
    #[error("{0}: cannot use a multibanked cache with prefetch")]
    PrefetchOnBankedCache(String),
    #[error("{0}: prefetch degree should be at least 1")]
    ZeroPrefetchDegree(String),
    #[error("unknown cache label {0:?}")]
    UnknownCache(String),
    #[error("duplicated component label {0:?}")]
    DuplicatedLabel(String),
    #[error("there must be at least one memory controller")]
    NoMemoryController,
    #[error("{0}: first level caches must have hierarchy level 1")]
    WrongHierarchyLevel(String),
}

/// violations of the coherence model itself. no recovery is possible.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("cache {cache_id}: higher level request must have a directory line ({package})")]
    MissingDirectoryLine { cache_id: CacheId, package: String },
    #[error("cache {cache_id}: first level request must not have a directory line ({package})")]
    UnexpectedDirectoryLine { cache_id: CacheId, package: String },
    #[error("cache {cache_id}: wrong cache request order {found} (expected {expected})")]
    WrongRequestOrder {
        cache_id: CacheId,
        found: u32,
        expected: u32,
    },
    #[error("cache {cache_id}: could not find the previous requester of order {order}")]
    LostRequester { cache_id: CacheId, order: u32 },
    #[error("cache {cache_id}: line {address:#x} not found after it was installed")]
    LineVanished { cache_id: CacheId, address: u64 },
    #[error("cache {cache_id}: sending a writeback of an invalid line ({package})")]
    WritebackFromInvalidLine { cache_id: CacheId, package: String },
    #[error("cache {cache_id}: writeback received on the cache which started it")]
    WritebackLoop { cache_id: CacheId },
    #[error("cache {cache_id}: trying to evict a locked line with the requested tag {address:#x}")]
    EvictLockedTag { cache_id: CacheId, address: u64 },
    #[error("component {component}: received a not wanted package ({package})")]
    UnwantedAnswer {
        component: ComponentId,
        package: String,
    },
    #[error("component {component}: received a package for another destination ({package})")]
    WrongDestination {
        component: ComponentId,
        package: String,
    },
    #[error("cache {cache_id}: received a package of another bank ({package})")]
    WrongBank { cache_id: CacheId, package: String },
    #[error("cache {cache_id}: replacement policy {policy} not implemented")]
    UnsupportedReplacement {
        cache_id: CacheId,
        policy: ReplacementPolicy,
    },
    #[error("cache {cache_id}: no lower component owns {address:#x}")]
    NoRoute { cache_id: CacheId, address: u64 },
    #[error("no component with id {0}")]
    UnknownComponent(ComponentId),
}
