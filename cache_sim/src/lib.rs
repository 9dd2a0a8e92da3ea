mod bin;
pub mod cache_line;
pub mod cache_memory;
pub mod common;
pub mod config;
pub mod directory;
pub mod directory_line;
pub mod error;
pub mod line_usage_predictor;
pub mod main_memory;
pub mod package;
pub mod prefetch;
pub mod sim;
pub mod trace;

#[cfg(feature = "stat")]
pub mod stat;
