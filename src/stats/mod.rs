//! Statistics

pub mod metrics;

pub use metrics::{FanOutCounters, MultiplexerStats, ShardStats};
