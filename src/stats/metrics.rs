//! Statistics for multiplexers and their shards

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::event::{ShardId, TargetId};
use crate::mux::MultiplexerStatus;
use crate::shard::ShardStatus;

/// Running fan-out counters, owned by a multiplexer task
#[derive(Debug, Clone, Default)]
pub struct FanOutCounters {
    /// Events read from all shards
    pub events_received: u64,
    /// Successful sink deliveries (one event to N sinks counts N)
    pub events_delivered: u64,
    /// Deliveries dropped because a sink was full
    pub events_dropped: u64,
    /// Subscribers removed because their sink failed
    pub sink_failures: u64,
    /// Events read per shard
    per_shard: HashMap<ShardId, u64>,
}

impl FanOutCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an event read from `shard`
    pub fn record_received(&mut self, shard: &ShardId) {
        self.events_received += 1;
        *self.per_shard.entry(shard.clone()).or_insert(0) += 1;
    }

    /// Events read from `shard`
    pub fn shard_events(&self, shard: &ShardId) -> u64 {
        self.per_shard.get(shard).copied().unwrap_or(0)
    }
}

/// Per-shard statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    /// Shard id
    pub shard: ShardId,
    /// Connection status
    pub status: ShardStatus,
    /// Events read from this shard
    pub events: u64,
}

/// Snapshot of one multiplexer
#[derive(Debug, Clone)]
pub struct MultiplexerStats {
    /// Target being monitored
    pub target: TargetId,
    /// Instance id (changes when the multiplexer is recreated)
    pub instance_id: u64,
    /// Current status
    pub status: MultiplexerStatus,
    /// Number of registered subscribers
    pub subscriber_count: usize,
    /// Per-shard statistics, in connection order
    pub shards: Vec<ShardStats>,
    /// Fan-out counters
    pub counters: FanOutCounters,
    /// When the multiplexer was created
    pub created_at: Instant,
}

impl MultiplexerStats {
    /// Number of owned shard connections
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Time since the multiplexer was created
    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Events received per second since creation
    pub fn event_rate(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 {
            self.counters.events_received as f64 / secs
        } else {
            0.0
        }
    }
}
