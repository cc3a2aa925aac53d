//! Identifiers and the events that flow from shards to subscribers
//!
//! `ShardEvent` is designed to be cheap to clone: the payload is a
//! reference-counted `Bytes`, so every subscriber shares one allocation.

pub mod monitor;

use std::time::SystemTime;

use bytes::Bytes;

pub use monitor::{MonitorParseError, MonitorRecord};

/// Logical monitored entity (a database instance or a whole cluster)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(String);

impl TargetId {
    /// Create a new target id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One physical node of a target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(String);

impl ShardId {
    /// Create a shard id from a node id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a shard id from a host and port (`host:port`)
    pub fn node(host: impl AsRef<str>, port: u16) -> Self {
        Self(format!("{}:{}", host.as_ref(), port))
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An event produced by a shard, tagged with its origin
#[derive(Debug, Clone)]
pub struct ShardEvent {
    /// Shard that produced the event
    pub shard: ShardId,
    /// Position in the shard's stream, starting at 0
    pub sequence: u64,
    /// When the event was read from the shard
    pub received_at: SystemTime,
    /// Raw payload (one MONITOR line for Redis backends)
    pub data: Bytes,
}

impl ShardEvent {
    /// Create a new event
    pub fn new(shard: ShardId, sequence: u64, data: Bytes) -> Self {
        Self {
            shard,
            sequence,
            received_at: SystemTime::now(),
            data,
        }
    }

    /// Payload as UTF-8, if it is valid
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Parse the payload as a MONITOR line
    pub fn monitor_record(&self) -> Result<MonitorRecord, MonitorParseError> {
        let line = self.as_str().ok_or(MonitorParseError::InvalidUtf8)?;
        MonitorRecord::parse(line)
    }
}
