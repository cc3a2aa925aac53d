//! Registry configuration

use std::time::Duration;

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::error::{Error, Result};

/// Configuration shared by the registry, its multiplexers and clients
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Per-client bounded buffer capacity
    pub buffer_capacity: usize,

    /// Command mailbox capacity of each multiplexer task
    pub mailbox_capacity: usize,

    /// Queue between shard connections and their multiplexer
    pub shard_queue_capacity: usize,

    /// Time allowed for one shard to accept the monitoring command
    pub connect_timeout: Duration,

    /// Upper bound on waiting for a shard stream to stop
    pub disconnect_timeout: Duration,

    /// How often batched clients flush to their consumer
    pub flush_interval: Duration,

    /// Capacity of the channel behind each client
    pub client_queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            mailbox_capacity: 64,
            shard_queue_capacity: 1024,
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(2),
            flush_interval: Duration::from_millis(100),
            client_queue_capacity: 256,
        }
    }
}

impl RegistryConfig {
    /// Set the client buffer capacity
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the multiplexer mailbox capacity
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Set the shard event queue capacity
    pub fn shard_queue_capacity(mut self, capacity: usize) -> Self {
        self.shard_queue_capacity = capacity;
        self
    }

    /// Set the per-shard connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the disconnect timeout
    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the batched client flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the client channel capacity
    pub fn client_queue_capacity(mut self, capacity: usize) -> Self {
        self.client_queue_capacity = capacity;
        self
    }

    /// Reject zero capacities and zero durations
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("buffer_capacity", self.buffer_capacity),
            ("mailbox_capacity", self.mailbox_capacity),
            ("shard_queue_capacity", self.shard_queue_capacity),
            ("client_queue_capacity", self.client_queue_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }

        let durations = [
            ("connect_timeout", self.connect_timeout),
            ("disconnect_timeout", self.disconnect_timeout),
            ("flush_interval", self.flush_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }
}
