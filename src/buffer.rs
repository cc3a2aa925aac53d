//! Bounded event buffer
//!
//! Caps memory when a consumer is slower than the producers: once the
//! buffer is full, the oldest events are evicted so it always holds the most
//! recent `capacity` events in insertion order.
//!
//! Evictions are counted so a consumer can tell that it lost data (see
//! [`BoundedEventBuffer::take_evicted`]).

use std::collections::VecDeque;

/// Default capacity, matching the live monitor view's item cap
pub const DEFAULT_BUFFER_CAPACITY: usize = 5000;

/// Fixed-capacity, insertion-ordered buffer that drops the oldest entries
#[derive(Debug, Clone)]
pub struct BoundedEventBuffer<T> {
    /// Maximum number of events held
    capacity: usize,
    /// Buffered events, oldest first
    events: VecDeque<T>,
    /// Events evicted since the last `take_evicted()`
    evicted: u64,
}

impl<T> BoundedEventBuffer<T> {
    /// Create a buffer with the default capacity (5000)
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a buffer holding at most `capacity` events (clamped to >= 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            // Don't reserve the whole capacity up front; most buffers stay small
            events: VecDeque::with_capacity(capacity.min(1024)),
            evicted: 0,
        }
    }

    /// Append an event, evicting from the front if over capacity
    pub fn push(&mut self, event: T) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.evicted += 1;
        }
        self.events.push_back(event);
    }

    /// Append a batch of events
    ///
    /// A batch at least as large as the capacity replaces the contents with
    /// its last `capacity` events in one step.
    pub fn push_batch(&mut self, events: Vec<T>) {
        if events.len() >= self.capacity {
            let skip = events.len() - self.capacity;
            self.evicted += (self.events.len() + skip) as u64;
            self.events.clear();
            self.events.extend(events.into_iter().skip(skip));
            return;
        }

        let overflow = (self.events.len() + events.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.events.drain(..overflow);
            self.evicted += overflow as u64;
        }
        self.events.extend(events);
    }

    /// Remove and return all buffered events, oldest first
    pub fn drain(&mut self) -> Vec<T> {
        self.events.drain(..).collect()
    }

    /// Clear the buffer and its eviction count
    pub fn reset(&mut self) {
        self.events.clear();
        self.evicted = 0;
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of events held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate over buffered events, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.events.iter()
    }

    /// Events evicted since the last `take_evicted()`
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Return the eviction count and reset it to zero
    pub fn take_evicted(&mut self) -> u64 {
        std::mem::take(&mut self.evicted)
    }

    /// Fill level as a percentage
    pub fn utilization(&self) -> f32 {
        (self.events.len() as f32 / self.capacity as f32) * 100.0
    }
}

impl<T> Default for BoundedEventBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
