//! Subscribers and their registry
//!
//! The multiplexer never owns subscriber application state, only the
//! registration entry: an id, a sink, and an optional shard filter.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::SinkError;
use crate::event::{ShardEvent, ShardId};

/// Subscriber identifier, unique within one multiplexer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Create a new subscriber id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Consumer side of a subscription
///
/// Called from the multiplexer task, so implementations must not block.
/// A sink must not call back into its own multiplexer and wait for the
/// result; spawn a task for that instead.
pub trait EventSink: Send + Sync + 'static {
    /// Deliver one event.
    ///
    /// [`SinkError::Closed`] removes the subscriber;
    /// [`SinkError::Backpressure`] drops this event for this subscriber.
    fn deliver(&self, event: &ShardEvent) -> Result<(), SinkError>;

    /// The stream ended or was torn down; no more events will follow.
    fn on_disconnect(&self) {}
}

/// Outcome of delivering one event to one subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sink accepted the event
    Delivered,
    /// Event came from a shard outside the subscriber's filter
    Filtered,
    /// Sink was full; event dropped for this subscriber
    Dropped,
    /// Sink closed or panicked; subscriber must be removed
    Failed,
}

/// A registration entry
#[derive(Clone)]
pub struct Subscription {
    /// Subscriber id
    pub id: SubscriberId,
    /// Where events are pushed
    pub sink: Arc<dyn EventSink>,
    /// Only deliver events from these shards (all shards if `None`)
    pub shard_filter: Option<HashSet<ShardId>>,
}

impl Subscription {
    /// Create a subscription receiving events from every shard
    pub fn new(id: impl Into<SubscriberId>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id: id.into(),
            sink,
            shard_filter: None,
        }
    }

    /// Restrict delivery to the given shards
    pub fn with_shard_filter(mut self, shards: impl IntoIterator<Item = ShardId>) -> Self {
        self.shard_filter = Some(shards.into_iter().collect());
        self
    }

    /// Check whether the subscriber wants events from `shard`
    pub fn accepts(&self, shard: &ShardId) -> bool {
        self.shard_filter
            .as_ref()
            .map_or(true, |filter| filter.contains(shard))
    }

    /// Deliver `event`, isolating sink errors and panics
    pub fn deliver(&self, event: &ShardEvent) -> Delivery {
        if !self.accepts(&event.shard) {
            return Delivery::Filtered;
        }

        match catch_unwind(AssertUnwindSafe(|| self.sink.deliver(event))) {
            Ok(Ok(())) => Delivery::Delivered,
            Ok(Err(SinkError::Backpressure)) => Delivery::Dropped,
            Ok(Err(SinkError::Closed)) => Delivery::Failed,
            Err(_) => {
                tracing::warn!(subscriber = %self.id, "Sink panicked during delivery");
                Delivery::Failed
            }
        }
    }

    /// Tell the sink the stream is over, isolating panics
    pub fn notify_disconnect(&self) {
        if catch_unwind(AssertUnwindSafe(|| self.sink.on_disconnect())).is_err() {
            tracing::warn!(subscriber = %self.id, "Sink panicked in on_disconnect");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("shard_filter", &self.shard_filter)
            .finish()
    }
}

/// Subscribers of one multiplexer, in registration order
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    entries: Vec<Subscription>,
}

impl SubscriberRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Returns false if the id was already present.
    pub fn add(&mut self, subscription: Subscription) -> bool {
        if self.contains(&subscription.id) {
            return false;
        }
        self.entries.push(subscription);
        true
    }

    /// Remove a subscriber if present. Returns whether the registry is now
    /// empty.
    pub fn remove(&mut self, id: &SubscriberId) -> bool {
        self.entries.retain(|entry| &entry.id != id);
        self.entries.is_empty()
    }

    /// Check if `id` is registered
    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.entries.iter().any(|entry| &entry.id == id)
    }

    /// Number of subscribers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no subscribers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the current entries, in registration order
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries.clone()
    }

    /// Call `f` for each subscriber in a snapshot taken up front, so the
    /// registry may be changed while iterating.
    pub fn for_each(&self, mut f: impl FnMut(&Subscription)) {
        for entry in self.snapshot() {
            f(&entry);
        }
    }

    /// Ids in registration order
    pub fn ids(&self) -> Vec<SubscriberId> {
        self.entries.iter().map(|entry| entry.id.clone()).collect()
    }

    /// Remove and return every subscriber
    pub fn drain(&mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.entries)
    }
}
