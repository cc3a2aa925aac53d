//! Fan-out of shard event streams to subscribers
//!
//! A [`StreamMultiplexer`] owns every shard connection of one target and
//! delivers each event to every registered [`EventSink`]. A sink that
//! fails is removed without affecting the others; when the last subscriber
//! leaves, the shards are disconnected and the multiplexer ends.

pub mod multiplexer;
pub mod state;
pub mod subscriber;

pub use multiplexer::StreamMultiplexer;
pub(crate) use multiplexer::EndHook;
pub use state::MultiplexerStatus;
pub use subscriber::{Delivery, EventSink, SubscriberId, SubscriberRegistry, Subscription};
