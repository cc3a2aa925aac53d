//! Ready-made subscriber sinks
//!
//! Provides two consumers of a multiplexer:
//! - [`ChannelSink`]: every event forwarded into a bounded channel
//! - [`BatchedClient`]: events buffered and flushed in batches, oldest
//!   dropped when the consumer falls behind

pub mod batched;
pub mod channel;

pub use batched::{BatchedClient, ClientEvent};
pub use channel::{ChannelSink, SinkMessage};
