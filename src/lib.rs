//! Live monitor fan-out
//!
//! Shares the live command stream of a backend target (a standalone server
//! or every node of a cluster) between any number of subscribers. Each
//! target is monitored once, whatever the number of clients watching it.
//!
//! ```text
//!   subscribe(S, T)
//!        │
//!        ▼
//!   MultiplexerRegistry ── get-or-create ──► StreamMultiplexer(T)
//!                                                │ connect all shards (Wait only)
//!                           ┌────────────────────┼────────────────────┐
//!                           ▼                    ▼                    ▼
//!                    ShardConnection n1   ShardConnection n2   ShardConnection n3
//!                           └──────── ShardEvent (tagged) ────────────┘
//!                                                │
//!                           ┌────────────────────┼────────────────────┐
//!                           ▼                    ▼                    ▼
//!                      EventSink S1         EventSink S2        BatchedClient S3
//! ```
//!
//! The last unsubscribe disconnects every shard and removes the target from
//! the registry; the next subscribe starts from scratch.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use monitor_mux::client::{BatchedClient, ClientEvent};
//! use monitor_mux::event::TargetId;
//! use monitor_mux::registry::MultiplexerRegistry;
//! use monitor_mux::shard::ShardClient;
//!
//! # async fn example(backend: Arc<dyn ShardClient>) -> monitor_mux::error::Result<()> {
//! let registry = MultiplexerRegistry::new();
//! let target = TargetId::new("cache-cluster");
//!
//! let (client, mut batches) = BatchedClient::new("profiler-1", registry.config());
//! registry.subscribe(&target, &backend, client.subscription()).await?;
//!
//! while let Some(ClientEvent::Batch { events, dropped }) = batches.recv().await {
//!     for event in events {
//!         println!("[{}] {}", event.shard, event.as_str().unwrap_or("<binary>"));
//!     }
//!     if dropped > 0 {
//!         println!("... {dropped} events dropped");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod error;
pub mod event;
pub mod mux;
pub mod registry;
pub mod shard;
pub mod stats;

#[cfg(test)]
mod testing;

pub use buffer::BoundedEventBuffer;
pub use error::{Error, Result};
pub use event::{ShardEvent, ShardId, TargetId};
pub use mux::{EventSink, StreamMultiplexer, Subscription};
pub use registry::{MultiplexerRegistry, RegistryConfig};
pub use shard::ShardClient;
