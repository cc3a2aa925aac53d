//! Multiplexer registry
//!
//! The registry maps targets to their live multiplexer so clients watching
//! the same target share one upstream connection per shard.
//!
//! # Architecture
//!
//! ```text
//!                        MultiplexerRegistry
//!                  ┌──────────────────────────────┐
//!                  │ multiplexers: HashMap<Target,│
//!                  │   StreamMultiplexer {        │
//!                  │     shards, subscribers      │
//!                  │   }                          │
//!                  │ >                            │
//!                  └──────────────┬───────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!    [Shard n1]              [Subscriber]            [Subscriber]
//!    MONITOR stream          sink.deliver()          sink.deliver()
//!         │                       ▲                       ▲
//!         └──► multiplexer task ──┴───────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! Entries are created by the first subscribe and removed by the
//! multiplexer itself when it ends, before the call that ended it returns.

pub mod config;
pub mod store;

pub use config::RegistryConfig;
pub use store::MultiplexerRegistry;
