//! Error types
//!
//! Setup failures (`ConnectError`) are returned to whoever called
//! `subscribe`. Steady-state problems never surface here: they reach
//! subscribers through `EventSink::on_disconnect`.

use thiserror::Error;

use crate::event::{ShardId, TargetId};
use crate::mux::MultiplexerStatus;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A shard stream could not be established
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The multiplexer can no longer accept subscribers
    #[error(transparent)]
    Multiplex(#[from] MultiplexError),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure to open the monitoring stream on a shard
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The shard is unreachable or rejected the monitoring command
    #[error("shard {shard} unavailable: {reason}")]
    Unavailable { shard: ShardId, reason: String },

    /// The topology of the target could not be resolved
    #[error("cannot resolve shards of {target}: {reason}")]
    Topology { target: TargetId, reason: String },
}

impl ConnectError {
    /// Shorthand for [`ConnectError::Unavailable`]
    pub fn unavailable(shard: ShardId, reason: impl Into<String>) -> Self {
        ConnectError::Unavailable {
            shard,
            reason: reason.into(),
        }
    }
}

/// Error returned by a multiplexer that is past its usable lifetime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiplexError {
    /// Subscribe attempted on a multiplexer in `Error` or `End`
    #[error("multiplexer for {target} is unavailable (status: {status:?})")]
    Unavailable {
        target: TargetId,
        status: MultiplexerStatus,
    },
}

/// Failure reported by a subscriber sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The consumer is gone; the subscriber is removed
    #[error("sink closed")]
    Closed,

    /// The consumer is lagging; this event is dropped for it only
    #[error("sink is full")]
    Backpressure,
}

impl Error {
    /// True if this error is a multiplexer that already reached `End`
    pub fn is_ended(&self) -> bool {
        matches!(
            self,
            Error::Multiplex(MultiplexError::Unavailable {
                status: MultiplexerStatus::End,
                ..
            })
        )
    }
}
